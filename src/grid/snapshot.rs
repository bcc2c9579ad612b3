//! Read-only engine state published to operators

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::GridConfig;
use super::ledger::Order;
use super::types::{Balance, EngineStatus};
use crate::errors::ErrorBody;

/// Immutable view of the engine at one point in time
///
/// A new snapshot is built after every state change and replaces the
/// previous one wholesale; nothing inside is ever updated in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub symbol: String,
    pub status: EngineStatus,
    pub config: GridConfig,
    pub levels: Vec<f64>,
    pub last_price: Option<f64>,
    pub balance: Option<Balance>,
    /// Pending and open orders
    pub open_orders: Vec<Order>,
    /// Filled, cancelled and rejected orders
    pub completed_orders: Vec<Order>,
    pub last_error: Option<ErrorBody>,
    pub halt_reason: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl EngineSnapshot {
    pub fn is_halted(&self) -> bool {
        self.status == EngineStatus::Halted
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.len()
    }
}
