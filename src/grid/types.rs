//! Core data types for grid trading

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side for grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Convert to exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an order
///
/// `Pending` means submitted locally and awaiting exchange acknowledgment,
/// `Open` means resting on the book. The remaining three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal states are final; no transition leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Whether the order occupies its grid level (sent or resting)
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Check whether moving from `self` to `next` is a legal lifecycle step
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match self {
            OrderStatus::Pending => true,
            OrderStatus::Open => next != OrderStatus::Pending,
            _ => false,
        }
    }

    /// Map an exchange order status string onto the lifecycle
    pub fn from_exchange(status: &str) -> Option<Self> {
        match status {
            "PENDING_NEW" => Some(OrderStatus::Pending),
            "NEW" | "PARTIALLY_FILLED" => Some(OrderStatus::Open),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" | "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// Engine execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Normal grid operation
    Running,
    /// A bracket breach or operator stop halted trading; requires a restart
    Halted,
    /// Scheduler exited
    Stopped,
}

impl EngineStatus {
    /// Check if the engine may emit new order intents
    pub fn accepts_intents(&self) -> bool {
        matches!(self, EngineStatus::Running)
    }
}

/// Account balance for the traded pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Base asset quantity (e.g. BTC)
    pub base: f64,
    /// Quote asset quantity (e.g. USDT)
    pub quote: f64,
}

impl Balance {
    pub fn new(base: f64, quote: f64) -> Self {
        Self { base, quote }
    }

    /// Apply a confirmed fill
    pub fn apply_fill(&mut self, side: OrderSide, quantity: f64, price: f64) {
        match side {
            OrderSide::Buy => {
                self.base += quantity;
                self.quote -= quantity * price;
            }
            OrderSide::Sell => {
                self.base -= quantity;
                self.quote += quantity * price;
            }
        }
    }
}

/// Request to place an order on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-assigned order id, reused across retries of the same placement
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// Limit price; `None` places a market order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn limit(
        order_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        price: f64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            symbol: symbol.into(),
            side,
            quantity,
            price: Some(price),
        }
    }

    pub fn market(
        order_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            symbol: symbol.into(),
            side,
            quantity,
            price: None,
        }
    }
}

/// Order state as confirmed by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReport {
    /// Client order id
    pub order_id: String,
    /// Exchange-assigned numeric id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<u64>,
    pub status: OrderStatus,
    /// Quantity executed so far
    #[serde(default)]
    pub executed_quantity: f64,
    /// Average execution price, when the exchange reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_price: Option<f64>,
    pub reported_at: DateTime<Utc>,
}

impl OrderReport {
    pub fn new(order_id: impl Into<String>, status: OrderStatus) -> Self {
        Self {
            order_id: order_id.into(),
            exchange_order_id: None,
            status,
            executed_quantity: 0.0,
            average_price: None,
            reported_at: Utc::now(),
        }
    }

    pub fn with_exchange_id(mut self, id: u64) -> Self {
        self.exchange_order_id = Some(id);
        self
    }

    pub fn with_execution(mut self, quantity: f64, average_price: Option<f64>) -> Self {
        self.executed_quantity = quantity;
        self.average_price = average_price;
        self
    }
}
