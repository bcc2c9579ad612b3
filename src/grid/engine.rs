//! Grid engine core - turns price observations into order intents
//!
//! The engine is synchronous and owns no I/O. The runner feeds it prices,
//! balances and exchange reports from a single task and carries out the
//! intents it returns, which keeps every mutation serialized.

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use super::config::GridConfig;
use super::ledger::{OperationGuard, Order, OrderLedger, Transition};
use super::levels::{compute_levels, LevelSet};
use super::snapshot::EngineSnapshot;
use super::types::{Balance, EngineStatus, OrderReport, OrderRequest, OrderSide, OrderStatus};
use crate::errors::{Error, ErrorBody, Result};

/// An order the engine wants placed at a grid level
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub level_index: usize,
    pub request: OrderRequest,
}

/// An intent already recorded as `Pending`, with its submission lock
#[derive(Debug)]
pub struct Placement {
    pub intent: OrderIntent,
    pub guard: OperationGuard,
}

/// What the runner must do after a price observation
#[derive(Debug)]
pub enum PriceDecision {
    /// Nothing to do
    Idle,
    /// Submit these placements
    Place(Vec<Placement>),
    /// The engine halted; cancel every listed order
    Halt { reason: String, cancels: Vec<Order> },
}

/// Generate a client order id accepted by the exchange (`[A-Za-z0-9_-]{1,36}`)
pub fn new_client_order_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("grid{}", &id[..24])
}

/// Grid engine state
#[derive(Debug)]
pub struct GridEngine {
    symbol: String,
    config: GridConfig,
    levels: LevelSet,
    ledger: OrderLedger,
    status: EngineStatus,
    last_price: Option<f64>,
    balance: Option<Balance>,
    last_error: Option<ErrorBody>,
    halt_reason: Option<String>,
}

impl GridEngine {
    pub fn new(symbol: impl Into<String>, config: GridConfig) -> Result<Self> {
        let levels = compute_levels(&config)?;
        let symbol = symbol.into();
        info!(
            "Grid for {}: {} levels from {} to {} (interval {})",
            symbol,
            levels.len(),
            config.lower_limit(),
            config.upper_limit(),
            levels.interval()
        );

        Ok(Self {
            symbol,
            config,
            levels,
            ledger: OrderLedger::new(),
            status: EngineStatus::Running,
            last_price: None,
            balance: None,
            last_error: None,
            halt_reason: None,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn levels(&self) -> &LevelSet {
        &self.levels
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn balance(&self) -> Option<Balance> {
        self.balance
    }

    pub fn last_error(&self) -> Option<&ErrorBody> {
        self.last_error.as_ref()
    }

    /// Replace the configuration and re-derive the level set
    ///
    /// Levels are computed before anything is swapped, so a failure leaves the
    /// previous configuration in force.
    pub fn update_config(&mut self, config: GridConfig) -> Result<()> {
        if !self.status.accepts_intents() {
            return Err(Error::Halted(format!(
                "configuration cannot change while {:?}",
                self.status
            )));
        }

        let levels = compute_levels(&config)?;
        info!(
            "Grid reconfigured: {} levels from {} to {}",
            levels.len(),
            config.lower_limit(),
            config.upper_limit()
        );
        self.config = config;
        self.levels = levels;

        let levels = &self.levels;
        let detached = self
            .ledger
            .relevel(|order| order.price.and_then(|p| levels.index_of(p)));
        if detached > 0 {
            warn!("{} live orders no longer sit on a grid level", detached);
        }
        Ok(())
    }

    /// React to a new price observation
    pub fn on_price(&mut self, price: f64) -> PriceDecision {
        if !price.is_finite() || price <= 0.0 {
            self.record_error(&Error::Protocol(format!("invalid price observation {price}")));
            return PriceDecision::Idle;
        }

        let previous = self.last_price.replace(price);
        if !self.status.accepts_intents() {
            return PriceDecision::Idle;
        }

        if price <= self.config.stop_loss() {
            let reason = format!("stop loss hit: price {} <= {}", price, self.config.stop_loss());
            let cancels = self.halt(reason.clone());
            return PriceDecision::Halt { reason, cancels };
        }
        if price >= self.config.take_profit() {
            let reason = format!("take profit hit: price {} >= {}", price, self.config.take_profit());
            let cancels = self.halt(reason.clone());
            return PriceDecision::Halt { reason, cancels };
        }

        let Some(previous) = previous else {
            debug!("First price observation {} for {}", price, self.symbol);
            return PriceDecision::Idle;
        };

        let quantity = self.config.order_quantity();
        let mut placements = Vec::new();
        for crossing in self.levels.crossings(previous, price) {
            let side = crossing.direction.order_side();
            if self.ledger.has_live_order_at(crossing.index, side) {
                debug!(
                    "Level {} @ {} already has a live {} order",
                    crossing.index, crossing.price, side
                );
                continue;
            }
            if quantity <= 0.0 {
                debug!("Level {} crossed but order quantity is {}", crossing.index, quantity);
                continue;
            }

            let intent = OrderIntent {
                level_index: crossing.index,
                request: OrderRequest::limit(
                    new_client_order_id(),
                    self.symbol.clone(),
                    side,
                    quantity,
                    crossing.price,
                ),
            };
            match self.ledger.submit(Order::pending(&intent.request, Some(crossing.index))) {
                Ok(guard) => {
                    info!(
                        "Intent: {} {} {} @ {} (level {}, id {})",
                        side,
                        quantity,
                        self.symbol,
                        crossing.price,
                        crossing.index,
                        intent.request.order_id
                    );
                    placements.push(Placement { intent, guard });
                }
                Err(e) => self.record_error(&e),
            }
        }

        if placements.is_empty() {
            PriceDecision::Idle
        } else {
            PriceDecision::Place(placements)
        }
    }

    /// Halt the run and return every order that must be cancelled
    ///
    /// The status flips before the orders are collected, so nothing observed
    /// afterwards can produce a new intent.
    pub fn halt(&mut self, reason: impl Into<String>) -> Vec<Order> {
        let reason = reason.into();
        if self.status == EngineStatus::Running {
            self.status = EngineStatus::Halted;
            warn!("Engine halted for {}: {}", self.symbol, reason);
            self.halt_reason = Some(reason);
        } else {
            debug!("Halt requested while {:?}: {}", self.status, reason);
        }
        self.ledger.live_orders()
    }

    /// Mark the scheduler as exited
    pub fn mark_stopped(&mut self) {
        self.status = EngineStatus::Stopped;
    }

    /// Apply an exchange-confirmed order state
    pub fn apply_report(&mut self, report: &OrderReport) -> Result<Option<Transition>> {
        let transition = self.ledger.apply(report)?;

        if let Some(t) = &transition {
            if t.to == OrderStatus::Filled {
                self.apply_fill(&t.order);
            }
        }
        Ok(transition)
    }

    fn apply_fill(&mut self, order: &Order) {
        let quantity = if order.executed_quantity > 0.0 {
            order.executed_quantity
        } else {
            order.quantity
        };
        let Some(price) = order.fill_price().or(self.last_price) else {
            warn!("Fill for {} has no price; balance left to next poll", order.order_id);
            return;
        };

        if let Some(balance) = self.balance.as_mut() {
            balance.apply_fill(order.side, quantity, price);
            debug!(
                "Balance after {} fill of {} @ {}: base {} quote {}",
                order.side, quantity, price, balance.base, balance.quote
            );
        }
    }

    /// Replace the balance with a freshly polled one
    pub fn on_balance(&mut self, balance: Balance) {
        self.balance = Some(balance);
    }

    /// Remember an error for operators
    pub fn record_error(&mut self, error: &Error) {
        self.last_error = Some(error.to_body());
    }

    /// Whether `side` at `level_index` has a live order
    pub fn is_level_occupied(&self, level_index: usize, side: OrderSide) -> bool {
        self.ledger.has_live_order_at(level_index, side)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            symbol: self.symbol.clone(),
            status: self.status,
            config: self.config.clone(),
            levels: self.levels.prices().to_vec(),
            last_price: self.last_price,
            balance: self.balance,
            open_orders: self.ledger.live_orders(),
            completed_orders: self.ledger.completed_orders(),
            last_error: self.last_error.clone(),
            halt_reason: self.halt_reason.clone(),
            published_at: Utc::now(),
        }
    }
}
