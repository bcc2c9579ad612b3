//! Grid trading engine
//!
//! - [`config`] - Grid bounds, bracket and investment, validated on construction
//! - [`levels`] - Level prices and crossing detection
//! - [`types`] - Orders, reports, balances and statuses
//! - [`ledger`] - Order lifecycle with per-order operation exclusivity
//! - [`engine`] - Decisions: which levels to trade, when to halt
//! - [`snapshot`] - Read-only view published to observers
//! - [`runner`] - The task that owns the engine and talks to the exchange
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use grid_engine::grid::{GridConfig, GridEngine, GridRunner, RunnerConfig};
//!
//! let config = GridConfig::new(25_000.0, 30_000.0, 10, 1_000.0, 24_000.0, 31_000.0)?;
//! let engine = GridEngine::new("BTCUSDT", config)?;
//! let (runner, handle) = GridRunner::new(engine, exchange, RunnerConfig::default());
//!
//! tokio::spawn(runner.run());
//! let snapshot = handle.snapshot();
//! ```
//!
//! # Testing
//!
//! [`MockExchange`](crate::exchange::mock::MockExchange) stands in for the
//! exchange, so the whole loop can run under a paused tokio clock.

pub mod config;
pub mod engine;
pub mod ledger;
pub mod levels;
pub mod runner;
pub mod snapshot;
pub mod types;

pub use config::GridConfig;
pub use engine::{GridEngine, OrderIntent, PriceDecision};
pub use ledger::{OperationGuard, Order, OrderLedger, Transition};
pub use levels::{compute_levels, Crossing, Direction, LevelSet};
pub use runner::{CancelReport, EngineHandle, GridRunner, RunnerConfig};
pub use snapshot::EngineSnapshot;
pub use types::{
    Balance, EngineStatus, OrderReport, OrderRequest, OrderSide, OrderStatus,
};
