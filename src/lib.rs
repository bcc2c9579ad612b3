pub mod boundary;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod grid;
pub mod runner;
pub mod server;

pub use boundary::{AllowList, Environment, Operation, SigningMode};
pub use errors::{Error, ErrorBody, ErrorKind, Result};
pub use exchange::{Credentials, ExchangeAccess, ProxyClient, RetryPolicy, SigningClient};
pub use grid::{EngineHandle, EngineSnapshot, GridConfig, GridEngine, GridRunner};
pub use runner::SessionRunner;
