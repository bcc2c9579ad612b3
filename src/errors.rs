//! Error taxonomy shared by the grid engine, the exchange clients and the proxy surface

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::types::OrderStatus;

/// Exchange error codes that indicate a transient condition worth retrying
/// (disconnected upstream, request weight exceeded, order rate exceeded).
pub const TRANSIENT_EXCHANGE_CODES: [i64; 3] = [-1001, -1003, -1015];

/// Code the exchange answers a repeated client order id with ("Duplicate order sent.")
pub const DUPLICATE_ORDER_CODE: i64 = -2010;

/// Code reported when the exchange rate-limits at the HTTP layer without a parseable body
pub const RATE_LIMIT_CODE: i64 = -1003;

/// Errors produced anywhere between configuration and the exchange
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Operation already in progress for order {0}")]
    OperationInProgress(String),

    #[error("Illegal transition for order {order_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Engine halted: {0}")]
    Halted(String),

    #[error("Operation not permitted: {0}")]
    Forbidden(String),

    #[error("{} of {attempted} cancellations failed", .failed.len())]
    PartialCancellation {
        attempted: usize,
        failed: Vec<String>,
    },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Coarse error category, stable across the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfiguration,
    Network,
    Timeout,
    Authentication,
    Exchange,
    Protocol,
    OrderNotFound,
    OperationInProgress,
    IllegalTransition,
    Halted,
    Forbidden,
    PartialCancellation,
    ChannelClosed,
    Io,
}

/// Structured error object handed to operators and proxy callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{:?} ({}): {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            Error::Network(_) => ErrorKind::Network,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Exchange { .. } => ErrorKind::Exchange,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::OrderNotFound(_) => ErrorKind::OrderNotFound,
            Error::OperationInProgress(_) => ErrorKind::OperationInProgress,
            Error::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Error::Halted(_) => ErrorKind::Halted,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::PartialCancellation { .. } => ErrorKind::PartialCancellation,
            Error::ChannelClosed(_) => ErrorKind::ChannelClosed,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether a bounded retry may succeed.
    ///
    /// Timeouts and documented transient exchange codes qualify. Hard network
    /// failures, authentication and logic errors surface immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Exchange { code, .. } => TRANSIENT_EXCHANGE_CODES.contains(code),
            _ => false,
        }
    }

    /// Variant payload without the category prefix
    fn detail(&self) -> String {
        match self {
            Error::InvalidConfiguration(m)
            | Error::Network(m)
            | Error::Timeout(m)
            | Error::Authentication(m)
            | Error::Protocol(m)
            | Error::OrderNotFound(m)
            | Error::OperationInProgress(m)
            | Error::Halted(m)
            | Error::Forbidden(m)
            | Error::ChannelClosed(m)
            | Error::Io(m) => m.clone(),
            Error::Exchange { message, .. } => message.clone(),
            Error::IllegalTransition { .. } | Error::PartialCancellation { .. } => self.to_string(),
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.detail(),
            code: match self {
                Error::Exchange { code, .. } => Some(*code),
                _ => None,
            },
        }
    }

    /// Rebuild a typed error from a structured body received over the proxy
    pub fn from_body(body: ErrorBody) -> Self {
        let ErrorBody { kind, message, code } = body;
        match kind {
            ErrorKind::InvalidConfiguration => Error::InvalidConfiguration(message),
            ErrorKind::Network => Error::Network(message),
            ErrorKind::Timeout => Error::Timeout(message),
            ErrorKind::Authentication => Error::Authentication(message),
            ErrorKind::Exchange => Error::Exchange {
                code: code.unwrap_or_default(),
                message,
            },
            ErrorKind::Protocol => Error::Protocol(message),
            ErrorKind::OrderNotFound => Error::OrderNotFound(message),
            ErrorKind::OperationInProgress => Error::OperationInProgress(message),
            ErrorKind::Halted => Error::Halted(message),
            ErrorKind::Forbidden => Error::Forbidden(message),
            ErrorKind::ChannelClosed => Error::ChannelClosed(message),
            ErrorKind::Io => Error::Io(message),
            ErrorKind::IllegalTransition | ErrorKind::PartialCancellation => {
                Error::Protocol(format!("unexpected {kind:?} from proxy: {message}"))
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidConfiguration(err.to_string())
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
