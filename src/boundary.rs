//! Credential boundary - decides where request signing happens
//!
//! Exactly one [`SigningMode`] is active per deployment:
//!
//! - **Trusted backend**: the API secret lives only in the signing proxy
//!   (`signing_proxy` binary). The engine holds the public API key and talks to
//!   the proxy through [`ProxyClient`]; the proxy enforces an operation
//!   [`AllowList`].
//! - **Direct**: the engine signs in-process with [`SigningClient`]. Refused
//!   for production environments.

use std::collections::HashSet;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::exchange::{Credentials, ExchangeAccess, ProxyClient, SigningClient, SigningClientConfig};

/// Exchange environment a deployment targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Testnet,
    Production,
}

/// Operations the signing proxy can perform on a caller's behalf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    GetPrice,
    GetBalance,
    PlaceOrder,
    CancelOrder,
    QueryOrder,
    ValidateCredentials,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::GetPrice,
        Operation::GetBalance,
        Operation::PlaceOrder,
        Operation::CancelOrder,
        Operation::QueryOrder,
        Operation::ValidateCredentials,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::GetPrice => "get_price",
            Operation::GetBalance => "get_balance",
            Operation::PlaceOrder => "place_order",
            Operation::CancelOrder => "cancel_order",
            Operation::QueryOrder => "query_order",
            Operation::ValidateCredentials => "validate_credentials",
        }
    }
}

/// Set of operations the proxy will forward
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<Operation>")]
pub struct AllowList(HashSet<Operation>);

impl From<Vec<Operation>> for AllowList {
    fn from(ops: Vec<Operation>) -> Self {
        Self(ops.into_iter().collect())
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::all()
    }
}

impl AllowList {
    pub fn all() -> Self {
        Self(Operation::ALL.into_iter().collect())
    }

    /// Read-only operations: prices, balances, order status, credential checks
    pub fn read_only() -> Self {
        Self::from(vec![
            Operation::GetPrice,
            Operation::GetBalance,
            Operation::QueryOrder,
            Operation::ValidateCredentials,
        ])
    }

    pub fn permits(&self, op: Operation) -> bool {
        self.0.contains(&op)
    }

    pub fn check(&self, op: Operation) -> Result<()> {
        if self.permits(op) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("operation {} is not allowed", op.as_str())))
        }
    }
}

/// Where the API secret lives for this deployment
#[derive(Debug, Clone)]
pub enum SigningMode {
    TrustedBackend {
        proxy_url: String,
        /// Public key presented to the proxy; never the secret
        api_key: String,
    },
    Direct {
        client: SigningClientConfig,
        credentials: Credentials,
    },
}

impl SigningMode {
    pub fn is_direct(&self) -> bool {
        matches!(self, SigningMode::Direct { .. })
    }
}

/// Build the single exchange implementation for this deployment
pub fn connect(mode: SigningMode, environment: Environment) -> Result<Arc<dyn ExchangeAccess>> {
    match mode {
        SigningMode::TrustedBackend { proxy_url, api_key } => {
            info!("Signing in trusted backend at {}", proxy_url);
            Ok(Arc::new(ProxyClient::new(proxy_url, api_key)?))
        }
        SigningMode::Direct { client, credentials } => {
            if environment == Environment::Production {
                return Err(Error::Forbidden(
                    "direct signing is limited to testnet; run the signing proxy for production".into(),
                ));
            }
            warn!(
                "DIRECT SIGNING MODE: the API secret is held in this process. Not for production use ({})",
                client.base_url
            );
            Ok(Arc::new(SigningClient::new(client, credentials)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct() -> SigningMode {
        SigningMode::Direct {
            client: SigningClientConfig::new("https://testnet.binance.vision", "BTC", "USDT"),
            credentials: Credentials::new("key", "s3cr3t-value"),
        }
    }

    #[test]
    fn test_direct_mode_refused_in_production() {
        let err = connect(direct(), Environment::Production).err().unwrap();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_direct_mode_on_testnet() {
        assert!(direct().is_direct());
        assert!(connect(direct(), Environment::Testnet).is_ok());
    }

    #[test]
    fn test_trusted_backend_in_production() {
        let mode = SigningMode::TrustedBackend {
            proxy_url: "http://127.0.0.1:8081".into(),
            api_key: "key".into(),
        };
        assert!(!mode.is_direct());
        assert!(connect(mode, Environment::Production).is_ok());
    }

    #[test]
    fn test_signing_mode_debug_hides_secret() {
        let debug = format!("{:?}", direct());
        assert!(!debug.contains("s3cr3t-value"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_allow_list() {
        let all = AllowList::default();
        assert!(Operation::ALL.iter().all(|op| all.permits(*op)));

        let read_only = AllowList::read_only();
        assert!(read_only.check(Operation::GetPrice).is_ok());
        assert!(matches!(read_only.check(Operation::PlaceOrder), Err(Error::Forbidden(_))));

        let parsed: AllowList = serde_json::from_str(r#"["get_price","cancel_order"]"#).unwrap();
        assert!(parsed.permits(Operation::CancelOrder));
        assert!(!parsed.permits(Operation::GetBalance));
    }
}
