use config::{Config, File, FileFormat};
pub use config::ConfigError;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::boundary::{AllowList, Environment, SigningMode};
use crate::errors::{Error, Result};
use crate::exchange::client::{default_price_decimals, default_quantity_decimals};
use crate::exchange::{Credentials, SigningClientConfig};
use crate::grid::runner::RunnerConfig;
use crate::grid::GridConfig;

const TESTNET_URL: &str = "https://testnet.binance.vision";
const PRODUCTION_URL: &str = "https://api.binance.com";

/// Main configuration struct
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Network configuration (environment, signing mode, endpoints)
    pub network: NetworkConfig,
    /// API credentials; the secret belongs only to the signing process
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Traded pair
    pub market: MarketConfig,
    /// Grid configuration, required by the engine binary
    #[serde(default)]
    pub grid: Option<GridConfig>,
    /// Poll intervals and retry policy
    #[serde(default)]
    pub engine: RunnerConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Status endpoint configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Signing proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Where signing happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    #[default]
    TrustedBackend,
    Direct,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// Environment: "testnet" or "production"
    #[serde(default)]
    pub environment: Environment,
    /// Mode: "trusted_backend" or "direct"
    #[serde(default)]
    pub mode: ModeKind,
    /// Exchange REST base URL; defaults per environment
    #[serde(default)]
    pub exchange_url: Option<String>,
    /// Signing proxy URL, required in trusted_backend mode
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_price_timeout_ms")]
    pub price_timeout_ms: u64,
    #[serde(default = "default_signed_timeout_ms")]
    pub signed_timeout_ms: u64,
}

fn default_recv_window_ms() -> u64 {
    5_000
}

fn default_price_timeout_ms() -> u64 {
    5_000
}

fn default_signed_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialsConfig {
    /// Public API key
    #[serde(default)]
    pub api_key: Option<String>,
    /// API secret; set it through APP_CREDENTIALS__API_SECRET rather than a file
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub api_secret: Option<SecretString>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

#[derive(Debug, Deserialize)]
pub struct MarketConfig {
    /// Base asset (e.g. "BTC")
    pub base_asset: String,
    /// Quote asset (e.g. "USDT")
    pub quote_asset: String,
    /// Tick size decimals for order prices
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    /// Lot step decimals for order quantities
    #[serde(default = "default_quantity_decimals")]
    pub quantity_decimals: u32,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Enable the status endpoint
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    /// Server port (default 3000)
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Server host (default 127.0.0.1)
    #[serde(default = "default_server_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            port: default_server_port(),
            host: default_server_host(),
        }
    }
}

fn default_server_enabled() -> bool {
    false
}

fn default_server_port() -> u16 {
    3000
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    /// Listen port (default 8081)
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// Listen host (default 127.0.0.1)
    #[serde(default = "default_server_host")]
    pub host: String,
    /// Operations the proxy forwards (default: all)
    #[serde(default)]
    pub allow: AllowList,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
            host: default_server_host(),
            allow: AllowList::default(),
        }
    }
}

fn default_proxy_port() -> u16 {
    8081
}

/// Environment overlay: `APP_<SECTION>__<KEY>`, e.g. `APP_CREDENTIALS__API_SECRET`
fn environment() -> config::Environment {
    config::Environment::with_prefix("APP")
        .prefix_separator("_")
        .separator("__")
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self> {
        Self::build(File::with_name(config_path))
    }

    /// Load settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Self::build(File::from_str(content, FileFormat::Toml))
    }

    fn build<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Self::build_with(source, environment())
    }

    fn build_with<S>(source: S, environment: config::Environment) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let s = Config::builder()
            .add_source(source)
            // Environment variables override the file
            .add_source(environment)
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Exchange symbol, e.g. "BTCUSDT"
    pub fn symbol(&self) -> String {
        format!("{}{}", self.market.base_asset, self.market.quote_asset)
    }

    pub fn exchange_url(&self) -> String {
        match (&self.network.exchange_url, self.network.environment) {
            (Some(url), _) => url.clone(),
            (None, Environment::Testnet) => TESTNET_URL.to_string(),
            (None, Environment::Production) => PRODUCTION_URL.to_string(),
        }
    }

    pub fn grid(&self) -> Result<&GridConfig> {
        self.grid
            .as_ref()
            .ok_or_else(|| Error::InvalidConfiguration("missing [grid] section".into()))
    }

    pub fn signing_client_config(&self) -> SigningClientConfig {
        SigningClientConfig {
            base_url: self.exchange_url(),
            base_asset: self.market.base_asset.clone(),
            quote_asset: self.market.quote_asset.clone(),
            recv_window_ms: self.network.recv_window_ms,
            price_timeout_ms: self.network.price_timeout_ms,
            signed_timeout_ms: self.network.signed_timeout_ms,
            price_decimals: self.market.price_decimals,
            quantity_decimals: self.market.quantity_decimals,
        }
    }

    fn api_key(&self) -> Result<String> {
        self.credentials
            .api_key
            .clone()
            .ok_or_else(|| Error::InvalidConfiguration("credentials.api_key is required".into()))
    }

    /// Full credentials, for the process that signs
    pub fn signing_credentials(&self) -> Result<Credentials> {
        let secret = self.credentials.api_secret.clone().ok_or_else(|| {
            Error::InvalidConfiguration("credentials.api_secret is required to sign".into())
        })?;
        Ok(Credentials::from_secret(self.api_key()?, secret))
    }

    /// Signing mode for the engine process
    ///
    /// In trusted-backend mode an `api_secret` in the engine's settings is an
    /// error: the secret must only exist in the signing proxy.
    pub fn engine_signing_mode(&self) -> Result<SigningMode> {
        match self.network.mode {
            ModeKind::TrustedBackend => {
                if self.credentials.api_secret.is_some() {
                    return Err(Error::InvalidConfiguration(
                        "api_secret must not be configured for the engine in trusted_backend mode; \
                         it belongs to the signing proxy"
                            .into(),
                    ));
                }
                let proxy_url = self.network.proxy_url.clone().ok_or_else(|| {
                    Error::InvalidConfiguration("network.proxy_url is required in trusted_backend mode".into())
                })?;
                Ok(SigningMode::TrustedBackend {
                    proxy_url,
                    api_key: self.api_key()?,
                })
            }
            ModeKind::Direct => Ok(SigningMode::Direct {
                client: self.signing_client_config(),
                credentials: self.signing_credentials()?,
            }),
        }
    }
}
