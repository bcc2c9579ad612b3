use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};

use crate::boundary::{self, Environment};
use crate::config::Settings;
use crate::errors::{Error, Result};
use crate::exchange::{ExchangeAccess, SigningClient};
use crate::grid::runner::{GridRunner, RunnerConfig};
use crate::grid::GridEngine;
use crate::server::{self, ProxyState};

/// Wires settings to either the grid engine or the signing proxy
pub struct SessionRunner {
    settings: Settings,
}

impl SessionRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path.as_ref();
        let path = path
            .to_str()
            .ok_or_else(|| Error::InvalidConfiguration(format!("non UTF-8 config path {path:?}")))?;
        Ok(Self {
            settings: Settings::new(path)?,
        })
    }

    pub fn from_settings(settings: Settings) -> Self {
        Self { settings }
    }

    fn init_logging(&self) {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.settings.log.level);
        }
        env_logger::try_init().ok();
    }

    /// Run the grid engine until Ctrl-C or a fatal error
    pub async fn run_engine(self) -> Result<()> {
        self.init_logging();
        info!("Starting grid engine...");

        let settings = self.settings;
        let mode = settings.engine_signing_mode()?;
        let exchange = boundary::connect(mode, settings.network.environment)?;
        let engine = GridEngine::new(settings.symbol(), settings.grid()?.clone())?;
        let runner_config: RunnerConfig = settings.engine.clone();

        let (runner, handle) = GridRunner::new(engine, exchange, runner_config);

        if settings.server.enabled {
            let router = server::status_router(handle.subscribe());
            let (host, port) = (settings.server.host.clone(), settings.server.port);
            tokio::spawn(async move {
                if let Err(e) = server::serve(router, &host, port).await {
                    error!("Status server failed: {}", e);
                }
            });
        }

        let mut task = tokio::spawn(runner.run());
        let outcome = tokio::select! {
            result = &mut task => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, cancelling open orders...");
                match handle.stop().await {
                    Ok(report) => info!("Cancelled {} of {} orders", report.cancelled.len(), report.attempted),
                    Err(e) => error!("Shutdown incomplete: {}", e),
                }
                task.await
            }
        };

        outcome.map_err(|e| Error::ChannelClosed(format!("grid runner task failed: {e}")))?
    }

    /// Run the signing proxy; the API secret lives only in this process
    pub async fn run_proxy(self) -> Result<()> {
        self.init_logging();
        info!("Starting signing proxy...");

        let settings = self.settings;
        let credentials = settings.signing_credentials()?;
        let api_key = credentials.api_key().to_string();
        if settings.network.environment == Environment::Production {
            info!("Signing for production at {}", settings.exchange_url());
        }

        let client = SigningClient::new(settings.signing_client_config(), credentials)?;
        drop(settings.credentials);

        if let Err(e) = client.validate_credentials().await {
            match e {
                Error::Authentication(_) => return Err(e),
                other => warn!("Could not validate credentials at startup: {}", other),
            }
        }

        let exchange: Arc<dyn ExchangeAccess> = Arc::new(client);
        let router = server::proxy_router(ProxyState::new(exchange, api_key, settings.proxy.allow));

        tokio::select! {
            result = server::serve(router, &settings.proxy.host, settings.proxy.port) => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        }

        // the router owned the only signing client; its secret is zeroed on drop
        info!("Signing proxy stopped, credentials released");
        Ok(())
    }
}
