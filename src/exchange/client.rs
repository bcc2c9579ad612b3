//! Signing REST client for a Binance-style spot API
//!
//! Requests are signed in-process, so this client must only run inside the
//! trusted backend or, in direct mode, against a testnet.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::signer::{CanonicalQuery, Credentials};
use super::ExchangeAccess;
use crate::errors::{Error, Result, RATE_LIMIT_CODE};
use crate::grid::types::{Balance, OrderReport, OrderRequest, OrderStatus};

const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Endpoint and timing settings for [`SigningClient`]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SigningClientConfig {
    pub base_url: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// Budget for unauthenticated price polls
    #[serde(default = "default_price_timeout_ms")]
    pub price_timeout_ms: u64,
    /// Budget for balance and order calls
    #[serde(default = "default_signed_timeout_ms")]
    pub signed_timeout_ms: u64,
    /// Decimal places of the symbol's tick size
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    /// Decimal places of the symbol's lot step
    #[serde(default = "default_quantity_decimals")]
    pub quantity_decimals: u32,
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

pub(crate) fn default_price_decimals() -> u32 {
    2
}

pub(crate) fn default_quantity_decimals() -> u32 {
    5
}

/// Price rounded to the nearest tick, as sent on the wire
pub fn format_price(price: f64, decimals: u32) -> String {
    format!("{:.*}", decimals as usize, price)
}

/// Quantity truncated to the lot step so an order never exceeds its budget
pub fn format_quantity(quantity: f64, decimals: u32) -> String {
    let scale = 10f64.powi(decimals as i32);
    // absorb binary noise such as 0.30000000000000004 before truncating
    let truncated = (quantity * scale + 1e-9).floor() / scale;
    format!("{:.*}", decimals as usize, truncated)
}

impl SigningClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        base_asset: impl Into<String>,
        quote_asset: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            base_asset: base_asset.into(),
            quote_asset: quote_asset.into(),
            recv_window_ms: default_recv_window_ms(),
            price_timeout_ms: default_price_timeout_ms(),
            signed_timeout_ms: default_signed_timeout_ms(),
            price_decimals: default_price_decimals(),
            quantity_decimals: default_quantity_decimals(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    client_order_id: String,
    status: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default, rename = "cummulativeQuoteQty")]
    cumulative_quote_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

fn parse_decimal(field: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| Error::Protocol(format!("{field} is not a number: {value:?}")))
}

impl OrderResponse {
    fn into_report(self, order_id: &str) -> Result<OrderReport> {
        let status = OrderStatus::from_exchange(&self.status)
            .ok_or_else(|| Error::Protocol(format!("unknown order status {}", self.status)))?;

        let executed = match self.executed_qty.as_deref() {
            Some(q) => parse_decimal("executedQty", q)?,
            None => 0.0,
        };
        let quote = match self.cumulative_quote_qty.as_deref() {
            Some(q) => parse_decimal("cummulativeQuoteQty", q)?,
            None => 0.0,
        };
        let average_price = if executed > 0.0 && quote > 0.0 {
            Some(quote / executed)
        } else {
            match self.price.as_deref() {
                Some(p) => Some(parse_decimal("price", p)?).filter(|p| *p > 0.0),
                None => None,
            }
        };

        debug!(
            "Order {} (exchange {}, client {}) is {}",
            order_id, self.order_id, self.client_order_id, self.status
        );
        Ok(OrderReport::new(order_id, status)
            .with_exchange_id(self.order_id)
            .with_execution(executed, average_price))
    }
}

/// Map a failed HTTP response onto the error taxonomy
fn classify_failure(status: StatusCode, body: &str, what: &str) -> Error {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let message = parsed.map(|b| b.msg).unwrap_or_else(|| status.to_string());
        return Error::Authentication(format!("{what}: {message}"));
    }

    match parsed {
        Some(ApiErrorBody { code, msg }) => match code {
            -1021 | -1022 | -2014 | -2015 => Error::Authentication(format!("{what}: {msg}")),
            -2011 | -2013 => Error::OrderNotFound(msg),
            _ => Error::Exchange { code, message: msg },
        },
        None if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 => {
            Error::Exchange {
                code: RATE_LIMIT_CODE,
                message: format!("{what}: rate limited ({status})"),
            }
        }
        None => Error::Protocol(format!("{what}: HTTP {status} with unparseable body")),
    }
}

fn classify_transport(err: reqwest::Error, what: &str) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{what} timed out"))
    } else if err.is_decode() {
        Error::Protocol(format!("{what}: {err}"))
    } else {
        Error::Network(format!("{what}: {err}"))
    }
}

/// REST client holding the API secret
pub struct SigningClient {
    http: Client,
    config: SigningClientConfig,
    credentials: Credentials,
}

impl SigningClient {
    pub fn new(config: SigningClientConfig, credentials: Credentials) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config: SigningClientConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            credentials,
        })
    }

    pub fn config(&self) -> &SigningClientConfig {
        &self.config
    }

    /// Public API key of the held credentials
    pub fn api_key(&self) -> &str {
        self.credentials.api_key()
    }

    fn price_timeout(&self) -> Duration {
        Duration::from_millis(self.config.price_timeout_ms)
    }

    fn signed_timeout(&self) -> Duration {
        Duration::from_millis(self.config.signed_timeout_ms)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_transport(e, what))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| classify_transport(e, what))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body, what));
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Protocol(format!("{what}: unexpected response body: {e}")))
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: CanonicalQuery,
    ) -> Result<T> {
        let what = format!("{method} {path}");
        let query = query
            .param("recvWindow", self.config.recv_window_ms)
            .sign(&self.credentials, Utc::now().timestamp_millis())?;
        let url = format!("{}{}?{}", self.config.base_url, path, query);

        let request = self
            .http
            .request(method, url)
            .header(API_KEY_HEADER, self.credentials.api_key());
        self.send(request, self.signed_timeout(), &what).await
    }

    fn order_query(&self, request: &OrderRequest) -> CanonicalQuery {
        let query = CanonicalQuery::new()
            .param("symbol", &request.symbol)
            .param("side", request.side.as_str());
        let quantity = format_quantity(request.quantity, self.config.quantity_decimals);

        let query = match request.price {
            Some(price) => query
                .param("type", "LIMIT")
                .param("timeInForce", "GTC")
                .param("quantity", quantity)
                .param("price", format_price(price, self.config.price_decimals)),
            None => query.param("type", "MARKET").param("quantity", quantity),
        };
        query
            .param("newClientOrderId", &request.order_id)
            .param("newOrderRespType", "RESULT")
    }
}

#[async_trait]
impl ExchangeAccess for SigningClient {
    async fn get_price(&self, symbol: &str) -> Result<f64> {
        let query = CanonicalQuery::new().param("symbol", symbol).encode()?;
        let url = format!("{}/api/v3/ticker/price?{}", self.config.base_url, query);
        let ticker: TickerPrice = self
            .send(self.http.get(url), self.price_timeout(), "GET /api/v3/ticker/price")
            .await?;
        parse_decimal("price", &ticker.price)
    }

    async fn get_balance(&self) -> Result<Balance> {
        let account: AccountInfo = self
            .signed(Method::GET, "/api/v3/account", CanonicalQuery::new())
            .await?;

        let free = |asset: &str| -> Result<f64> {
            match account.balances.iter().find(|b| b.asset == asset) {
                Some(b) => parse_decimal("free", &b.free),
                None => Ok(0.0),
            }
        };
        Ok(Balance::new(
            free(&self.config.base_asset)?,
            free(&self.config.quote_asset)?,
        ))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReport> {
        let response: OrderResponse = self
            .signed(Method::POST, "/api/v3/order", self.order_query(request))
            .await?;
        response.into_report(&request.order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport> {
        let query = CanonicalQuery::new()
            .param("symbol", symbol)
            .param("origClientOrderId", order_id);
        let response: OrderResponse = self.signed(Method::DELETE, "/api/v3/order", query).await?;
        response.into_report(order_id)
    }

    async fn query_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport> {
        let query = CanonicalQuery::new()
            .param("symbol", symbol)
            .param("origClientOrderId", order_id);
        let response: OrderResponse = self.signed(Method::GET, "/api/v3/order", query).await?;
        response.into_report(order_id)
    }

    async fn validate_credentials(&self) -> Result<()> {
        let _: serde_json::Value = self
            .signed(Method::GET, "/api/v3/account", CanonicalQuery::new())
            .await?;
        Ok(())
    }
}
