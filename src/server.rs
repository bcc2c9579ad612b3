//! HTTP surfaces: the signing proxy and the engine status endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::watch;

use crate::boundary::{AllowList, Operation};
use crate::errors::{Error, ErrorKind, Result, RATE_LIMIT_CODE};
use crate::exchange::proxy_client::API_KEY_HEADER;
use crate::exchange::ExchangeAccess;
use crate::grid::snapshot::EngineSnapshot;
use crate::grid::types::{Balance, OrderReport, OrderRequest};

type HmacSha256 = Hmac<Sha256>;

/// Matches presented API keys in constant time
///
/// Both keys are reduced to an HMAC under a per-process random key and the
/// tags are compared with `verify_slice`.
#[derive(Clone)]
struct ApiKeyCheck {
    key: [u8; 32],
    tag: Vec<u8>,
}

impl ApiKeyCheck {
    fn new(api_key: &str) -> Self {
        let key = rand::random::<[u8; 32]>();
        // an empty tag never verifies
        let tag = Self::mac(&key, api_key)
            .map(|mac| mac.finalize().into_bytes().to_vec())
            .unwrap_or_default();
        Self { key, tag }
    }

    fn mac(key: &[u8; 32], value: &str) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(value.as_bytes());
        Some(mac)
    }

    fn matches(&self, presented: &str) -> bool {
        Self::mac(&self.key, presented).is_some_and(|mac| mac.verify_slice(&self.tag).is_ok())
    }
}

/// Shared state of the signing proxy
#[derive(Clone)]
pub struct ProxyState {
    exchange: Arc<dyn ExchangeAccess>,
    api_key: ApiKeyCheck,
    allow: AllowList,
}

impl ProxyState {
    /// `api_key` is the only key callers may present
    pub fn new(exchange: Arc<dyn ExchangeAccess>, api_key: impl Into<String>, allow: AllowList) -> Self {
        Self {
            exchange,
            api_key: ApiKeyCheck::new(&api_key.into()),
            allow,
        }
    }

    fn authorize(&self, headers: &HeaderMap, op: Operation) -> std::result::Result<(), ApiError> {
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Authentication(format!("missing {API_KEY_HEADER} header")))?;
        if !self.api_key.matches(presented) {
            warn!("Rejected {} with unknown API key", op.as_str());
            return Err(Error::Authentication("unknown API key".into()).into());
        }
        self.allow.check(op)?;
        debug!("Proxy: {}", op.as_str());
        Ok(())
    }
}

/// Error response carrying an [`ErrorBody`](crate::errors::ErrorBody)
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err.kind() {
        ErrorKind::InvalidConfiguration => StatusCode::BAD_REQUEST,
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::OrderNotFound => StatusCode::NOT_FOUND,
        ErrorKind::OperationInProgress | ErrorKind::IllegalTransition | ErrorKind::Halted => {
            StatusCode::CONFLICT
        }
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Exchange => match err {
            Error::Exchange { code, .. } if *code == RATE_LIMIT_CODE => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_GATEWAY,
        },
        ErrorKind::Network | ErrorKind::Protocol => StatusCode::BAD_GATEWAY,
        ErrorKind::PartialCancellation | ErrorKind::ChannelClosed | ErrorKind::Io => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(self.0.to_body())).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
struct PriceBody {
    symbol: String,
    price: f64,
}

#[derive(Debug, Deserialize)]
struct SymbolQuery {
    symbol: String,
}

/// Router of the signing proxy
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/balance", get(balance))
        .route("/price/:symbol", get(price))
        .route("/orders", axum::routing::post(place_order))
        .route("/orders/:id", get(query_order).delete(cancel_order))
        .route("/credentials/validate", get(validate_credentials))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn balance(State(state): State<ProxyState>, headers: HeaderMap) -> ApiResult<Balance> {
    state.authorize(&headers, Operation::GetBalance)?;
    Ok(Json(state.exchange.get_balance().await?))
}

async fn price(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Path(symbol): Path<String>,
) -> ApiResult<PriceBody> {
    state.authorize(&headers, Operation::GetPrice)?;
    let price = state.exchange.get_price(&symbol).await?;
    Ok(Json(PriceBody { symbol, price }))
}

async fn place_order(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Json(request): Json<OrderRequest>,
) -> ApiResult<OrderReport> {
    state.authorize(&headers, Operation::PlaceOrder)?;
    if !(request.quantity.is_finite() && request.quantity > 0.0) {
        return Err(Error::InvalidConfiguration("quantity must be positive".into()).into());
    }
    if request.price.is_some_and(|p| !(p.is_finite() && p > 0.0)) {
        return Err(Error::InvalidConfiguration("price must be positive".into()).into());
    }

    info!(
        "Proxy order {}: {} {} {} @ {:?}",
        request.order_id, request.side, request.quantity, request.symbol, request.price
    );
    Ok(Json(state.exchange.place_order(&request).await?))
}

async fn cancel_order(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Query(query): Query<SymbolQuery>,
) -> ApiResult<OrderReport> {
    state.authorize(&headers, Operation::CancelOrder)?;
    info!("Proxy cancel {} on {}", order_id, query.symbol);
    Ok(Json(state.exchange.cancel_order(&query.symbol, &order_id).await?))
}

async fn query_order(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
    Query(query): Query<SymbolQuery>,
) -> ApiResult<OrderReport> {
    state.authorize(&headers, Operation::QueryOrder)?;
    Ok(Json(state.exchange.query_order(&query.symbol, &order_id).await?))
}

async fn validate_credentials(
    State(state): State<ProxyState>,
    headers: HeaderMap,
) -> ApiResult<serde_json::Value> {
    state.authorize(&headers, Operation::ValidateCredentials)?;
    state.exchange.validate_credentials().await?;
    Ok(Json(serde_json::json!({ "valid": true })))
}

type SnapshotFeed = watch::Receiver<Arc<EngineSnapshot>>;

/// Router exposing the latest engine snapshot at `/api/status`
pub fn status_router(snapshots: SnapshotFeed) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .with_state(snapshots)
}

async fn status_handler(State(snapshots): State<SnapshotFeed>) -> Json<EngineSnapshot> {
    let snapshot = snapshots.borrow().clone();
    Json(snapshot.as_ref().clone())
}

/// Bind `host:port` and serve `router` until the task is dropped
pub async fn serve(router: Router, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::InvalidConfiguration(format!("invalid listen address {host}:{port}: {e}")))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
