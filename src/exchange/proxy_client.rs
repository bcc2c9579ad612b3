//! Client for the trusted signing backend
//!
//! Holds only the public API key. Every call is forwarded to the proxy HTTP
//! surface served by [`server::proxy_router`](crate::server::proxy_router),
//! which signs with the secret it alone holds.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::ExchangeAccess;
use crate::errors::{Error, ErrorBody, Result};
use crate::grid::types::{Balance, OrderReport, OrderRequest};

/// Header carrying the caller's API key
pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Debug, Deserialize)]
pub(crate) struct PriceResponse {
    pub(crate) price: f64,
}

/// HTTP client for the signing proxy
pub struct ProxyClient {
    http: Client,
    base_url: String,
    api_key: String,
    price_timeout: Duration,
    call_timeout: Duration,
}

impl ProxyClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            price_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_timeouts(mut self, price_timeout: Duration, call_timeout: Duration) -> Self {
        self.price_timeout = price_timeout;
        self.call_timeout = call_timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, what))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error(e, what))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| Error::Protocol(format!("{what}: unexpected response body: {e}")));
        }

        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(error) => Err(Error::from_body(error)),
            Err(_) if status == StatusCode::UNAUTHORIZED => {
                Err(Error::Authentication(format!("{what}: proxy rejected the API key")))
            }
            Err(_) => Err(Error::Protocol(format!("{what}: HTTP {status} with unparseable body"))),
        }
    }
}

fn transport_error(err: reqwest::Error, what: &str) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{what} timed out"))
    } else {
        Error::Network(format!("{what}: {err}"))
    }
}

#[async_trait]
impl ExchangeAccess for ProxyClient {
    async fn get_price(&self, symbol: &str) -> Result<f64> {
        let request = self.http.get(self.url(&format!("/price/{symbol}")));
        let response: PriceResponse = self.send(request, self.price_timeout, "GET /price").await?;
        Ok(response.price)
    }

    async fn get_balance(&self) -> Result<Balance> {
        let request = self.http.get(self.url("/balance"));
        self.send(request, self.call_timeout, "GET /balance").await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReport> {
        let http = self.http.post(self.url("/orders")).json(request);
        self.send(http, self.call_timeout, "POST /orders").await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport> {
        let request = self
            .http
            .delete(self.url(&format!("/orders/{order_id}")))
            .query(&[("symbol", symbol)]);
        self.send(request, self.call_timeout, "DELETE /orders").await
    }

    async fn query_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport> {
        let request = self
            .http
            .get(self.url(&format!("/orders/{order_id}")))
            .query(&[("symbol", symbol)]);
        self.send(request, self.call_timeout, "GET /orders").await
    }

    async fn validate_credentials(&self) -> Result<()> {
        let request = self.http.get(self.url("/credentials/validate"));
        let _: serde_json::Value = self
            .send(request, self.call_timeout, "GET /credentials/validate")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_sends_only_the_api_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/balance")
            .match_header(API_KEY_HEADER, "public-key")
            .with_status(200)
            .with_body(r#"{"base":0.25,"quote":500.0}"#)
            .create_async()
            .await;

        let client = ProxyClient::new(server.url(), "public-key").unwrap();
        assert_eq!(client.get_balance().await.unwrap(), Balance::new(0.25, 500.0));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_structured_errors_are_rebuilt() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("DELETE", "/orders/grid9")
            .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
            .with_status(404)
            .with_body(r#"{"kind":"order_not_found","message":"Unknown order sent."}"#)
            .create_async()
            .await;

        let client = ProxyClient::new(server.url(), "k").unwrap();
        assert_eq!(
            client.cancel_order("BTCUSDT", "grid9").await,
            Err(Error::OrderNotFound("Unknown order sent.".into()))
        );
    }

    #[tokio::test]
    async fn test_rate_limit_code_survives_the_hop() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/price/BTCUSDT")
            .with_status(429)
            .with_body(r#"{"kind":"exchange","message":"Too many requests","code":-1003}"#)
            .create_async()
            .await;

        let err = ProxyClient::new(server.url(), "k")
            .unwrap()
            .get_price("BTCUSDT")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unstructured_failure_is_protocol_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/balance")
            .with_status(502)
            .with_body("Bad Gateway")
            .create_async()
            .await;

        let client = ProxyClient::new(server.url(), "k").unwrap();
        assert!(matches!(client.get_balance().await, Err(Error::Protocol(_))));
    }
}
