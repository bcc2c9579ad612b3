//! Exchange access - the only capability the grid engine depends on
//!
//! One implementation is selected per deployment by
//! [`boundary::connect`](crate::boundary::connect):
//!
//! - [`ProxyClient`] forwards every call to the trusted signing backend
//! - [`SigningClient`] signs in-process (testnet/demo only)
//!
//! [`mock::MockExchange`] scripts exchange behaviour for tests.

pub mod client;
pub mod proxy_client;
pub mod retry;
pub mod signer;

use async_trait::async_trait;

use crate::errors::Result;
use crate::grid::types::{Balance, OrderReport, OrderRequest};

pub use client::{SigningClient, SigningClientConfig};
pub use proxy_client::ProxyClient;
pub use retry::{retry, Backoff, RetryPolicy};
pub use signer::{sign_request, CanonicalQuery, Credentials};

/// Exchange operations used by the grid engine
#[async_trait]
pub trait ExchangeAccess: Send + Sync {
    /// Latest traded price for `symbol`
    async fn get_price(&self, symbol: &str) -> Result<f64>;

    /// Free balance of the traded pair
    async fn get_balance(&self) -> Result<Balance>;

    /// Submit an order; `request.order_id` is sent as the client order id
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReport>;

    /// Cancel by client order id
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport>;

    /// Current exchange-side state of an order, by client order id
    async fn query_order(&self, symbol: &str, order_id: &str) -> Result<OrderReport>;

    /// Make a signed call that proves the credentials are accepted
    async fn validate_credentials(&self) -> Result<()>;
}

pub mod mock {
    //! Scripted in-memory exchange

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::errors::{Error, DUPLICATE_ORDER_CODE};
    use crate::grid::types::OrderStatus;

    /// Operation selector for scripted failures and call counts
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MockOp {
        GetPrice,
        GetBalance,
        PlaceOrder,
        CancelOrder,
        QueryOrder,
        ValidateCredentials,
    }

    /// Mock exchange for testing
    pub struct MockExchange {
        price: Mutex<f64>,
        balance: Mutex<Balance>,
        failures: Mutex<HashMap<MockOp, VecDeque<Error>>>,
        calls: Mutex<HashMap<MockOp, u32>>,
        orders: Mutex<HashMap<String, OrderReport>>,
        placed: Mutex<Vec<OrderRequest>>,
        cancelled: Mutex<Vec<String>>,
        place_status: Mutex<OrderStatus>,
        place_delay: Mutex<Duration>,
        lost_acks: Mutex<VecDeque<Error>>,
        next_id: AtomicU64,
    }

    impl MockExchange {
        pub fn new(price: f64) -> Self {
            Self {
                price: Mutex::new(price),
                balance: Mutex::new(Balance::new(0.0, 0.0)),
                failures: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                orders: Mutex::new(HashMap::new()),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                place_status: Mutex::new(OrderStatus::Open),
                place_delay: Mutex::new(Duration::ZERO),
                lost_acks: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
            }
        }

        pub fn set_price(&self, price: f64) {
            *self.price.lock() = price;
        }

        pub fn set_balance(&self, balance: Balance) {
            *self.balance.lock() = balance;
        }

        /// Status new orders are acknowledged with
        pub fn set_place_status(&self, status: OrderStatus) {
            *self.place_status.lock() = status;
        }

        /// Delay every placement by `delay` before it reaches the book
        pub fn set_place_delay(&self, delay: Duration) {
            *self.place_delay.lock() = delay;
        }

        /// Fail the next call of `op` with `error`; queued errors are consumed in order
        pub fn fail_next(&self, op: MockOp, error: Error) {
            self.failures.lock().entry(op).or_default().push_back(error);
        }

        /// Accept the next placement onto the book but answer it with `error`,
        /// as when the acknowledgement is lost on the way back
        pub fn fail_next_after_accept(&self, error: Error) {
            self.lost_acks.lock().push_back(error);
        }

        /// Fill an order on the exchange side
        pub fn fill(&self, order_id: &str) {
            let quantity = self
                .placed
                .lock()
                .iter()
                .find(|r| r.order_id == order_id)
                .map(|r| r.quantity);
            if let Some(order) = self.orders.lock().get_mut(order_id) {
                order.status = OrderStatus::Filled;
                order.executed_quantity = quantity.unwrap_or_default();
            }
        }

        pub fn calls(&self, op: MockOp) -> u32 {
            self.calls.lock().get(&op).copied().unwrap_or(0)
        }

        pub fn placed(&self) -> Vec<OrderRequest> {
            self.placed.lock().clone()
        }

        pub fn cancelled(&self) -> Vec<String> {
            self.cancelled.lock().clone()
        }

        /// Exchange-side status of an order
        pub fn order_status(&self, order_id: &str) -> Option<OrderStatus> {
            self.orders.lock().get(order_id).map(|o| o.status)
        }

        fn enter(&self, op: MockOp) -> Result<()> {
            *self.calls.lock().entry(op).or_default() += 1;
            match self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ExchangeAccess for MockExchange {
        async fn get_price(&self, _symbol: &str) -> Result<f64> {
            self.enter(MockOp::GetPrice)?;
            Ok(*self.price.lock())
        }

        async fn get_balance(&self) -> Result<Balance> {
            self.enter(MockOp::GetBalance)?;
            Ok(*self.balance.lock())
        }

        async fn place_order(&self, request: &OrderRequest) -> Result<OrderReport> {
            self.enter(MockOp::PlaceOrder)?;

            let delay = *self.place_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut orders = self.orders.lock();
            if orders.contains_key(&request.order_id) {
                return Err(Error::Exchange {
                    code: DUPLICATE_ORDER_CODE,
                    message: "Duplicate order sent.".into(),
                });
            }

            let status = *self.place_status.lock();
            let report = OrderReport::new(&request.order_id, status)
                .with_exchange_id(self.next_id.fetch_add(1, Ordering::SeqCst))
                .with_execution(0.0, request.price);
            orders.insert(request.order_id.clone(), report.clone());
            self.placed.lock().push(request.clone());

            match self.lost_acks.lock().pop_front() {
                Some(err) => Err(err),
                None => Ok(report),
            }
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<OrderReport> {
            self.enter(MockOp::CancelOrder)?;

            let mut orders = self.orders.lock();
            let order = orders
                .get_mut(order_id)
                .filter(|o| o.status.is_live())
                .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))?;
            order.status = OrderStatus::Cancelled;
            self.cancelled.lock().push(order_id.to_string());
            Ok(OrderReport::new(order_id, OrderStatus::Cancelled))
        }

        async fn query_order(&self, _symbol: &str, order_id: &str) -> Result<OrderReport> {
            self.enter(MockOp::QueryOrder)?;
            self.orders
                .lock()
                .get(order_id)
                .cloned()
                .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))
        }

        async fn validate_credentials(&self) -> Result<()> {
            self.enter(MockOp::ValidateCredentials)
        }
    }

}
