//! Order ledger - lifecycle tracking for grid orders
//!
//! Every order moves `Pending -> Open -> {Filled | Cancelled | Rejected}` and
//! only on a status confirmed by the exchange. Status-changing operations
//! (place, cancel, reconcile) hold an [`OperationGuard`] for the order id; a
//! second operation on the same id while one is outstanding is rejected with
//! [`Error::OperationInProgress`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;

use super::types::{OrderReport, OrderRequest, OrderSide, OrderStatus};
use crate::errors::{Error, Result};

/// An order owned by the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub quantity: f64,
    pub status: OrderStatus,
    /// Grid level this order belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<u64>,
    pub executed_quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// New pending order for a request about to be submitted
    pub fn pending(request: &OrderRequest, level_index: Option<usize>) -> Self {
        let now = Utc::now();
        Self {
            order_id: request.order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            price: request.price,
            quantity: request.quantity,
            status: OrderStatus::Pending,
            level_index,
            exchange_order_id: None,
            executed_quantity: 0.0,
            average_price: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Price a fill executed at, falling back to the limit price
    pub fn fill_price(&self) -> Option<f64> {
        self.average_price.or(self.price)
    }
}

/// A confirmed status change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: OrderStatus,
    pub to: OrderStatus,
    /// The order after the change
    pub order: Order,
}

#[derive(Debug, Default)]
struct LedgerInner {
    orders: HashMap<String, Order>,
    /// Insertion order of ids
    sequence: Vec<String>,
    in_flight: HashSet<String>,
}

impl LedgerInner {
    /// Drop the oldest terminal orders beyond `limit`; orders under an
    /// operation are kept until their guard is released
    fn prune(&mut self, limit: usize) {
        let prunable = |orders: &HashMap<String, Order>, in_flight: &HashSet<String>, id: &String| {
            !in_flight.contains(id) && orders.get(id).is_some_and(|o| o.status.is_terminal())
        };
        let candidates = self
            .sequence
            .iter()
            .filter(|id| prunable(&self.orders, &self.in_flight, id))
            .count();
        let mut excess = candidates.saturating_sub(limit);
        if excess == 0 {
            return;
        }

        let (orders, in_flight) = (&mut self.orders, &self.in_flight);
        self.sequence.retain(|id| {
            if excess > 0 && prunable(&*orders, in_flight, id) {
                orders.remove(id);
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    fn ordered(&self, keep: impl Fn(&Order) -> bool) -> Vec<Order> {
        self.sequence
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| keep(o))
            .cloned()
            .collect()
    }
}

/// Completed orders kept for operators by default
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Shared order ledger
///
/// Live orders are always kept; only the newest `history_limit` terminal
/// orders are.
#[derive(Debug, Clone)]
pub struct OrderLedger {
    inner: Arc<Mutex<LedgerInner>>,
    history_limit: usize,
}

impl Default for OrderLedger {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

/// Exclusive right to change one order's status; released on drop
pub struct OperationGuard {
    ledger: OrderLedger,
    order_id: String,
}

impl OperationGuard {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.ledger.inner.lock().in_flight.remove(&self.order_id);
    }
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard")
            .field("order_id", &self.order_id)
            .finish()
    }
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            inner: Arc::default(),
            history_limit,
        }
    }

    fn guard(&self, order_id: &str) -> OperationGuard {
        OperationGuard {
            ledger: self.clone(),
            order_id: order_id.to_string(),
        }
    }

    /// Record a new pending order and take the operation lock for its submission
    pub fn submit(&self, order: Order) -> Result<OperationGuard> {
        let mut inner = self.inner.lock();
        if inner.in_flight.contains(&order.order_id) {
            return Err(Error::OperationInProgress(order.order_id));
        }
        if let Some(existing) = inner.orders.get(&order.order_id) {
            return Err(Error::IllegalTransition {
                order_id: order.order_id,
                from: existing.status,
                to: OrderStatus::Pending,
            });
        }

        let order_id = order.order_id.clone();
        debug!(
            "Ledger: {} {} {} @ {:?} pending",
            order_id, order.side, order.quantity, order.price
        );
        inner.in_flight.insert(order_id.clone());
        inner.sequence.push(order_id.clone());
        inner.orders.insert(order_id.clone(), Order { status: OrderStatus::Pending, ..order });
        drop(inner);

        Ok(self.guard(&order_id))
    }

    /// Take the operation lock for an existing order heading towards `target`
    pub fn begin_operation(&self, order_id: &str, target: OrderStatus) -> Result<OperationGuard> {
        let mut inner = self.inner.lock();
        let status = inner
            .orders
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| Error::OrderNotFound(order_id.to_string()))?;

        if !status.can_transition_to(target) {
            return Err(Error::IllegalTransition {
                order_id: order_id.to_string(),
                from: status,
                to: target,
            });
        }
        if !inner.in_flight.insert(order_id.to_string()) {
            return Err(Error::OperationInProgress(order_id.to_string()));
        }
        drop(inner);

        Ok(self.guard(order_id))
    }

    /// Apply an exchange-confirmed order state
    ///
    /// Returns `Some` when the status changed and `None` when the report only
    /// refreshed execution details of a live order. Reports against a terminal
    /// order are rejected, including a repeat of the same terminal status.
    pub fn apply(&self, report: &OrderReport) -> Result<Option<Transition>> {
        let mut inner = self.inner.lock();
        let order = inner
            .orders
            .get_mut(&report.order_id)
            .ok_or_else(|| Error::OrderNotFound(report.order_id.clone()))?;

        let from = order.status;
        if !from.can_transition_to(report.status) {
            return Err(Error::IllegalTransition {
                order_id: report.order_id.clone(),
                from,
                to: report.status,
            });
        }

        if let Some(id) = report.exchange_order_id {
            order.exchange_order_id = Some(id);
        }
        if report.executed_quantity > 0.0 {
            order.executed_quantity = report.executed_quantity;
        }
        if report.average_price.is_some() {
            order.average_price = report.average_price;
        }
        order.status = report.status;
        order.updated_at = report.reported_at;

        if from == report.status {
            return Ok(None);
        }

        info!(
            "Order {} ({} level {:?}) {:?} -> {:?}",
            order.order_id, order.side, order.level_index, from, report.status
        );
        let transition = Transition {
            from,
            to: report.status,
            order: order.clone(),
        };
        if report.status.is_terminal() {
            inner.prune(self.history_limit);
        }
        Ok(Some(transition))
    }

    /// Apply a bare confirmed status
    pub fn transition(&self, order_id: &str, to: OrderStatus) -> Result<Option<Transition>> {
        self.apply(&OrderReport::new(order_id, to))
    }

    /// Re-assign the level of every live order, e.g. after the grid changed
    ///
    /// Returns the number of live orders that no longer sit on any level.
    pub fn relevel(&self, level_of: impl Fn(&Order) -> Option<usize>) -> usize {
        let mut inner = self.inner.lock();
        let mut detached = 0;
        for order in inner.orders.values_mut().filter(|o| o.status.is_live()) {
            order.level_index = level_of(order);
            if order.level_index.is_none() {
                detached += 1;
            }
        }
        detached
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.inner.lock().orders.get(order_id).cloned()
    }

    pub fn is_in_flight(&self, order_id: &str) -> bool {
        self.inner.lock().in_flight.contains(order_id)
    }

    /// Whether a pending or open order of `side` occupies `level_index`
    pub fn has_live_order_at(&self, level_index: usize, side: OrderSide) -> bool {
        self.inner.lock().orders.values().any(|o| {
            o.status.is_live() && o.side == side && o.level_index == Some(level_index)
        })
    }

    /// Pending and open orders, oldest first
    pub fn live_orders(&self) -> Vec<Order> {
        self.inner.lock().ordered(|o| o.status.is_live())
    }

    /// Orders resting on the book, oldest first
    pub fn open_orders(&self) -> Vec<Order> {
        self.inner.lock().ordered(|o| o.status == OrderStatus::Open)
    }

    /// Orders in a terminal state, oldest first
    pub fn completed_orders(&self) -> Vec<Order> {
        self.inner.lock().ordered(|o| o.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn order(id: &str, side: OrderSide, level: usize) -> Order {
        let request = OrderRequest::limit(id, "BTCUSDT", side, 0.1, 27_500.0);
        Order::pending(&request, Some(level))
    }

    #[test]
    fn test_lifecycle_to_filled() {
        let ledger = OrderLedger::new();
        let guard = ledger.submit(order("a", OrderSide::Sell, 5)).unwrap();
        assert!(ledger.is_in_flight("a"));
        assert!(ledger.has_live_order_at(5, OrderSide::Sell));
        assert!(!ledger.has_live_order_at(5, OrderSide::Buy));

        let opened = ledger
            .apply(&OrderReport::new("a", OrderStatus::Open).with_exchange_id(42))
            .unwrap()
            .unwrap();
        assert_eq!((opened.from, opened.to), (OrderStatus::Pending, OrderStatus::Open));
        assert_eq!(opened.order.exchange_order_id, Some(42));
        drop(guard);
        assert!(!ledger.is_in_flight("a"));

        // partial fill refreshes details without a status change
        let partial = OrderReport::new("a", OrderStatus::Open).with_execution(0.05, Some(27_500.0));
        assert_eq!(ledger.apply(&partial).unwrap(), None);
        assert_eq!(ledger.get("a").unwrap().executed_quantity, 0.05);

        let filled = ledger.transition("a", OrderStatus::Filled).unwrap().unwrap();
        assert_eq!(filled.to, OrderStatus::Filled);
        assert!(ledger.live_orders().is_empty());
        assert_eq!(ledger.completed_orders().len(), 1);
    }

    #[test]
    fn test_terminal_orders_never_transition() {
        let ledger = OrderLedger::new();
        drop(ledger.submit(order("a", OrderSide::Buy, 1)).unwrap());
        ledger.transition("a", OrderStatus::Open).unwrap();
        ledger.transition("a", OrderStatus::Filled).unwrap();

        for target in [
            OrderStatus::Pending,
            OrderStatus::Open,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
        ] {
            let err = ledger.transition("a", target).unwrap_err();
            assert!(
                matches!(err, Error::IllegalTransition { from: OrderStatus::Filled, .. }),
                "{target:?} gave {err:?}"
            );
        }
        assert_eq!(ledger.get("a").unwrap().status, OrderStatus::Filled);

        let err = ledger.begin_operation("a", OrderStatus::Cancelled).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }

    #[test]
    fn test_open_cannot_return_to_pending() {
        let ledger = OrderLedger::new();
        drop(ledger.submit(order("a", OrderSide::Buy, 1)).unwrap());
        ledger.transition("a", OrderStatus::Open).unwrap();
        assert!(ledger.transition("a", OrderStatus::Pending).is_err());
    }

    #[test]
    fn test_second_operation_is_rejected() {
        let ledger = OrderLedger::new();
        let submit_guard = ledger.submit(order("a", OrderSide::Buy, 1)).unwrap();

        let err = ledger.begin_operation("a", OrderStatus::Cancelled).unwrap_err();
        assert_eq!(err, Error::OperationInProgress("a".into()));

        drop(submit_guard);
        let cancel_guard = ledger.begin_operation("a", OrderStatus::Cancelled).unwrap();
        assert_eq!(cancel_guard.order_id(), "a");
    }

    #[test]
    fn test_duplicate_submission_is_rejected() {
        let ledger = OrderLedger::new();
        let guard = ledger.submit(order("a", OrderSide::Buy, 1)).unwrap();
        assert!(matches!(
            ledger.submit(order("a", OrderSide::Buy, 1)),
            Err(Error::OperationInProgress(_))
        ));
        drop(guard);
        assert!(matches!(
            ledger.submit(order("a", OrderSide::Buy, 1)),
            Err(Error::IllegalTransition { .. })
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_completed_history_is_capped() {
        let ledger = OrderLedger::with_history_limit(2);
        for id in ["a", "b", "c"] {
            drop(ledger.submit(order(id, OrderSide::Buy, 1)).unwrap());
            ledger.transition(id, OrderStatus::Open).unwrap();
            ledger.transition(id, OrderStatus::Filled).unwrap();
        }
        drop(ledger.submit(order("live", OrderSide::Sell, 2)).unwrap());

        let kept: Vec<String> = ledger.completed_orders().into_iter().map(|o| o.order_id).collect();
        assert_eq!(kept, vec!["b".to_string(), "c".to_string()]);
        assert!(ledger.get("a").is_none());
        assert_eq!(ledger.live_orders().len(), 1);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_unknown_order() {
        let ledger = OrderLedger::new();
        assert!(matches!(
            ledger.transition("missing", OrderStatus::Open),
            Err(Error::OrderNotFound(_))
        ));
        assert!(matches!(
            ledger.begin_operation("missing", OrderStatus::Cancelled),
            Err(Error::OrderNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_operation_per_order_under_contention() {
        let ledger = OrderLedger::new();
        drop(ledger.submit(order("a", OrderSide::Sell, 3)).unwrap());
        ledger.transition("a", OrderStatus::Open).unwrap();

        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));
        let granted = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            let holders = holders.clone();
            let max_holders = max_holders.clone();
            let granted = granted.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    match ledger.begin_operation("a", OrderStatus::Cancelled) {
                        Ok(guard) => {
                            granted.fetch_add(1, Ordering::SeqCst);
                            let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            max_holders.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_micros(200)).await;
                            holders.fetch_sub(1, Ordering::SeqCst);
                            drop(guard);
                        }
                        Err(Error::OperationInProgress(_)) => tokio::task::yield_now().await,
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
        assert!(granted.load(Ordering::SeqCst) >= 1);
        assert!(!ledger.is_in_flight("a"));
    }
}
