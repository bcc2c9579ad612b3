//! Grid runner - the scheduler that owns the engine
//!
//! A single task owns the [`GridEngine`]; every mutation happens on that
//! task. Exchange calls are spawned onto a [`JoinSet`] and report back over
//! an event channel, so a slow request never blocks price handling or
//! operator commands.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use super::config::GridConfig;
use super::engine::{GridEngine, Placement, PriceDecision};
use super::ledger::{OperationGuard, Order};
use super::snapshot::EngineSnapshot;
use super::types::{Balance, OrderReport, OrderStatus};
use crate::errors::{Error, ErrorKind, Result};
use crate::exchange::{retry, ExchangeAccess, RetryPolicy};

/// Grid runner configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub price_interval_ms: u64,
    pub balance_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            price_interval_ms: 1_000,
            balance_interval_ms: 10_000,
            reconcile_interval_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of cancelling every live order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CancelReport {
    pub attempted: usize,
    pub cancelled: Vec<String>,
}

enum Command {
    UpdateConfig(GridConfig, oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<CancelReport>>),
}

enum Event {
    Price(Result<f64>),
    Balance(Result<Balance>),
    Placed {
        guard: OperationGuard,
        result: Result<OrderReport>,
        /// An attempt timed out, so the order may be on the book whatever the last answer was
        unconfirmed: bool,
    },
    Queried {
        guard: OperationGuard,
        result: Result<OrderReport>,
    },
}

/// Operator handle to a running [`GridRunner`]
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<EngineSnapshot>>,
}

impl EngineHandle {
    /// Replace the grid configuration; levels are re-derived before the call returns
    pub async fn update_config(&self, config: GridConfig) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::UpdateConfig(config, tx))
            .await
            .map_err(|_| Error::ChannelClosed("grid runner has exited".into()))?;
        rx.await
            .map_err(|_| Error::ChannelClosed("grid runner dropped the reply".into()))?
    }

    /// Halt, cancel every live order and stop the runner
    pub async fn stop(&self) -> Result<CancelReport> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(tx))
            .await
            .map_err(|_| Error::ChannelClosed("grid runner has exited".into()))?;
        rx.await
            .map_err(|_| Error::ChannelClosed("grid runner dropped the reply".into()))?
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&EngineSnapshot) -> bool,
    ) -> Result<Arc<EngineSnapshot>> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| Error::ChannelClosed("grid runner has exited".into()))?;
        Ok(snapshot.clone())
    }
}

/// Scheduler owning one grid engine
pub struct GridRunner {
    engine: GridEngine,
    exchange: Arc<dyn ExchangeAccess>,
    config: RunnerConfig,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    tasks: JoinSet<()>,
    snapshots: watch::Sender<Arc<EngineSnapshot>>,
    price_in_flight: bool,
    balance_in_flight: bool,
}

impl GridRunner {
    pub fn new(
        engine: GridEngine,
        exchange: Arc<dyn ExchangeAccess>,
        config: RunnerConfig,
    ) -> (Self, EngineHandle) {
        let (commands_tx, commands) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshots, snapshots_rx) = watch::channel(Arc::new(engine.snapshot()));

        let runner = Self {
            engine,
            exchange,
            config,
            commands,
            events_tx,
            events_rx,
            tasks: JoinSet::new(),
            snapshots,
            price_in_flight: false,
            balance_in_flight: false,
        };
        let handle = EngineHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
        };
        (runner, handle)
    }

    /// Validate credentials, then run until stopped
    pub async fn run(mut self) -> Result<()> {
        let exchange = self.exchange.clone();
        if let Err(e) =
            retry(&self.config.retry, "validate_credentials", || exchange.validate_credentials()).await
        {
            error!("Credential check failed, not starting: {}", e);
            return Err(e);
        }
        info!("Starting grid runner for {}", self.engine.symbol());

        let mut price_timer = interval(Duration::from_millis(self.config.price_interval_ms));
        let mut balance_timer = interval(Duration::from_millis(self.config.balance_interval_ms));
        let mut reconcile_timer = interval(Duration::from_millis(self.config.reconcile_interval_ms));
        for timer in [&mut price_timer, &mut balance_timer, &mut reconcile_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = price_timer.tick() => self.poll_price(),
                _ = balance_timer.tick() => self.poll_balance(),
                _ = reconcile_timer.tick() => self.reconcile(),
                Some(event) = self.events_rx.recv() => {
                    if self.handle_event(event) {
                        if let Err(e) = self.cancel_all().await {
                            error!("Halt left orders behind: {}", e);
                        }
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::UpdateConfig(config, reply)) => {
                        let result = self.engine.update_config(config);
                        if let Err(e) = &result {
                            self.engine.record_error(e);
                        }
                        reply.send(result).ok();
                    }
                    Some(Command::Stop(reply)) => {
                        let result = self.stop().await;
                        reply.send(result).ok();
                        break;
                    }
                    None => {
                        info!("All engine handles dropped, stopping");
                        if let Err(e) = self.stop().await {
                            error!("Stop left orders behind: {}", e);
                        }
                        break;
                    }
                },
                // reaping a finished task changes no state
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => continue,
            }
            self.publish();
        }

        self.engine.mark_stopped();
        self.publish();
        info!("Grid runner for {} stopped", self.engine.symbol());
        Ok(())
    }

    fn publish(&self) {
        self.snapshots.send_replace(Arc::new(self.engine.snapshot()));
    }

    fn spawn<F>(&mut self, call: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            events.send(call.await).ok();
        });
    }

    fn poll_price(&mut self) {
        if self.price_in_flight {
            debug!("Price poll still in flight, skipping tick");
            return;
        }
        self.price_in_flight = true;

        let exchange = self.exchange.clone();
        let policy = self.config.retry.clone();
        let symbol = self.engine.symbol().to_string();
        self.spawn(async move {
            Event::Price(retry(&policy, "get_price", || exchange.get_price(&symbol)).await)
        });
    }

    fn poll_balance(&mut self) {
        if self.balance_in_flight {
            debug!("Balance poll still in flight, skipping tick");
            return;
        }
        self.balance_in_flight = true;

        let exchange = self.exchange.clone();
        let policy = self.config.retry.clone();
        self.spawn(async move {
            Event::Balance(retry(&policy, "get_balance", || exchange.get_balance()).await)
        });
    }

    fn place(&mut self, placement: Placement) {
        let Placement { intent, guard } = placement;
        let exchange = self.exchange.clone();
        let policy = self.config.retry.clone();
        self.spawn(async move {
            // the client order id is fixed, so a retried POST cannot double-place
            let timed_out = AtomicBool::new(false);
            let (exchange, request, flag) = (&exchange, &intent.request, &timed_out);
            let result = retry(&policy, "place_order", || async move {
                let result = exchange.place_order(request).await;
                if matches!(result, Err(Error::Timeout(_))) {
                    flag.store(true, Ordering::Relaxed);
                }
                result
            })
            .await;
            Event::Placed {
                guard,
                result,
                unconfirmed: timed_out.load(Ordering::Relaxed),
            }
        });
    }

    /// Query every live order that has no operation outstanding
    fn reconcile(&mut self) {
        for order in self.engine.ledger().live_orders() {
            let guard = match self.engine.ledger().begin_operation(&order.order_id, OrderStatus::Open) {
                Ok(guard) => guard,
                Err(e) => {
                    debug!("Skipping reconcile of {}: {}", order.order_id, e);
                    continue;
                }
            };

            let exchange = self.exchange.clone();
            let policy = self.config.retry.clone();
            self.spawn(async move {
                let result = retry(&policy, "query_order", || {
                    exchange.query_order(&order.symbol, &order.order_id)
                })
                .await;
                Event::Queried { guard, result }
            });
        }
    }

    /// Apply one event; returns true when the engine halted and orders must be cancelled
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Price(result) => {
                self.price_in_flight = false;
                match result {
                    Ok(price) => return self.handle_price(price),
                    Err(e) => {
                        warn!("Price poll failed: {}", e);
                        self.engine.record_error(&e);
                    }
                }
            }
            Event::Balance(result) => {
                self.balance_in_flight = false;
                match result {
                    Ok(balance) => self.engine.on_balance(balance),
                    Err(e) => {
                        warn!("Balance poll failed: {}", e);
                        self.engine.record_error(&e);
                    }
                }
            }
            Event::Placed {
                guard,
                result,
                unconfirmed,
            } => match result {
                Ok(report) => self.apply(&report),
                Err(e) => {
                    warn!("Placement of {} failed: {}", guard.order_id(), e);
                    self.engine.record_error(&e);
                    let refused = matches!(e.kind(), ErrorKind::Exchange | ErrorKind::Authentication);
                    if refused && !unconfirmed {
                        // an explicit refusal of the only attempt means nothing reached the book
                        self.apply(&OrderReport::new(guard.order_id(), OrderStatus::Rejected));
                    } else {
                        info!("Order {} left pending until reconciliation", guard.order_id());
                    }
                }
            },
            Event::Queried { guard, result } => match result {
                Ok(report) => self.apply(&report),
                Err(Error::OrderNotFound(_)) if self.is_pending(guard.order_id()) => {
                    info!("Order {} never reached the exchange", guard.order_id());
                    self.apply(&OrderReport::new(guard.order_id(), OrderStatus::Rejected));
                }
                Err(e) => {
                    warn!("Reconcile of {} failed: {}", guard.order_id(), e);
                    self.engine.record_error(&e);
                }
            },
        }
        false
    }

    fn handle_price(&mut self, price: f64) -> bool {
        match self.engine.on_price(price) {
            PriceDecision::Idle => false,
            PriceDecision::Place(placements) => {
                for placement in placements {
                    self.place(placement);
                }
                false
            }
            PriceDecision::Halt { reason, cancels } => {
                error!("Halting {}: {} ({} live orders)", self.engine.symbol(), reason, cancels.len());
                true
            }
        }
    }

    fn is_pending(&self, order_id: &str) -> bool {
        self.engine
            .ledger()
            .get(order_id)
            .is_some_and(|o| o.status == OrderStatus::Pending)
    }

    fn apply(&mut self, report: &OrderReport) {
        if let Err(e) = self.engine.apply_report(report) {
            warn!("Ignoring report for {}: {}", report.order_id, e);
            self.engine.record_error(&e);
        }
    }

    async fn stop(&mut self) -> Result<CancelReport> {
        self.engine.halt("operator stop");
        self.cancel_all().await
    }

    /// Abort in-flight calls and cancel every live order
    ///
    /// The engine must already be halted. Cancellations run concurrently;
    /// any that fail are reported as [`Error::PartialCancellation`].
    async fn cancel_all(&mut self) -> Result<CancelReport> {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.price_in_flight = false;
        self.balance_in_flight = false;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }

        let orders = self.engine.ledger().live_orders();
        let attempted = orders.len();
        let mut failed = Vec::new();
        let mut pending = Vec::new();
        for order in orders {
            match self.engine.ledger().begin_operation(&order.order_id, OrderStatus::Cancelled) {
                Ok(guard) => pending.push((order, guard)),
                Err(e) => {
                    warn!("Cannot cancel {}: {}", order.order_id, e);
                    failed.push(order.order_id);
                }
            }
        }
        if attempted > 0 {
            info!("Cancelling {} live orders", attempted);
        }

        let results = join_all(pending.into_iter().map(|(order, guard)| {
            let exchange = self.exchange.clone();
            let policy = self.config.retry.clone();
            async move {
                let result = cancel_one(exchange.as_ref(), &policy, &order).await;
                (order, guard, result)
            }
        }))
        .await;

        let mut cancelled = Vec::new();
        for (order, guard, result) in results {
            let applied = result.and_then(|report| self.engine.apply_report(&report).map(|_| report));
            match applied {
                Ok(report) if report.status.is_terminal() => {
                    debug!("Order {} is {:?}", order.order_id, report.status);
                    cancelled.push(order.order_id);
                }
                Ok(report) => {
                    warn!("Order {} still {:?} after cancel", order.order_id, report.status);
                    failed.push(order.order_id);
                }
                Err(e) => {
                    warn!("Cancel of {} failed: {}", order.order_id, e);
                    self.engine.record_error(&e);
                    failed.push(order.order_id);
                }
            }
            drop(guard);
        }
        self.publish();

        if failed.is_empty() {
            info!("Cancelled {} of {} live orders", cancelled.len(), attempted);
            Ok(CancelReport { attempted, cancelled })
        } else {
            let err = Error::PartialCancellation { attempted, failed };
            error!("{}", err);
            self.engine.record_error(&err);
            Err(err)
        }
    }
}

/// Cancel one order and resolve its final state
async fn cancel_one(
    exchange: &dyn ExchangeAccess,
    policy: &RetryPolicy,
    order: &Order,
) -> Result<OrderReport> {
    let result = retry(policy, "cancel_order", || {
        exchange.cancel_order(&order.symbol, &order.order_id)
    })
    .await;

    match result {
        Err(Error::OrderNotFound(_)) if order.status == OrderStatus::Pending => {
            // the placement was aborted before the exchange accepted it
            Ok(OrderReport::new(&order.order_id, OrderStatus::Cancelled))
        }
        Err(Error::OrderNotFound(_)) => {
            // gone from the book; learn whether it filled
            retry(policy, "query_order", || {
                exchange.query_order(&order.symbol, &order.order_id)
            })
            .await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockExchange, MockOp};
    use crate::grid::types::EngineStatus;

    fn setup(price: f64) -> (Arc<MockExchange>, EngineHandle, tokio::task::JoinHandle<Result<()>>) {
        let exchange = Arc::new(MockExchange::new(price));
        exchange.set_balance(Balance::new(1.0, 50_000.0));
        let config = GridConfig::new(25_000.0, 30_000.0, 10, 1_000.0, 24_000.0, 31_000.0).unwrap();
        let engine = GridEngine::new("BTCUSDT", config).unwrap();
        let (runner, handle) = GridRunner::new(engine, exchange.clone(), RunnerConfig::default());
        let task = tokio::spawn(runner.run());
        (exchange, handle, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_to_start_with_rejected_credentials() {
        let exchange = Arc::new(MockExchange::new(27_000.0));
        exchange.fail_next(MockOp::ValidateCredentials, Error::Authentication("bad key".into()));
        let config = GridConfig::new(25_000.0, 30_000.0, 10, 1_000.0, 24_000.0, 31_000.0).unwrap();
        let (runner, _handle) = GridRunner::new(
            GridEngine::new("BTCUSDT", config).unwrap(),
            exchange.clone(),
            RunnerConfig::default(),
        );

        assert!(matches!(runner.run().await, Err(Error::Authentication(_))));
        assert_eq!(exchange.calls(MockOp::ValidateCredentials), 1);
        assert_eq!(exchange.calls(MockOp::GetPrice), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_price_and_balance() {
        let (_exchange, handle, _task) = setup(27_000.0);
        let snapshot = handle
            .wait_for(|s| s.last_price.is_some() && s.balance.is_some())
            .await
            .unwrap();
        assert_eq!(snapshot.last_price, Some(27_000.0));
        assert_eq!(snapshot.balance, Some(Balance::new(1.0, 50_000.0)));
        assert_eq!(snapshot.status, EngineStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_through_handle() {
        let (_exchange, handle, _task) = setup(27_000.0);
        let config = GridConfig::new(20_000.0, 30_000.0, 4, 400.0, 10_000.0, 40_000.0).unwrap();
        handle.update_config(config).await.unwrap();

        let snapshot = handle.wait_for(|s| s.levels.len() == 5).await.unwrap();
        assert_eq!(snapshot.levels[1], 22_500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reports_and_exits() {
        let (exchange, handle, task) = setup(27_400.0);
        handle.wait_for(|s| s.last_price == Some(27_400.0)).await.unwrap();
        exchange.set_price(27_600.0);
        handle
            .wait_for(|s| s.open_orders.iter().any(|o| o.status == OrderStatus::Open))
            .await
            .unwrap();

        let report = handle.stop().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.cancelled.len(), 1);
        task.await.unwrap().unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, EngineStatus::Stopped);
        assert!(snapshot.open_orders.is_empty());
        assert!(matches!(handle.stop().await, Err(Error::ChannelClosed(_))));
    }
}
