use std::sync::Arc;
use std::time::Duration;

use grid_engine::errors::{Error, ErrorKind};
use grid_engine::exchange::mock::{MockExchange, MockOp};
use grid_engine::grid::{
    Balance, EngineHandle, EngineStatus, GridConfig, GridEngine, GridRunner, OrderSide, OrderStatus,
    RunnerConfig,
};

struct Harness {
    exchange: Arc<MockExchange>,
    handle: EngineHandle,
    task: tokio::task::JoinHandle<grid_engine::Result<()>>,
}

fn start(price: f64) -> Harness {
    let exchange = Arc::new(MockExchange::new(price));
    exchange.set_balance(Balance::new(1.0, 50_000.0));
    let config = GridConfig::new(25_000.0, 30_000.0, 10, 1_000.0, 24_000.0, 31_000.0).unwrap();
    let engine = GridEngine::new("BTCUSDT", config).unwrap();
    let (runner, handle) = GridRunner::new(engine, exchange.clone(), RunnerConfig::default());
    let task = tokio::spawn(runner.run());
    Harness {
        exchange,
        handle,
        task,
    }
}

impl Harness {
    async fn move_price(&self, price: f64) {
        self.exchange.set_price(price);
        self.handle.wait_for(|s| s.last_price == Some(price)).await.unwrap();
    }

    async fn wait_open(&self, count: usize) {
        self.handle
            .wait_for(|s| {
                s.open_orders
                    .iter()
                    .filter(|o| o.status == OrderStatus::Open)
                    .count()
                    == count
            })
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn upward_crossing_places_one_sell_at_the_level() {
    let h = start(27_400.0);
    h.move_price(27_400.0).await;
    h.move_price(27_600.0).await;
    h.wait_open(1).await;

    let placed = h.exchange.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].side, OrderSide::Sell);
    assert_eq!(placed[0].price, Some(27_500.0));
    assert_eq!(placed[0].quantity, 100.0);
    assert_eq!(placed[0].symbol, "BTCUSDT");

    // holding the price produces no further intents
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.exchange.placed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_loss_halts_and_cancels_every_open_order() {
    let h = start(27_400.0);
    h.move_price(27_400.0).await;
    h.move_price(27_600.0).await;
    h.move_price(28_100.0).await;
    h.wait_open(2).await;

    h.exchange.set_price(23_900.0);
    let snapshot = h.handle.wait_for(|s| s.is_halted()).await.unwrap();
    assert!(snapshot.halt_reason.as_deref().unwrap().contains("stop loss"));
    assert!(snapshot.open_orders.is_empty());
    assert_eq!(h.exchange.cancelled().len(), 2);
    assert!(snapshot
        .completed_orders
        .iter()
        .all(|o| o.status == OrderStatus::Cancelled));

    // recrossing levels while halted places nothing
    h.move_price(27_000.0).await;
    h.move_price(28_600.0).await;
    assert_eq!(h.exchange.placed().len(), 2);
    assert_eq!(h.handle.snapshot().status, EngineStatus::Halted);
}

#[tokio::test(start_paused = true)]
async fn take_profit_halts_the_run() {
    let h = start(29_000.0);
    h.move_price(29_000.0).await;
    h.exchange.set_price(31_000.0);

    let snapshot = h.handle.wait_for(|s| s.is_halted()).await.unwrap();
    assert!(snapshot.halt_reason.as_deref().unwrap().contains("take profit"));
    assert!(h.exchange.placed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_timeouts_surface_and_polling_continues() {
    let h = start(27_000.0);
    for _ in 0..3 {
        h.exchange
            .fail_next(MockOp::GetPrice, Error::Timeout("ticker timed out".into()));
    }

    let snapshot = h
        .handle
        .wait_for(|s| s.last_error.as_ref().is_some_and(|e| e.kind == ErrorKind::Timeout))
        .await
        .unwrap();
    assert_eq!(snapshot.status, EngineStatus::Running);
    assert_eq!(snapshot.last_price, None);

    h.handle
        .wait_for(|s| s.last_price == Some(27_000.0))
        .await
        .unwrap();
    assert!(h.exchange.calls(MockOp::GetPrice) >= 4);
}

#[tokio::test(start_paused = true)]
async fn stop_during_inflight_placement_leaves_order_cancelled() {
    let h = start(27_400.0);
    h.exchange.set_place_delay(Duration::from_secs(60));
    h.move_price(27_400.0).await;
    h.exchange.set_price(27_600.0);
    h.handle
        .wait_for(|s| s.open_orders.iter().any(|o| o.status == OrderStatus::Pending))
        .await
        .unwrap();

    let report = h.handle.stop().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.cancelled.len(), 1);
    h.task.await.unwrap().unwrap();

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.status, EngineStatus::Stopped);
    assert!(snapshot.open_orders.is_empty());
    assert_eq!(snapshot.completed_orders.len(), 1);
    assert_eq!(snapshot.completed_orders[0].status, OrderStatus::Cancelled);
    assert!(h.exchange.placed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_cancel_is_reported_as_partial_cancellation() {
    let h = start(27_400.0);
    h.move_price(27_400.0).await;
    h.move_price(27_600.0).await;
    h.move_price(28_100.0).await;
    h.wait_open(2).await;

    h.exchange
        .fail_next(MockOp::CancelOrder, Error::Network("connection reset".into()));
    match h.handle.stop().await {
        Err(Error::PartialCancellation { attempted, failed }) => {
            assert_eq!(attempted, 2);
            assert_eq!(failed.len(), 1);
        }
        other => panic!("unexpected stop outcome {other:?}"),
    }
    h.task.await.unwrap().unwrap();

    let snapshot = h.handle.snapshot();
    assert_eq!(snapshot.open_orders.len(), 1);
    assert_eq!(
        snapshot.last_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::PartialCancellation)
    );
}

#[tokio::test(start_paused = true)]
async fn exchange_fill_is_picked_up_by_reconciliation() {
    let h = start(27_400.0);
    h.move_price(27_400.0).await;
    h.move_price(27_600.0).await;
    h.wait_open(1).await;

    let order_id = h.exchange.placed()[0].order_id.clone();
    h.exchange.fill(&order_id);

    let snapshot = h
        .handle
        .wait_for(|s| s.completed_orders.iter().any(|o| o.order_id == order_id))
        .await
        .unwrap();
    let filled = &snapshot.completed_orders[0];
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.executed_quantity, 100.0);
    assert!(snapshot.open_orders.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_placement_frees_the_level() {
    let h = start(27_400.0);
    h.exchange.fail_next(
        MockOp::PlaceOrder,
        Error::Exchange {
            code: -2010,
            message: "Account has insufficient balance".into(),
        },
    );
    h.move_price(27_400.0).await;
    h.exchange.set_price(27_600.0);

    let snapshot = h
        .handle
        .wait_for(|s| s.completed_orders.iter().any(|o| o.status == OrderStatus::Rejected))
        .await
        .unwrap();
    assert!(snapshot.open_orders.is_empty());
    assert_eq!(snapshot.last_error.as_ref().and_then(|e| e.code), Some(-2010));

    // the level is free again on the next upward crossing
    h.move_price(27_400.0).await;
    h.move_price(27_600.0).await;
    h.handle
        .wait_for(|s| {
            s.open_orders
                .iter()
                .any(|o| o.side == OrderSide::Sell && o.status == OrderStatus::Open)
        })
        .await
        .unwrap();
    assert_eq!(h.exchange.calls(MockOp::PlaceOrder), 3);
}

#[tokio::test(start_paused = true)]
async fn duplicate_refusal_after_lost_ack_keeps_order_tracked() {
    let h = start(27_400.0);
    h.exchange
        .fail_next_after_accept(Error::Timeout("order ack lost".into()));
    h.move_price(27_400.0).await;
    h.exchange.set_price(27_600.0);

    // the retry is refused as a duplicate; reconciliation finds the first POST resting
    h.wait_open(1).await;
    assert_eq!(h.exchange.calls(MockOp::PlaceOrder), 2);
    let snapshot = h.handle.snapshot();
    assert!(snapshot.completed_orders.is_empty());
    let order_id = snapshot.open_orders[0].order_id.clone();

    let report = h.handle.stop().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.cancelled, vec![order_id.clone()]);
    assert_eq!(h.exchange.order_status(&order_id), Some(OrderStatus::Cancelled));
}
