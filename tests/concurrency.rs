use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tradegate::config::AppConfig;
use tradegate::domain::{DailyStats, Order, OrderRequest, OrderSide, OrderStatus, Position, PriceSnapshot, TradeRecord};
use tradegate::engine::ExecutionEngine;
use tradegate::error::{OrderError, Result};
use tradegate::persistence::{MemoryStore, TradeStore};

const TRIALS: usize = 200;

fn engine() -> ExecutionEngine {
    ExecutionEngine::new(&AppConfig::default(), Arc::new(MemoryStore::new()))
}

/// Memory store whose first order write and first daily-stats write stall,
/// so they land after writes issued later.
#[derive(Default)]
struct StallingStore {
    inner: MemoryStore,
    order_stalled: AtomicBool,
    stats_stalled: AtomicBool,
    stats_writes: AtomicUsize,
}

impl StallingStore {
    const STALL: std::time::Duration = std::time::Duration::from_millis(400);
}

#[async_trait]
impl TradeStore for StallingStore {
    async fn save_order(&self, order: &Order) -> Result<()> {
        if !self.order_stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Self::STALL).await;
        }
        self.inner.save_order(order).await
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        self.inner.update_order(order).await
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        self.inner.save_position(position).await
    }

    async fn update_position(&self, position: &Position) -> Result<()> {
        self.inner.update_position(position).await
    }

    async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.inner.save_trade(trade).await
    }

    async fn save_daily_stats(&self, stats: &DailyStats) -> Result<()> {
        if !self.stats_stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Self::STALL).await;
        }
        let result = self.inner.save_daily_stats(stats).await;
        self.stats_writes.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// A pending limit order raced by a cancel and a satisfying tick must end in
/// exactly one terminal state, with at most one ledger mutation.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_and_fill_race_lands_on_one_terminal_state() {
    let engine = engine();
    let start = Utc::now();
    let (mut filled, mut cancelled) = (0usize, 0usize);

    for trial in 0..TRIALS {
        let symbol = format!("SYM{trial}");
        engine
            .ingest(PriceSnapshot::new(&symbol, dec!(100), start))
            .await
            .unwrap();
        let id = engine
            .submit(OrderRequest::limit("U1", &symbol, OrderSide::Buy, dec!(1), dec!(90)))
            .await
            .unwrap();

        let canceller = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.cancel(id).await })
        };
        let ticker = {
            let engine = engine.clone();
            let symbol = symbol.clone();
            tokio::spawn(async move {
                engine
                    .ingest(PriceSnapshot::new(symbol, dec!(89), start + Duration::seconds(1)))
                    .await
            })
        };
        let cancel = canceller.await.unwrap();
        ticker.await.unwrap().unwrap();

        let order = engine.wait_for(id).await.unwrap();
        let position = engine.position("U1", &symbol).await;
        match order.status {
            OrderStatus::Cancelled => {
                cancelled += 1;
                assert!(cancel.is_ok(), "trial {trial}: cancelled but cancel reported {cancel:?}");
                assert!(position.is_none(), "trial {trial}: cancelled order moved the ledger");
            }
            OrderStatus::Filled => {
                filled += 1;
                assert!(
                    matches!(cancel, Err(OrderError::InvalidState { .. })),
                    "trial {trial}: filled but cancel reported {cancel:?}"
                );
                assert_eq!(position.map(|p| p.size), Some(dec!(1)), "trial {trial}");
            }
            other => panic!("trial {trial}: unexpected terminal state {other}"),
        }
    }

    assert_eq!(filled + cancelled, TRIALS);
    // one commission of 0.089 per fill, never two
    let account = engine.account("U1").await;
    assert_eq!(account.commissions, dec!(0.089) * Decimal::from(filled as u64));
}

/// Concurrent fills on one (owner, symbol) serialise: the final size is the
/// sum of every fill and the entry price is their volume-weighted average.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fills_on_one_position_serialise() {
    let engine = engine();
    engine
        .ingest(PriceSnapshot::new("BTC", dec!(100), Utc::now()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let id = engine
                .submit(OrderRequest::market("U1", "BTC", OrderSide::Buy, dec!(0.1)))
                .await
                .unwrap();
            engine.wait_for(id).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().status, OrderStatus::Filled);
    }

    let position = engine.position("U1", "BTC").await.unwrap();
    assert_eq!(position.size, dec!(5));
    assert_eq!(position.entry_price, dec!(100));
}

/// `latest` never goes backwards: after concurrent updates with shuffled
/// timestamps it holds the newest accepted one.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_keeps_newest_snapshot_under_concurrent_updates() {
    let engine = engine();
    let base = Utc::now();

    let mut handles = Vec::new();
    for task in 0..8i64 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut newest_accepted = None;
            for step in 0..50i64 {
                // interleave timestamps across tasks
                let offset = step * 8 + (7 - task);
                let ts = base + Duration::milliseconds(offset);
                let price = Decimal::from(100 + offset);
                if engine.ingest(PriceSnapshot::new("BTC", price, ts)).await.is_ok() {
                    newest_accepted = newest_accepted.max(Some(ts));
                }
            }
            newest_accepted
        }));
    }

    let mut newest = None;
    for handle in handles {
        newest = newest.max(handle.await.unwrap());
    }

    let latest = engine.latest_snapshot("BTC").unwrap();
    assert_eq!(Some(latest.timestamp), newest);
}

/// Concurrent ticks on one symbol leave positions marked at the price the
/// cache ends up holding.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn positions_are_marked_at_the_cached_price_after_concurrent_ticks() {
    let engine = engine();
    let base = Utc::now();
    engine.ingest(PriceSnapshot::new("BTC", dec!(100), base)).await.unwrap();
    let id = engine
        .submit(OrderRequest::market("U1", "BTC", OrderSide::Buy, dec!(1)))
        .await
        .unwrap();
    assert_eq!(engine.wait_for(id).await.unwrap().status, OrderStatus::Filled);

    for round in 0..20i64 {
        let mut handles = Vec::new();
        for task in 0..8i64 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let offset = 1 + round * 8 + (7 - task);
                let ts = base + Duration::milliseconds(offset);
                // rejected ticks are fine; only the survivor matters
                let _ = engine
                    .ingest(PriceSnapshot::new("BTC", dec!(100) + Decimal::from(offset), ts))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let cached = engine.latest_price("BTC").unwrap();
        let position = engine.position("U1", "BTC").await.unwrap();
        assert_eq!(position.current_price, cached, "round {round}");
        assert_eq!(position.unrealized_pnl, cached - dec!(100), "round {round}");
    }

    // the high-water mark only ever saw accepted prices
    let account = engine.account("U1").await;
    let cached = engine.latest_price("BTC").unwrap();
    assert_eq!(account.high_water_mark, dec!(10000) - dec!(0.1) + (cached - dec!(100)));
}

/// A stats write that stalls behind a later one must not replace it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_store_write_does_not_clobber_a_later_one() {
    let store = Arc::new(StallingStore::default());
    let engine = ExecutionEngine::new(&AppConfig::default(), store.clone());
    let now = Utc::now();
    for symbol in ["BTC", "ETH"] {
        engine.ingest(PriceSnapshot::new(symbol, dec!(100), now)).await.unwrap();
        let id = engine
            .submit(OrderRequest::market("U1", symbol, OrderSide::Buy, dec!(1)))
            .await
            .unwrap();
        engine.wait_for(id).await.unwrap();
    }

    let closes: Vec<_> = ["BTC", "ETH"]
        .into_iter()
        .map(|symbol| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let id = engine
                    .submit(OrderRequest::market("U1", symbol, OrderSide::Sell, dec!(1)))
                    .await
                    .unwrap();
                engine.wait_for(id).await.unwrap()
            })
        })
        .collect();
    for close in closes {
        assert_eq!(close.await.unwrap().status, OrderStatus::Filled);
    }

    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while store.stats_writes.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let today = Utc::now().date_naive();
    let in_memory = engine.daily_stats("U1", today).await.unwrap();
    let stored = store.inner.daily_stats("U1", today).await.unwrap();
    assert_eq!(in_memory.trade_count, 2);
    assert_eq!(stored.trade_count, 2);
    assert_eq!(stored.revision, in_memory.revision);
}

/// An accepted order is visible and executing while its first store write
/// is still in flight, and that write does not regress the stored status.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn order_is_visible_before_its_store_write_completes() {
    let store = Arc::new(StallingStore::default());
    let engine = ExecutionEngine::new(&AppConfig::default(), store.clone());
    let mut trades = engine.trades();
    engine.ingest(PriceSnapshot::new("BTC", dec!(100), Utc::now())).await.unwrap();

    let submit = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .submit(OrderRequest::market("U1", "BTC", OrderSide::Buy, dec!(1)))
                .await
        })
    };

    let order = tokio::time::timeout(std::time::Duration::from_secs(1), async {
        loop {
            if let Some(order) = engine.orders("U1").into_iter().next() {
                break order;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert!(!submit.is_finished());

    let id = submit.await.unwrap().unwrap();
    assert_eq!(order.id, id);
    assert_eq!(trades.recv().await.unwrap().order_id, Some(id));
    assert_eq!(store.inner.order(id).await.unwrap().status, OrderStatus::Filled);
}
