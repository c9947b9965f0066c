use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::{Decimal, MathematicalOps};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::subscription::{MarketDataStream, Subscriber, SubscriptionHandle};
use crate::config::MarketConfig;
use crate::domain::{Kline, MarketConditions, OrderSide, PriceSnapshot};
use crate::error::MarketDataError;

/// What one reclamation pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub prices_trimmed: usize,
    pub klines_trimmed: usize,
    pub subscribers_pruned: usize,
}

/// Latest market state per symbol.
///
/// Each map is a `DashMap`, so symbols never contend with each other. Values
/// in `snapshots` are `Arc`s that are swapped whole on update; readers clone
/// the `Arc` and never observe a half-written snapshot.
pub struct MarketDataCache {
    snapshots: DashMap<String, Arc<PriceSnapshot>>,
    prices: DashMap<String, VecDeque<Decimal>>,
    klines: DashMap<(String, String), VecDeque<Kline>>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
    config: MarketConfig,
}

impl MarketDataCache {
    pub fn new(config: MarketConfig) -> Self {
        Self {
            snapshots: DashMap::new(),
            prices: DashMap::new(),
            klines: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
            config,
        }
    }

    /// Replace the snapshot for its symbol and notify subscribers.
    ///
    /// Rejects non-positive prices and snapshots older than the cached one.
    /// Equal timestamps are accepted (last write wins).
    pub fn update(&self, snapshot: PriceSnapshot) -> Result<Arc<PriceSnapshot>, MarketDataError> {
        let symbol = snapshot.symbol.clone();
        snapshot.check_sane(self.config.max_price).map_err(|reason| {
            warn!(symbol = %symbol, %reason, "Rejected market data update");
            MarketDataError::Rejected {
                symbol: symbol.clone(),
                reason,
            }
        })?;

        let snapshot = Arc::new(snapshot);
        match self.snapshots.entry(symbol.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if snapshot.timestamp < current.timestamp {
                    let reason = format!(
                        "timestamp {} is older than cached {}",
                        snapshot.timestamp, current.timestamp
                    );
                    warn!(symbol = %symbol, %reason, "Rejected market data update");
                    return Err(MarketDataError::Rejected { symbol, reason });
                }
                entry.insert(Arc::clone(&snapshot));
                self.record_price(&symbol, snapshot.last_price);
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&snapshot));
                self.record_price(&symbol, snapshot.last_price);
            }
        }

        self.publish(&snapshot);
        Ok(snapshot)
    }

    fn record_price(&self, symbol: &str, price: Decimal) {
        self.prices
            .entry(symbol.to_string())
            .or_default()
            .push_back(price);
    }

    /// Non-blocking fan-out. Senders are cloned out of the map first so no
    /// shard lock is held while delivering.
    fn publish(&self, snapshot: &Arc<PriceSnapshot>) {
        let targets: Vec<_> = match self.subscribers.get(&snapshot.symbol) {
            Some(subs) => subs
                .iter()
                .map(|s| (s.id, s.tx.clone(), Arc::clone(&s.dropped)))
                .collect(),
            None => return,
        };

        for (id, tx, dropped) in targets {
            match tx.try_send(Arc::clone(snapshot)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(symbol = %snapshot.symbol, subscriber = id, total, "Subscriber lagging, update dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(symbol = %snapshot.symbol, subscriber = id, "Subscriber receiver gone");
                }
            }
        }
    }

    /// Latest snapshot, or `None` if the symbol has never been updated
    pub fn latest(&self, symbol: &str) -> Option<Arc<PriceSnapshot>> {
        self.snapshots.get(symbol).map(|s| Arc::clone(s.value()))
    }

    /// Like `latest`, but absence is an error
    pub fn require(&self, symbol: &str) -> Result<Arc<PriceSnapshot>, MarketDataError> {
        self.latest(symbol).ok_or_else(|| MarketDataError::NoData {
            symbol: symbol.to_string(),
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.snapshots.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Register a subscriber for one symbol
    pub fn subscribe(&self, symbol: &str) -> (SubscriptionHandle, MarketDataStream) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (subscriber, stream) = MarketDataStream::channel(id, self.config.subscriber_buffer);
        self.subscribers
            .entry(symbol.to_string())
            .or_default()
            .push(subscriber);
        debug!(symbol, subscriber = id, "Market data subscriber added");
        (
            SubscriptionHandle {
                id,
                symbol: symbol.to_string(),
            },
            stream,
        )
    }

    /// Remove a subscription. Its stream ends after buffered updates drain.
    /// Returns false if the handle was already removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut removed = false;
        if let Some(mut subs) = self.subscribers.get_mut(&handle.symbol) {
            let before = subs.len();
            subs.retain(|s| s.id != handle.id);
            removed = subs.len() < before;
        }
        self.subscribers
            .remove_if(&handle.symbol, |_, subs| subs.is_empty());
        if removed {
            debug!(symbol = %handle.symbol, subscriber = handle.id, "Market data subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.subscribers.get(symbol).map(|s| s.len()).unwrap_or(0)
    }

    /// Insert or replace (same open time) a kline
    pub fn update_kline(&self, kline: Kline) -> Result<(), MarketDataError> {
        if kline.low <= Decimal::ZERO || kline.high < kline.low || kline.volume < Decimal::ZERO {
            return Err(MarketDataError::Rejected {
                symbol: kline.symbol,
                reason: "malformed kline".to_string(),
            });
        }

        let key = (kline.symbol.clone(), kline.interval.clone());
        let mut series = self.klines.entry(key).or_default();
        match series.back_mut() {
            Some(last) if last.open_time == kline.open_time => *last = kline,
            Some(last) if last.open_time > kline.open_time => {
                return Err(MarketDataError::Rejected {
                    symbol: kline.symbol,
                    reason: format!("kline open time {} precedes {}", kline.open_time, last.open_time),
                });
            }
            _ => series.push_back(kline),
        }
        Ok(())
    }

    /// Most recent `limit` klines, oldest first
    pub fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Vec<Kline> {
        self.klines
            .get(&(symbol.to_string(), interval.to_string()))
            .map(|series| {
                let skip = series.len().saturating_sub(limit);
                series.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Retained last prices, oldest first
    pub fn price_history(&self, symbol: &str) -> Vec<Decimal> {
        self.prices
            .get(symbol)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Population standard deviation of the last `window` simple returns
    pub fn volatility(&self, symbol: &str, window: usize) -> Option<Decimal> {
        let prices = self.prices.get(symbol)?;
        if window < 2 || prices.len() < window + 1 {
            return None;
        }

        let recent: Vec<Decimal> = prices.iter().skip(prices.len() - window - 1).copied().collect();
        drop(prices);

        // an unrepresentable swing reads as maximal volatility
        let returns: Option<Vec<Decimal>> = recent
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).checked_div(pair[0]))
            .collect();
        let Some(returns) = returns else {
            return Some(Decimal::MAX);
        };
        let n = Decimal::from(returns.len());
        let mean = returns.iter().fold(Decimal::ZERO, |acc, r| acc.saturating_add(*r)) / n;
        let variance = returns
            .iter()
            .map(|r| r.saturating_sub(mean).saturating_mul(r.saturating_sub(mean)))
            .fold(Decimal::ZERO, |acc, sq| acc.saturating_add(sq))
            / n;
        variance.sqrt().or(Some(Decimal::MAX))
    }

    /// Liquidity on the side an order of `side` would consume, plus volatility
    pub fn market_conditions(&self, symbol: &str, side: OrderSide, volatility_window: usize) -> MarketConditions {
        let liquidity = self
            .latest(symbol)
            .map(|snapshot| {
                let levels = match side {
                    OrderSide::Buy => &snapshot.asks,
                    OrderSide::Sell => &snapshot.bids,
                };
                levels
                    .iter()
                    .fold(Decimal::ZERO, |acc, l| acc.saturating_add(l.notional()))
            })
            .unwrap_or(Decimal::ZERO);

        MarketConditions {
            liquidity,
            volatility: self.volatility(symbol, volatility_window),
        }
    }

    /// Trim retained history to the configured bounds and drop subscribers
    /// whose receivers are gone.
    pub fn reclaim(&self) -> ReclaimReport {
        let mut report = ReclaimReport::default();

        for mut series in self.prices.iter_mut() {
            let excess = series.len().saturating_sub(self.config.history_limit);
            series.drain(..excess);
            report.prices_trimmed += excess;
        }

        for mut series in self.klines.iter_mut() {
            let excess = series.len().saturating_sub(self.config.kline_limit);
            series.drain(..excess);
            report.klines_trimmed += excess;
        }

        for mut subs in self.subscribers.iter_mut() {
            let before = subs.len();
            subs.retain(|s| !s.tx.is_closed());
            report.subscribers_pruned += before - subs.len();
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());

        report
    }

    /// Run `reclaim` on the configured interval until `shutdown` flips.
    pub fn spawn_reclaimer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.reclaim_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.reclaim();
                        if report != ReclaimReport::default() {
                            debug!(
                                prices = report.prices_trimmed,
                                klines = report.klines_trimmed,
                                subscribers = report.subscribers_pruned,
                                "Market data reclaimed"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Market data reclaimer stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PriceLevel;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn cache_with(buffer: usize, history: usize) -> MarketDataCache {
        MarketDataCache::new(MarketConfig {
            history_limit: history,
            kline_limit: 3,
            subscriber_buffer: buffer,
            reclaim_interval_secs: 1,
            ..MarketConfig::default()
        })
    }

    #[test]
    fn test_unknown_symbol_is_no_data() {
        let cache = cache_with(10, 10);
        assert!(cache.latest("BTC").is_none());
        assert_eq!(
            cache.require("BTC").unwrap_err(),
            MarketDataError::NoData { symbol: "BTC".to_string() }
        );
    }

    #[test]
    fn test_rejects_bad_prices_and_stale_timestamps() {
        let cache = cache_with(10, 10);
        let now = Utc::now();

        assert!(cache.update(PriceSnapshot::new("BTC", dec!(0), now)).is_err());
        assert!(cache.update(PriceSnapshot::new("BTC", dec!(-5), now)).is_err());
        assert!(cache.latest("BTC").is_none());

        cache.update(PriceSnapshot::new("BTC", dec!(100), now)).unwrap();
        let stale = cache.update(PriceSnapshot::new("BTC", dec!(90), now - Duration::seconds(1)));
        assert!(matches!(stale, Err(MarketDataError::Rejected { .. })));
        assert_eq!(cache.latest("BTC").unwrap().last_price, dec!(100));

        let bad_level = PriceSnapshot::new("BTC", dec!(101), now)
            .with_book(vec![PriceLevel::new(dec!(0), dec!(1))], vec![]);
        assert!(cache.update(bad_level).is_err());
    }

    #[test]
    fn test_rejects_prices_above_ceiling() {
        let cache = cache_with(10, 10);
        let now = Utc::now();

        let huge = cache.update(PriceSnapshot::new("BTC", Decimal::from_scientific("5e28").unwrap(), now));
        assert!(matches!(huge, Err(MarketDataError::Rejected { .. })));
        let huge_level = PriceSnapshot::new("BTC", dec!(100), now)
            .with_book(vec![], vec![PriceLevel::new(Decimal::MAX, dec!(1))]);
        assert!(cache.update(huge_level).is_err());
        assert!(cache.latest("BTC").is_none());

        let deep = PriceSnapshot::new("BTC", dec!(100), now)
            .with_book(vec![], vec![PriceLevel::new(dec!(100), Decimal::MAX), PriceLevel::new(dec!(101), Decimal::MAX)]);
        cache.update(deep).unwrap();
        assert_eq!(cache.market_conditions("BTC", OrderSide::Buy, 20).liquidity, Decimal::MAX);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_instead_of_blocking() {
        let cache = cache_with(2, 100);
        let (_handle, mut stream) = cache.subscribe("BTC");
        let start = Utc::now();

        for i in 0..5 {
            cache
                .update(PriceSnapshot::new("BTC", dec!(100) + Decimal::from(i), start + Duration::milliseconds(i)))
                .unwrap();
        }

        assert_eq!(stream.recv().await.unwrap().last_price, dec!(100));
        assert_eq!(stream.recv().await.unwrap().last_price, dec!(101));
        assert!(stream.try_recv().is_none());
        assert_eq!(stream.dropped(), 3);
        // the cache itself always has the newest value
        assert_eq!(cache.latest("BTC").unwrap().last_price, dec!(104));
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_stream() {
        let cache = cache_with(10, 10);
        let (handle, mut stream) = cache.subscribe("ETH");
        let (_other, mut other_stream) = cache.subscribe("ETH");
        assert_eq!(cache.subscriber_count("ETH"), 2);

        cache.update(PriceSnapshot::new("ETH", dec!(2000), Utc::now())).unwrap();
        assert!(cache.unsubscribe(&handle));
        assert!(!cache.unsubscribe(&handle));

        assert_eq!(stream.recv().await.unwrap().last_price, dec!(2000));
        assert!(stream.recv().await.is_none());

        cache.update(PriceSnapshot::new("ETH", dec!(2001), Utc::now())).unwrap();
        assert_eq!(other_stream.recv().await.unwrap().last_price, dec!(2000));
        assert_eq!(other_stream.recv().await.unwrap().last_price, dec!(2001));
    }

    #[test]
    fn test_reclaim_bounds_history() {
        let cache = cache_with(10, 4);
        let start = Utc::now();
        for i in 0..10 {
            cache
                .update(PriceSnapshot::new("BTC", dec!(100) + Decimal::from(i), start + Duration::seconds(i)))
                .unwrap();
            cache
                .update_kline(Kline {
                    symbol: "BTC".to_string(),
                    interval: "1m".to_string(),
                    open_time: start + Duration::minutes(i),
                    open: dec!(100),
                    high: dec!(101),
                    low: dec!(99),
                    close: dec!(100),
                    volume: dec!(1),
                })
                .unwrap();
        }
        let (_h, stream) = cache.subscribe("BTC");
        drop(stream);

        let report = cache.reclaim();
        assert_eq!(report.prices_trimmed, 6);
        assert_eq!(report.klines_trimmed, 7);
        assert_eq!(report.subscribers_pruned, 1);
        assert_eq!(cache.price_history("BTC"), vec![dec!(106), dec!(107), dec!(108), dec!(109)]);
        assert_eq!(cache.klines("BTC", "1m", 10).len(), 3);
        assert_eq!(cache.subscriber_count("BTC"), 0);
    }

    #[test]
    fn test_kline_same_open_time_replaces() {
        let cache = cache_with(10, 10);
        let t = Utc::now();
        let mut kline = Kline {
            symbol: "BTC".to_string(),
            interval: "1m".to_string(),
            open_time: t,
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100),
            volume: dec!(1),
        };
        cache.update_kline(kline.clone()).unwrap();
        kline.close = dec!(100.5);
        cache.update_kline(kline.clone()).unwrap();

        let stored = cache.klines("BTC", "1m", 10);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].close, dec!(100.5));

        kline.open_time = t - Duration::minutes(1);
        assert!(cache.update_kline(kline).is_err());
    }

    #[test]
    fn test_volatility_and_liquidity() {
        let cache = cache_with(10, 100);
        let start = Utc::now();
        assert_eq!(cache.volatility("BTC", 2), None);

        // returns: +10%, -10%
        for (i, price) in [dec!(100), dec!(110), dec!(99)].into_iter().enumerate() {
            let snapshot = PriceSnapshot::new("BTC", price, start + Duration::seconds(i as i64)).with_book(
                vec![PriceLevel::new(dec!(98), dec!(2))],
                vec![PriceLevel::new(dec!(100), dec!(1)), PriceLevel::new(dec!(101), dec!(3))],
            );
            cache.update(snapshot).unwrap();
        }

        let vol = cache.volatility("BTC", 2).unwrap();
        assert_eq!(vol.round_dp(6), dec!(0.1));

        let buy = cache.market_conditions("BTC", OrderSide::Buy, 2);
        assert_eq!(buy.liquidity, dec!(403));
        let sell = cache.market_conditions("BTC", OrderSide::Sell, 2);
        assert_eq!(sell.liquidity, dec!(196));
    }

    #[tokio::test]
    async fn test_concurrent_updates_keep_newest() {
        let cache = Arc::new(cache_with(10, 1000));
        let start = Utc::now();
        let mut tasks = Vec::new();
        for i in 0..50i64 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                let _ = cache.update(PriceSnapshot::new(
                    "BTC",
                    dec!(100) + Decimal::from(i),
                    start + Duration::milliseconds(i),
                ));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let latest = cache.latest("BTC").unwrap();
        assert_eq!(latest.timestamp, start + Duration::milliseconds(49));
    }
}
