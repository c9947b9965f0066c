use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::TradeStore;
use crate::domain::{DailyStats, Order, Position, TradeRecord};
use crate::error::Result;

type PositionId = (String, String, DateTime<Utc>);

/// Store that keeps everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    orders: RwLock<HashMap<Uuid, Order>>,
    positions: RwLock<HashMap<PositionId, Position>>,
    trades: RwLock<HashMap<Uuid, TradeRecord>>,
    daily_stats: RwLock<HashMap<(String, NaiveDate), DailyStats>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn order(&self, id: Uuid) -> Option<Order> {
        self.orders.read().await.get(&id).cloned()
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Stored versions of the owner's positions, open and closed
    pub async fn positions(&self, owner: &str) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    pub async fn trades(&self) -> Vec<TradeRecord> {
        let mut trades: Vec<TradeRecord> = self.trades.read().await.values().cloned().collect();
        trades.sort_by_key(|t| t.timestamp);
        trades
    }

    pub async fn daily_stats(&self, owner: &str, date: NaiveDate) -> Option<DailyStats> {
        self.daily_stats
            .read()
            .await
            .get(&(owner.to_string(), date))
            .cloned()
    }

    fn position_id(position: &Position) -> PositionId {
        (position.owner.clone(), position.symbol.clone(), position.opened_at)
    }
}

/// Upsert unless the stored copy has a later revision
fn keep_latest<K: Eq + Hash, V: Clone>(map: &mut HashMap<K, V>, key: K, value: &V, revision: impl Fn(&V) -> u64) {
    match map.entry(key) {
        Entry::Occupied(mut entry) => {
            if revision(entry.get()) <= revision(value) {
                entry.insert(value.clone());
            }
        }
        Entry::Vacant(entry) => {
            entry.insert(value.clone());
        }
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn save_order(&self, order: &Order) -> Result<()> {
        keep_latest(&mut *self.orders.write().await, order.id, order, |o| o.revision);
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        self.save_order(order).await
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        keep_latest(
            &mut *self.positions.write().await,
            Self::position_id(position),
            position,
            |p| p.revision,
        );
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> Result<()> {
        self.save_position(position).await
    }

    async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.trades.write().await.insert(trade.id, trade.clone());
        Ok(())
    }

    async fn save_daily_stats(&self, stats: &DailyStats) -> Result<()> {
        keep_latest(
            &mut *self.daily_stats.write().await,
            (stats.owner.clone(), stats.date),
            stats,
            |s| s.revision,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderRequest, OrderSide, OrderStatus};
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_saves_are_idempotent_on_id() {
        let store = MemoryStore::new();
        let mut order = Order::from_request(OrderRequest::market("U1", "BTC", OrderSide::Buy, dec!(1)));

        assert_ok!(store.save_order(&order).await);
        assert_ok!(store.save_order(&order).await);
        order.mark_filled(dec!(100));
        assert_ok!(store.update_order(&order).await);

        assert_eq!(store.order_count().await, 1);
        assert_eq!(store.order(order.id).await.unwrap().filled_size, dec!(1));
    }

    #[tokio::test]
    async fn test_late_write_of_older_revision_is_ignored() {
        let store = MemoryStore::new();
        let pending = Order::from_request(OrderRequest::market("U1", "BTC", OrderSide::Buy, dec!(1)));
        let mut filled = pending.clone();
        filled.mark_filled(dec!(100));

        assert_ok!(store.update_order(&filled).await);
        assert_ok!(store.save_order(&pending).await);
        assert_eq!(store.order(pending.id).await.unwrap().status, OrderStatus::Filled);

        let today = Utc::now().date_naive();
        let mut first = DailyStats::new("U1", today);
        first.record_close(dec!(5), dec!(0.1), dec!(100));
        first.revision = 1;
        let mut second = first.clone();
        second.record_close(dec!(-2), dec!(0.1), dec!(100));
        second.revision = 2;

        assert_ok!(store.save_daily_stats(&second).await);
        assert_ok!(store.save_daily_stats(&first).await);
        assert_eq!(store.daily_stats("U1", today).await.unwrap().trade_count, 2);
    }
}
