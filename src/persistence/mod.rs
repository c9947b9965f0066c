//! Persistence boundary
//!
//! The engine writes through [`TradeStore`] after each in-memory commit. Every
//! method is an idempotent upsert keyed by the record's identity, so a caller
//! may retry freely. Writes are not ordered with each other; a store never
//! replaces a record with one of lower `revision`. A failed write never
//! rolls back engine state.

mod memory;
mod postgres;

use async_trait::async_trait;

use crate::domain::{DailyStats, Order, Position, TradeRecord};
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn save_order(&self, order: &Order) -> Result<()>;

    async fn update_order(&self, order: &Order) -> Result<()>;

    /// Positions are identified by (owner, symbol, opened_at)
    async fn save_position(&self, position: &Position) -> Result<()>;

    async fn update_position(&self, position: &Position) -> Result<()>;

    async fn save_trade(&self, trade: &TradeRecord) -> Result<()>;

    /// Identified by (owner, date)
    async fn save_daily_stats(&self, stats: &DailyStats) -> Result<()>;
}
