//! Market data cache
//!
//! Latest snapshot per symbol, bounded price and kline history, and
//! best-effort fan-out to subscribers.

mod cache;
mod subscription;

pub use cache::{MarketDataCache, ReclaimReport};
pub use subscription::{MarketDataStream, SubscriptionHandle};
