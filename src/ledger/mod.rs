//! Position ledger
//!
//! Open positions per (owner, symbol), per-owner accounts with high-water
//! mark drawdown, and daily statistics.

mod book;
mod stats;

pub use book::{CloseOutcome, Fill, FillResult, MarkOutcome, PositionLedger};
pub use stats::DailyStatsBook;
