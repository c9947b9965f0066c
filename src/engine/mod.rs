//! Order execution engine
//!
//! Owns orders and drives each one through `pending → {filled, cancelled,
//! failed}`. Prices come from the market data cache, approval from the risk
//! manager, and fills are committed to the position ledger.

mod executor;

pub use executor::{ExecutionEngine, IngestReport};
