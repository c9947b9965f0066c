pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod market;
pub mod persistence;
pub mod risk;

pub use config::AppConfig;
pub use domain::{
    AccountSnapshot, DailyStats, Order, OrderKind, OrderRequest, OrderSide, OrderStatus, Position,
    PositionSide, PositionStatus, PriceSnapshot, RiskLimit, TradeRecord,
};
pub use engine::{ExecutionEngine, IngestReport};
pub use error::{Result, TradeGateError};
pub use ledger::PositionLedger;
pub use market::MarketDataCache;
pub use persistence::{MemoryStore, PostgresStore, TradeStore};
pub use risk::{RiskDecision, RiskManager};
