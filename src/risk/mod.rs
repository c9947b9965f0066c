//! Risk manager
//!
//! Ordered, short-circuiting pre-trade checks against per-(owner, symbol)
//! limits, plus optional liquidity and volatility gates.

pub mod checks;
mod manager;

pub use checks::{
    evaluate, MarketGates, RiskCheckKind, RiskDecision, RiskInput, RiskViolation,
};
pub use manager::{RiskCheckRecord, RiskHistoryFilter, RiskManager, RiskOutcome};
