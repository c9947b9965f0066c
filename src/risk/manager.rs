use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::checks::{evaluate, resulting_size, MarketGates, RiskCheckKind, RiskDecision, RiskInput};
use crate::config::RiskConfig;
use crate::domain::{PositionKey, RiskLimit};
use crate::error::LimitError;

/// Passes at or above this share of the position limit are logged
const POSITION_WARNING_RATIO: Decimal = dec!(0.9);
/// Passes at or above this share of the drawdown limit are logged
const DRAWDOWN_WARNING_RATIO: Decimal = dec!(0.8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskOutcome {
    Pass,
    Violation,
}

/// One entry of the risk-check history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheckRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub owner: String,
    pub symbol: String,
    pub outcome: RiskOutcome,
    /// Breached check, absent on pass
    pub check: Option<RiskCheckKind>,
    pub value: Option<Decimal>,
    pub threshold: Option<Decimal>,
    pub checked_at: DateTime<Utc>,
}

/// History query; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct RiskHistoryFilter {
    pub owner: Option<String>,
    pub symbol: Option<String>,
    pub outcome: Option<RiskOutcome>,
    pub check: Option<RiskCheckKind>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RiskHistoryFilter {
    fn matches(&self, record: &RiskCheckRecord) -> bool {
        self.owner.as_ref().map_or(true, |o| *o == record.owner)
            && self.symbol.as_ref().map_or(true, |s| *s == record.symbol)
            && self.outcome.map_or(true, |o| o == record.outcome)
            && self.check.map_or(true, |c| record.check == Some(c))
            && self.since.map_or(true, |t| record.checked_at >= t)
    }
}

/// Owns risk limits and the risk-check history. Never touches positions or
/// prices; those arrive as inputs.
pub struct RiskManager {
    limits: Arc<RwLock<HashMap<PositionKey, RiskLimit>>>,
    config: RiskConfig,
    history: Arc<RwLock<VecDeque<RiskCheckRecord>>>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            limits: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::with_capacity(config.history_capacity.min(1024)))),
            config,
        }
    }

    pub fn gates(&self) -> MarketGates {
        MarketGates {
            min_liquidity: self.config.min_liquidity,
            max_volatility: self.config.max_volatility,
        }
    }

    pub fn volatility_window(&self) -> usize {
        self.config.volatility_window
    }

    // ==================== Limits ====================

    /// Install or replace the limit for (owner, symbol). Last write wins.
    pub async fn update_limit(&self, mut limit: RiskLimit) -> Result<RiskLimit, LimitError> {
        limit.validate()?;
        limit.updated_at = Utc::now();
        let key = limit.key();
        self.limits.write().await.insert(key.clone(), limit.clone());
        info!(
            key = %key,
            max_position = %limit.max_position_size,
            max_leverage = %limit.max_leverage,
            max_drawdown_pct = %limit.max_drawdown_pct,
            daily_loss_limit = %limit.daily_loss_limit,
            "Risk limit updated"
        );
        Ok(limit)
    }

    /// Explicitly installed limit, if any
    pub async fn limit(&self, owner: &str, symbol: &str) -> Option<RiskLimit> {
        self.limits
            .read()
            .await
            .get(&PositionKey::new(owner, symbol))
            .cloned()
    }

    /// Installed limit, or the configured default
    pub async fn effective_limit(&self, owner: &str, symbol: &str) -> RiskLimit {
        if let Some(limit) = self.limit(owner, symbol).await {
            return limit;
        }
        let d = &self.config.default_limit;
        RiskLimit::new(
            owner,
            symbol,
            d.max_position_size,
            d.max_leverage,
            d.max_drawdown_pct,
            d.daily_loss_limit,
        )
    }

    pub async fn limits(&self, owner: &str) -> Vec<RiskLimit> {
        let mut limits: Vec<RiskLimit> = self
            .limits
            .read()
            .await
            .values()
            .filter(|l| l.owner == owner)
            .cloned()
            .collect();
        limits.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        limits
    }

    pub async fn remove_limit(&self, owner: &str, symbol: &str) -> Option<RiskLimit> {
        let removed = self.limits.write().await.remove(&PositionKey::new(owner, symbol));
        if removed.is_some() {
            info!(owner, symbol, "Risk limit removed");
        }
        removed
    }

    // ==================== Checks ====================

    /// Evaluate an order. Pure: reads nothing but `input`.
    pub fn validate(&self, input: &RiskInput<'_>) -> RiskDecision {
        let decision = evaluate(input);
        match &decision {
            RiskDecision::Pass => self.warn_near_limits(input),
            RiskDecision::Violation(v) => debug!(
                order_id = %input.order.id,
                check = %v.check,
                value = %v.value,
                threshold = %v.threshold,
                "Risk check failed"
            ),
        }
        decision
    }

    /// `validate`, then append the outcome to the history
    pub async fn check(&self, input: &RiskInput<'_>) -> RiskDecision {
        let decision = self.validate(input);
        self.record(input, &decision).await;
        decision
    }

    fn warn_near_limits(&self, input: &RiskInput<'_>) {
        let limit = input.limit;
        let size = resulting_size(input.order, input.position);
        if size >= limit.max_position_size * POSITION_WARNING_RATIO {
            warn!(
                owner = %limit.owner,
                symbol = %limit.symbol,
                size = %size,
                max = %limit.max_position_size,
                "Position approaching limit"
            );
        }
        if input.account.drawdown_pct >= limit.max_drawdown_pct * DRAWDOWN_WARNING_RATIO {
            warn!(
                owner = %limit.owner,
                drawdown_pct = %input.account.drawdown_pct,
                max = %limit.max_drawdown_pct,
                "Drawdown approaching limit"
            );
        }
    }

    async fn record(&self, input: &RiskInput<'_>, decision: &RiskDecision) {
        let violation = decision.violation();
        let record = RiskCheckRecord {
            id: Uuid::new_v4(),
            order_id: input.order.id,
            owner: input.order.owner.clone(),
            symbol: input.order.symbol.clone(),
            outcome: if violation.is_some() {
                RiskOutcome::Violation
            } else {
                RiskOutcome::Pass
            },
            check: violation.map(|v| v.check),
            value: violation.map(|v| v.value),
            threshold: violation.map(|v| v.threshold),
            checked_at: Utc::now(),
        };

        let mut history = self.history.write().await;
        history.push_back(record);
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
    }

    /// Matching records, newest first
    pub async fn history(&self, filter: &RiskHistoryFilter) -> Vec<RiskCheckRecord> {
        let history = self.history.read().await;
        let matching = history.iter().rev().filter(|r| filter.matches(r)).cloned();
        match filter.limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        }
    }
}
