use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LimitError;

/// Key for per-owner, per-symbol state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub owner: String,
    pub symbol: String,
}

impl PositionKey {
    pub fn new(owner: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            symbol: symbol.into(),
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.symbol)
    }
}

/// Risk limits for one (owner, symbol)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimit {
    pub owner: String,
    pub symbol: String,
    /// Absolute position size after a fill
    pub max_position_size: Decimal,
    pub max_leverage: Decimal,
    /// Percent of the high-water mark, e.g. 20 = 20%
    pub max_drawdown_pct: Decimal,
    /// Absolute amount; trading stops once the day's net P&L reaches its negative
    pub daily_loss_limit: Decimal,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl RiskLimit {
    pub fn new(
        owner: impl Into<String>,
        symbol: impl Into<String>,
        max_position_size: Decimal,
        max_leverage: Decimal,
        max_drawdown_pct: Decimal,
        daily_loss_limit: Decimal,
    ) -> Self {
        Self {
            owner: owner.into(),
            symbol: symbol.into(),
            max_position_size,
            max_leverage,
            max_drawdown_pct,
            daily_loss_limit,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.owner.clone(), self.symbol.clone())
    }

    /// Every numeric field must be strictly positive.
    pub fn validate(&self) -> Result<(), LimitError> {
        if self.owner.trim().is_empty() || self.symbol.trim().is_empty() {
            return Err(LimitError::MissingKey);
        }
        let fields = [
            ("max_position_size", self.max_position_size),
            ("max_leverage", self.max_leverage),
            ("max_drawdown_pct", self.max_drawdown_pct),
            ("daily_loss_limit", self.daily_loss_limit),
        ];
        for (field, value) in fields {
            if value <= Decimal::ZERO {
                return Err(LimitError::InvalidLimit { field, value });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_limit_validation() {
        let limit = RiskLimit::new("U1", "BTC", dec!(2), dec!(5), dec!(20), dec!(50));
        assert!(limit.validate().is_ok());

        let mut bad = limit.clone();
        bad.max_leverage = Decimal::ZERO;
        assert_eq!(
            bad.validate(),
            Err(LimitError::InvalidLimit { field: "max_leverage", value: Decimal::ZERO })
        );

        let mut bad = limit;
        bad.symbol = String::new();
        assert_eq!(bad.validate(), Err(LimitError::MissingKey));
    }
}
