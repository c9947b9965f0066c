use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-owner view of collateral and performance, as the risk checks see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub owner: String,
    pub collateral: Decimal,
    /// Gross realized P&L across all closes
    pub realized_pnl: Decimal,
    pub commissions: Decimal,
    pub unrealized_pnl: Decimal,
    /// collateral + realized - commissions + unrealized
    pub equity: Decimal,
    pub high_water_mark: Decimal,
    /// Percent below the high-water mark
    pub drawdown_pct: Decimal,
    /// Today's realized P&L net of commissions
    pub daily_pnl: Decimal,
}

impl AccountSnapshot {
    /// Fresh account holding only collateral
    pub fn with_collateral(owner: impl Into<String>, collateral: Decimal) -> Self {
        Self {
            owner: owner.into(),
            collateral,
            realized_pnl: Decimal::ZERO,
            commissions: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            equity: collateral,
            high_water_mark: collateral,
            drawdown_pct: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
        }
    }
}

/// (peak - current) / peak, in percent; zero when there is no peak
pub fn drawdown_pct(high_water_mark: Decimal, equity: Decimal) -> Decimal {
    if high_water_mark <= Decimal::ZERO || equity >= high_water_mark {
        return Decimal::ZERO;
    }
    high_water_mark
        .checked_sub(equity)
        .and_then(|gap| gap.checked_div(high_water_mark))
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::MAX)
}
