use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;
use crate::error::LedgerError;

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side opened by a fill on `side`
    pub fn from_order_side(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }

    /// Order side that reduces this position
    pub fn closing_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Liquidated => "LIQUIDATED",
        }
    }
}

/// Threshold a marked position has crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseTrigger {
    StopLoss,
    TakeProfit,
    Liquidation,
}

impl std::fmt::Display for CloseTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseTrigger::StopLoss => write!(f, "stop-loss"),
            CloseTrigger::TakeProfit => write!(f, "take-profit"),
            CloseTrigger::Liquidation => write!(f, "liquidation"),
        }
    }
}

/// A position in one symbol held by one owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub owner: String,
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    /// Volume-weighted average of same-direction fills
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub leverage: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub commission: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every change; stores keep the highest revision they see
    #[serde(default)]
    pub revision: u64,
}

impl Position {
    pub fn open(
        owner: impl Into<String>,
        symbol: impl Into<String>,
        side: PositionSide,
        size: Decimal,
        price: Decimal,
        leverage: Decimal,
        maintenance_margin: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.into(),
            symbol: symbol.into(),
            side,
            size,
            entry_price: price,
            current_price: price,
            leverage,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            commission: Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            liquidation_price: liquidation_price(side, price, leverage, maintenance_margin),
            status: PositionStatus::Open,
            opened_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Signed size: positive long, negative short
    pub fn signed_size(&self) -> Decimal {
        match self.side {
            PositionSide::Long => self.size,
            PositionSide::Short => -self.size,
        }
    }

    /// P&L of `size` units moved from entry to `price`; `None` when it
    /// cannot be represented
    pub fn pnl_at(&self, price: Decimal, size: Decimal) -> Option<Decimal> {
        let move_ = match self.side {
            PositionSide::Long => price.checked_sub(self.entry_price)?,
            PositionSide::Short => self.entry_price.checked_sub(price)?,
        };
        move_.checked_mul(size)
    }

    /// Reprice and recompute unrealized P&L. Leaves the position untouched
    /// when the P&L at `price` overflows.
    pub fn mark(&mut self, price: Decimal) -> Result<(), LedgerError> {
        let unrealized = self.pnl_at(price, self.size).ok_or_else(|| LedgerError::InvalidPrice {
            symbol: self.symbol.clone(),
            price,
        })?;
        self.current_price = price;
        self.unrealized_pnl = unrealized;
        self.touch();
        Ok(())
    }

    /// Record a change
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }

    /// The first threshold crossed at the current price. Liquidation takes
    /// precedence over stop-loss, stop-loss over take-profit.
    pub fn crossed_threshold(&self) -> Option<CloseTrigger> {
        let price = self.current_price;
        let (liquidated, stopped, took_profit) = match self.side {
            PositionSide::Long => (
                self.liquidation_price.is_some_and(|p| price <= p),
                self.stop_loss.is_some_and(|p| price <= p),
                self.take_profit.is_some_and(|p| price >= p),
            ),
            PositionSide::Short => (
                self.liquidation_price.is_some_and(|p| price >= p),
                self.stop_loss.is_some_and(|p| price >= p),
                self.take_profit.is_some_and(|p| price <= p),
            ),
        };
        if liquidated {
            Some(CloseTrigger::Liquidation)
        } else if stopped {
            Some(CloseTrigger::StopLoss)
        } else if took_profit {
            Some(CloseTrigger::TakeProfit)
        } else {
            None
        }
    }
}

/// Price at which losses consume the posted margin less maintenance.
///
/// Unleveraged positions (leverage ≤ 1) cannot be liquidated.
pub fn liquidation_price(
    side: PositionSide,
    entry_price: Decimal,
    leverage: Decimal,
    maintenance_margin: Decimal,
) -> Option<Decimal> {
    if leverage <= Decimal::ONE {
        return None;
    }
    let inverse = Decimal::ONE / leverage;
    let price = match side {
        PositionSide::Long => entry_price * (Decimal::ONE - inverse + maintenance_margin),
        PositionSide::Short => entry_price * (Decimal::ONE + inverse - maintenance_margin),
    };
    Some(price.max(Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_liquidation_price() {
        // 10x long at 100 with 2.5% maintenance: 100 * (1 - 0.1 + 0.025)
        assert_eq!(
            liquidation_price(PositionSide::Long, dec!(100), dec!(10), dec!(0.025)),
            Some(dec!(92.5))
        );
        assert_eq!(
            liquidation_price(PositionSide::Short, dec!(100), dec!(10), dec!(0.025)),
            Some(dec!(107.5))
        );
        assert_eq!(liquidation_price(PositionSide::Long, dec!(100), dec!(1), dec!(0.025)), None);
    }

    #[test]
    fn test_short_pnl_mirrors_long() {
        let mut short = Position::open("U1", "BTC", PositionSide::Short, dec!(2), dec!(100), dec!(1), dec!(0.025));
        short.mark(dec!(90)).unwrap();
        assert_eq!(short.unrealized_pnl, dec!(20));

        let mut long = Position::open("U1", "BTC", PositionSide::Long, dec!(2), dec!(100), dec!(1), dec!(0.025));
        long.mark(dec!(90)).unwrap();
        assert_eq!(long.unrealized_pnl, dec!(-20));
    }

    #[test]
    fn test_overflowing_mark_leaves_position_unchanged() {
        let mut pos = Position::open("U1", "BTC", PositionSide::Long, dec!(2), dec!(100), dec!(1), dec!(0.025));
        pos.mark(dec!(110)).unwrap();
        let before = pos.clone();

        let huge = Decimal::from_scientific("5e28").unwrap();
        assert!(matches!(pos.mark(huge), Err(LedgerError::InvalidPrice { .. })));
        assert_eq!(pos, before);
        assert_eq!(pos.pnl_at(huge, dec!(2)), None);
        assert_eq!(pos.revision, 1);
    }

    #[test]
    fn test_threshold_precedence() {
        let mut pos = Position::open("U1", "BTC", PositionSide::Long, dec!(1), dec!(100), dec!(10), dec!(0.025));
        pos.stop_loss = Some(dec!(95));
        pos.take_profit = Some(dec!(110));

        pos.mark(dec!(100)).unwrap();
        assert_eq!(pos.crossed_threshold(), None);
        pos.mark(dec!(94)).unwrap();
        assert_eq!(pos.crossed_threshold(), Some(CloseTrigger::StopLoss));
        pos.mark(dec!(92)).unwrap();
        assert_eq!(pos.crossed_threshold(), Some(CloseTrigger::Liquidation));
        pos.mark(dec!(111)).unwrap();
        assert_eq!(pos.crossed_threshold(), Some(CloseTrigger::TakeProfit));
    }

    #[test]
    fn test_short_thresholds() {
        let mut pos = Position::open("U1", "BTC", PositionSide::Short, dec!(1), dec!(100), dec!(1), dec!(0.025));
        pos.stop_loss = Some(dec!(105));
        pos.take_profit = Some(dec!(90));
        pos.mark(dec!(106)).unwrap();
        assert_eq!(pos.crossed_threshold(), Some(CloseTrigger::StopLoss));
        pos.mark(dec!(89)).unwrap();
        assert_eq!(pos.crossed_threshold(), Some(CloseTrigger::TakeProfit));
    }
}
