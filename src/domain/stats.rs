use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading statistics for one owner on one calendar day (UTC)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub owner: String,
    pub date: NaiveDate,
    pub trade_count: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Gross realized P&L, before commissions
    pub realized_pnl: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub commissions: Decimal,
    pub volume: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub current_win_streak: u32,
    pub current_loss_streak: u32,
    pub max_win_streak: u32,
    pub max_loss_streak: u32,
    /// Percent below the high-water mark, worst seen today
    pub max_drawdown_pct: Decimal,
    pub high_water_mark: Decimal,
    /// Bumped on every change; stores keep the highest revision they see
    #[serde(default)]
    pub revision: u64,
}

impl DailyStats {
    pub fn new(owner: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            owner: owner.into(),
            date,
            trade_count: 0,
            winning_trades: 0,
            losing_trades: 0,
            realized_pnl: Decimal::ZERO,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            commissions: Decimal::ZERO,
            volume: Decimal::ZERO,
            largest_win: Decimal::ZERO,
            largest_loss: Decimal::ZERO,
            current_win_streak: 0,
            current_loss_streak: 0,
            max_win_streak: 0,
            max_loss_streak: 0,
            max_drawdown_pct: Decimal::ZERO,
            high_water_mark: Decimal::ZERO,
            revision: 0,
        }
    }

    /// Fold one realization into the day. A zero P&L counts as a trade but
    /// neither a win nor a loss, and breaks both streaks.
    pub fn record_close(&mut self, pnl: Decimal, commission: Decimal, volume: Decimal) {
        self.trade_count += 1;
        self.realized_pnl = self.realized_pnl.saturating_add(pnl);
        self.commissions = self.commissions.saturating_add(commission);
        self.volume = self.volume.saturating_add(volume);

        if pnl > Decimal::ZERO {
            self.winning_trades += 1;
            self.gross_profit = self.gross_profit.saturating_add(pnl);
            self.largest_win = self.largest_win.max(pnl);
            self.current_win_streak += 1;
            self.current_loss_streak = 0;
            self.max_win_streak = self.max_win_streak.max(self.current_win_streak);
        } else if pnl < Decimal::ZERO {
            self.losing_trades += 1;
            self.gross_loss = self.gross_loss.saturating_sub(pnl);
            self.largest_loss = self.largest_loss.min(pnl);
            self.current_loss_streak += 1;
            self.current_win_streak = 0;
            self.max_loss_streak = self.max_loss_streak.max(self.current_loss_streak);
        } else {
            self.current_win_streak = 0;
            self.current_loss_streak = 0;
        }
    }

    /// Commission on opening fills; no trade is counted
    pub fn record_commission(&mut self, commission: Decimal, volume: Decimal) {
        self.commissions = self.commissions.saturating_add(commission);
        self.volume = self.volume.saturating_add(volume);
    }

    pub fn observe_equity(&mut self, high_water_mark: Decimal, drawdown_pct: Decimal) {
        self.high_water_mark = self.high_water_mark.max(high_water_mark);
        self.max_drawdown_pct = self.max_drawdown_pct.max(drawdown_pct);
    }

    /// Realized P&L after commissions
    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.commissions
    }

    /// Winning share of trades in percent
    pub fn win_rate(&self) -> Decimal {
        if self.trade_count == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.winning_trades) / Decimal::from(self.trade_count) * Decimal::ONE_HUNDRED
    }

    /// Gross profit over gross loss; `None` when there were no losses
    pub fn profit_factor(&self) -> Option<Decimal> {
        if self.gross_loss.is_zero() {
            None
        } else {
            Some(self.gross_profit / self.gross_loss)
        }
    }

    pub fn average_win(&self) -> Decimal {
        if self.winning_trades == 0 {
            Decimal::ZERO
        } else {
            self.gross_profit / Decimal::from(self.winning_trades)
        }
    }

    pub fn average_loss(&self) -> Decimal {
        if self.losing_trades == 0 {
            Decimal::ZERO
        } else {
            -self.gross_loss / Decimal::from(self.losing_trades)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn test_streaks_and_extremes() {
        let mut stats = DailyStats::new("U1", day());
        for pnl in [dec!(10), dec!(5), dec!(-3), dec!(-7), dec!(-1), dec!(20)] {
            stats.record_close(pnl, dec!(0.1), dec!(100));
        }

        assert_eq!(stats.trade_count, 6);
        assert_eq!(stats.winning_trades, 3);
        assert_eq!(stats.losing_trades, 3);
        assert_eq!(stats.realized_pnl, dec!(24));
        assert_eq!(stats.largest_win, dec!(20));
        assert_eq!(stats.largest_loss, dec!(-7));
        assert_eq!(stats.max_win_streak, 2);
        assert_eq!(stats.max_loss_streak, 3);
        assert_eq!(stats.current_win_streak, 1);
        assert_eq!(stats.current_loss_streak, 0);
        assert_eq!(stats.win_rate(), dec!(50));
        assert_eq!(stats.net_pnl(), dec!(23.4));
        assert_eq!(stats.profit_factor(), Some(dec!(35) / dec!(11)));
    }

    #[test]
    fn test_empty_day() {
        let stats = DailyStats::new("U1", day());
        assert_eq!(stats.win_rate(), Decimal::ZERO);
        assert_eq!(stats.profit_factor(), None);
        assert_eq!(stats.average_loss(), Decimal::ZERO);
    }
}
