use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::stats::DailyStatsBook;
use crate::config::LedgerConfig;
use crate::domain::{
    drawdown_pct, liquidation_price, AccountSnapshot, CloseTrigger, DailyStats, OrderSide, Position,
    PositionKey, PositionSide, PositionStatus,
};
use crate::error::LedgerError;

/// An execution to book against a position
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub owner: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
    pub leverage: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl Fill {
    pub fn new(
        owner: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        size: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            owner: owner.into(),
            symbol: symbol.into(),
            side,
            size,
            price,
            leverage: Decimal::ONE,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn with_leverage(mut self, leverage: Decimal) -> Self {
        self.leverage = leverage;
        self
    }
}

/// What a fill did to the book
#[derive(Debug, Clone, PartialEq)]
pub struct FillResult {
    /// The position after the fill; status `Closed` and size zero when the
    /// fill flattened it
    pub position: Position,
    /// Set when the fill crossed through zero: the old position, closed
    /// before the remainder reopened on the other side
    pub closed: Option<Position>,
    pub realized_pnl: Decimal,
    pub commission: Decimal,
    /// Updated daily stats when the fill realized P&L
    pub stats: Option<DailyStats>,
}

/// Result of repricing a position
#[derive(Debug, Clone, PartialEq)]
pub struct MarkOutcome {
    pub position: Position,
    pub trigger: Option<CloseTrigger>,
}

/// A full close
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOutcome {
    pub position: Position,
    pub realized_pnl: Decimal,
    pub commission: Decimal,
    pub stats: DailyStats,
}

#[derive(Debug, Clone)]
struct Account {
    collateral: Decimal,
    realized_pnl: Decimal,
    commissions: Decimal,
    high_water_mark: Decimal,
}

impl Account {
    fn new(collateral: Decimal) -> Self {
        Self {
            collateral,
            realized_pnl: Decimal::ZERO,
            commissions: Decimal::ZERO,
            high_water_mark: collateral,
        }
    }
}

#[derive(Default)]
struct LedgerState {
    positions: HashMap<PositionKey, Position>,
    accounts: HashMap<String, Account>,
}

impl LedgerState {
    fn snapshot(&self, owner: &str, default_collateral: Decimal) -> AccountSnapshot {
        let account = self
            .accounts
            .get(owner)
            .cloned()
            .unwrap_or_else(|| Account::new(default_collateral));
        let unrealized = self
            .positions
            .values()
            .filter(|p| p.owner == owner)
            .fold(Decimal::ZERO, |acc, p| acc.saturating_add(p.unrealized_pnl));
        let equity = account
            .collateral
            .saturating_add(account.realized_pnl)
            .saturating_sub(account.commissions)
            .saturating_add(unrealized);
        let high_water_mark = account.high_water_mark.max(equity);
        AccountSnapshot {
            owner: owner.to_string(),
            collateral: account.collateral,
            realized_pnl: account.realized_pnl,
            commissions: account.commissions,
            unrealized_pnl: unrealized,
            equity,
            high_water_mark,
            drawdown_pct: drawdown_pct(high_water_mark, equity),
            daily_pnl: Decimal::ZERO,
        }
    }

    fn account_mut(&mut self, owner: &str, default_collateral: Decimal) -> &mut Account {
        self.accounts
            .entry(owner.to_string())
            .or_insert_with(|| Account::new(default_collateral))
    }

    /// Recompute equity and ratchet the high-water mark up to it
    fn touch_high_water_mark(&mut self, owner: &str, default_collateral: Decimal) -> AccountSnapshot {
        let snapshot = self.snapshot(owner, default_collateral);
        self.account_mut(owner, default_collateral).high_water_mark = snapshot.high_water_mark;
        snapshot
    }
}

/// Authoritative positions and per-owner accounts.
///
/// One lock covers positions and accounts so equity and drawdown are always
/// computed from a consistent view. Daily stats live in their own book and
/// are written while the ledger lock is held, so a close and its stats
/// update land together.
pub struct PositionLedger {
    state: RwLock<LedgerState>,
    stats: Arc<DailyStatsBook>,
    config: LedgerConfig,
    commission_rate: Decimal,
}

impl PositionLedger {
    pub fn new(config: LedgerConfig, commission_rate: Decimal) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            stats: Arc::new(DailyStatsBook::new(config.stats_retention_days)),
            config,
            commission_rate,
        }
    }

    pub fn stats_book(&self) -> Arc<DailyStatsBook> {
        Arc::clone(&self.stats)
    }

    /// `None` when the notional cannot be represented
    pub fn commission_for(&self, size: Decimal, price: Decimal) -> Option<Decimal> {
        size.checked_mul(price)?.checked_mul(self.commission_rate)
    }

    fn default_protection(&self, side: PositionSide, price: Decimal) -> (Option<Decimal>, Option<Decimal>) {
        let stop = self.config.default_stop_loss_pct.map(|pct| match side {
            PositionSide::Long => price * (Decimal::ONE - pct),
            PositionSide::Short => price * (Decimal::ONE + pct),
        });
        let take = self.config.default_take_profit_pct.map(|pct| match side {
            PositionSide::Long => price * (Decimal::ONE + pct),
            PositionSide::Short => price * (Decimal::ONE - pct),
        });
        (stop, take)
    }

    fn open_position(&self, fill: &Fill, side: PositionSide, size: Decimal) -> Position {
        let mut position = Position::open(
            fill.owner.clone(),
            fill.symbol.clone(),
            side,
            size,
            fill.price,
            fill.leverage,
            self.config.maintenance_margin,
        );
        let (default_stop, default_take) = self.default_protection(side, fill.price);
        position.stop_loss = fill.stop_loss.or(default_stop);
        position.take_profit = fill.take_profit.or(default_take);
        position
    }

    // ==================== Mutations ====================

    /// Book a fill.
    ///
    /// Same-side fills add at a volume-weighted entry price. Opposite fills
    /// realize P&L on the reduced size; one larger than the position closes
    /// it and opens the remainder as a new position on the other side.
    pub async fn apply_fill(&self, fill: Fill) -> Result<FillResult, LedgerError> {
        if fill.size <= Decimal::ZERO || fill.price <= Decimal::ZERO {
            return Err(LedgerError::InvalidFill(format!(
                "size {} and price {} must be positive",
                fill.size, fill.price
            )));
        }
        if fill.leverage < Decimal::ONE {
            return Err(LedgerError::InvalidFill(format!("leverage {} below 1", fill.leverage)));
        }

        let key = PositionKey::new(fill.owner.clone(), fill.symbol.clone());
        let fill_side = PositionSide::from_order_side(fill.side);
        let overflow = || LedgerError::InvalidFill(format!("{} at {} overflows", fill.size, fill.price));
        let add = |a: Decimal, b: Decimal| a.checked_add(b).ok_or_else(overflow);
        let commission = self.commission_for(fill.size, fill.price).ok_or_else(overflow)?;
        let today = Utc::now().date_naive();

        let mut state = self.state.write().await;
        let existing = state.positions.get(&key).cloned();

        let mut closed = None;
        let mut reduced = Decimal::ZERO;
        let mut realized = Decimal::ZERO;
        let mut closing_commission = Decimal::ZERO;

        // Work on a copy; nothing is written back until the invariant holds.
        let mut position = match existing {
            None => {
                let mut position = self.open_position(&fill, fill_side, fill.size);
                position.commission = commission;
                position
            }
            Some(mut position) if position.side == fill_side => {
                let new_size = add(position.size, fill.size)?;
                let held = position.entry_price.checked_mul(position.size).ok_or_else(overflow)?;
                let added = fill.price.checked_mul(fill.size).ok_or_else(overflow)?;
                position.entry_price = add(held, added)? / new_size;
                position.size = new_size;
                position.leverage = position.leverage.max(fill.leverage);
                position.liquidation_price = liquidation_price(
                    position.side,
                    position.entry_price,
                    position.leverage,
                    self.config.maintenance_margin,
                );
                if fill.stop_loss.is_some() {
                    position.stop_loss = fill.stop_loss;
                }
                if fill.take_profit.is_some() {
                    position.take_profit = fill.take_profit;
                }
                position.commission = add(position.commission, commission)?;
                position
            }
            Some(mut position) => {
                reduced = fill.size.min(position.size);
                closing_commission = commission.checked_mul(reduced).ok_or_else(overflow)? / fill.size;
                realized = position.pnl_at(fill.price, reduced).ok_or_else(overflow)?;

                position.size -= reduced;
                position.realized_pnl = add(position.realized_pnl, realized)?;
                position.commission = add(position.commission, closing_commission)?;

                let remainder = fill.size - reduced;
                if position.size.is_zero() {
                    position.status = PositionStatus::Closed;
                    if remainder > Decimal::ZERO {
                        position.mark(fill.price)?;
                        closed = Some(position);
                        let mut reopened = self.open_position(&fill, fill_side, remainder);
                        reopened.commission = commission - closing_commission;
                        reopened
                    } else {
                        position
                    }
                } else {
                    position
                }
            }
        };

        if position.size < Decimal::ZERO {
            error!(
                key = %key,
                size = %position.size,
                "Refusing fill that would leave a negative position size"
            );
            return Err(LedgerError::InvariantViolation(format!(
                "position {key} would have size {}",
                position.size
            )));
        }

        position.mark(fill.price)?;

        let account = state.account_mut(&fill.owner, self.config.initial_collateral);
        let realized_total = add(account.realized_pnl, realized)?;
        let commissions_total = add(account.commissions, commission)?;
        account.realized_pnl = realized_total;
        account.commissions = commissions_total;

        if position.is_open() {
            state.positions.insert(key.clone(), position.clone());
        } else {
            state.positions.remove(&key);
        }

        let snapshot = state.touch_high_water_mark(&fill.owner, self.config.initial_collateral);
        let opened = fill.size - reduced;
        let stats = self
            .stats
            .update(&fill.owner, today, |s| {
                if reduced > Decimal::ZERO {
                    s.record_close(realized, closing_commission, reduced * fill.price);
                }
                if opened > Decimal::ZERO {
                    s.record_commission(commission - closing_commission, opened * fill.price);
                }
                s.observe_equity(snapshot.high_water_mark, snapshot.drawdown_pct);
            })
            .await;
        drop(state);

        debug!(
            key = %key,
            side = %fill.side,
            size = %fill.size,
            price = %fill.price,
            position_size = %position.size,
            entry = %position.entry_price,
            realized = %realized,
            "Fill applied"
        );
        if let Some(old) = &closed {
            info!(key = %key, from = %old.side, to = %position.side, "Position flipped through close and reopen");
        }

        Ok(FillResult {
            position,
            closed,
            realized_pnl: realized,
            commission,
            stats: (reduced > Decimal::ZERO).then_some(stats),
        })
    }

    /// Reprice one position and report any threshold it crossed.
    pub async fn mark_price(&self, owner: &str, symbol: &str, price: Decimal) -> Result<MarkOutcome, LedgerError> {
        if price <= Decimal::ZERO {
            return Err(LedgerError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        let key = PositionKey::new(owner, symbol);
        let mut state = self.state.write().await;
        let position = state
            .positions
            .get_mut(&key)
            .ok_or_else(|| LedgerError::PositionNotFound {
                owner: owner.to_string(),
                symbol: symbol.to_string(),
            })?;
        position.mark(price)?;
        let outcome = MarkOutcome {
            trigger: position.crossed_threshold(),
            position: position.clone(),
        };
        state.touch_high_water_mark(owner, self.config.initial_collateral);
        Ok(outcome)
    }

    /// Reprice every open position in `symbol`
    pub async fn mark_symbol(&self, symbol: &str, price: Decimal) -> Result<Vec<MarkOutcome>, LedgerError> {
        if price <= Decimal::ZERO {
            return Err(LedgerError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        let mut state = self.state.write().await;
        // reprice copies first so a price no position can absorb changes nothing
        let mut outcomes = Vec::new();
        for position in state.positions.values().filter(|p| p.symbol == symbol) {
            let mut position = position.clone();
            position.mark(price)?;
            outcomes.push(MarkOutcome {
                trigger: position.crossed_threshold(),
                position,
            });
        }
        for outcome in &outcomes {
            let key = PositionKey::new(outcome.position.owner.clone(), symbol);
            state.positions.insert(key, outcome.position.clone());
        }
        for outcome in &outcomes {
            state.touch_high_water_mark(&outcome.position.owner, self.config.initial_collateral);
        }
        Ok(outcomes)
    }

    /// Close the whole position at `price` and return realized P&L
    pub async fn close(&self, owner: &str, symbol: &str, price: Decimal) -> Result<Decimal, LedgerError> {
        self.close_with_status(owner, symbol, price, PositionStatus::Closed)
            .await
            .map(|outcome| outcome.realized_pnl)
    }

    /// Close the whole position, recording `status` (`Closed` or `Liquidated`)
    pub async fn close_with_status(
        &self,
        owner: &str,
        symbol: &str,
        price: Decimal,
        status: PositionStatus,
    ) -> Result<CloseOutcome, LedgerError> {
        if price <= Decimal::ZERO {
            return Err(LedgerError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        let key = PositionKey::new(owner, symbol);
        let today = Utc::now().date_naive();

        let invalid = || LedgerError::InvalidPrice {
            symbol: symbol.to_string(),
            price,
        };

        let mut state = self.state.write().await;
        let mut position = state
            .positions
            .get(&key)
            .cloned()
            .ok_or_else(|| LedgerError::PositionNotFound {
                owner: owner.to_string(),
                symbol: symbol.to_string(),
            })?;

        let size = position.size;
        let realized = position.pnl_at(price, size).ok_or_else(invalid)?;
        let commission = self.commission_for(size, price).ok_or_else(invalid)?;
        position.mark(price)?;
        position.realized_pnl = position.realized_pnl.checked_add(realized).ok_or_else(invalid)?;
        position.commission = position.commission.checked_add(commission).ok_or_else(invalid)?;
        position.size = Decimal::ZERO;
        position.unrealized_pnl = Decimal::ZERO;
        position.status = status;

        let account = state.account_mut(owner, self.config.initial_collateral);
        let realized_total = account.realized_pnl.checked_add(realized).ok_or_else(invalid)?;
        let commissions_total = account.commissions.checked_add(commission).ok_or_else(invalid)?;
        account.realized_pnl = realized_total;
        account.commissions = commissions_total;
        state.positions.remove(&key);
        let snapshot = state.touch_high_water_mark(owner, self.config.initial_collateral);

        let stats = self
            .stats
            .update(owner, today, |s| {
                s.record_close(realized, commission, size * price);
                s.observe_equity(snapshot.high_water_mark, snapshot.drawdown_pct);
            })
            .await;
        drop(state);

        info!(
            key = %key,
            status = status.as_str(),
            price = %price,
            realized = %realized,
            "Position closed"
        );

        Ok(CloseOutcome {
            position,
            realized_pnl: realized,
            commission,
            stats,
        })
    }

    /// Replace stop-loss and take-profit on an open position
    pub async fn set_protection(
        &self,
        owner: &str,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<Position, LedgerError> {
        for price in [stop_loss, take_profit].into_iter().flatten() {
            if price <= Decimal::ZERO {
                return Err(LedgerError::InvalidPrice {
                    symbol: symbol.to_string(),
                    price,
                });
            }
        }
        let mut state = self.state.write().await;
        let position = state
            .positions
            .get_mut(&PositionKey::new(owner, symbol))
            .ok_or_else(|| LedgerError::PositionNotFound {
                owner: owner.to_string(),
                symbol: symbol.to_string(),
            })?;
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        position.touch();
        Ok(position.clone())
    }

    /// Set an owner's posted collateral
    pub async fn set_collateral(&self, owner: &str, collateral: Decimal) -> Result<AccountSnapshot, LedgerError> {
        if collateral <= Decimal::ZERO {
            return Err(LedgerError::InvalidCollateral(collateral));
        }
        let mut state = self.state.write().await;
        let account = state.account_mut(owner, collateral);
        account.collateral = collateral;
        // a deposit resets the drawdown reference
        account.high_water_mark = Decimal::ZERO;
        Ok(state.touch_high_water_mark(owner, self.config.initial_collateral))
    }

    // ==================== Reads ====================

    pub async fn position(&self, owner: &str, symbol: &str) -> Option<Position> {
        self.state
            .read()
            .await
            .positions
            .get(&PositionKey::new(owner, symbol))
            .cloned()
    }

    pub async fn positions(&self, owner: &str) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .state
            .read()
            .await
            .positions
            .values()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub async fn all_positions(&self) -> Vec<Position> {
        self.state.read().await.positions.values().cloned().collect()
    }

    /// Account view including today's net realized P&L
    pub async fn account(&self, owner: &str) -> AccountSnapshot {
        let mut snapshot = self
            .state
            .read()
            .await
            .snapshot(owner, self.config.initial_collateral);
        snapshot.daily_pnl = self.stats.today_net_pnl(owner).await;
        snapshot
    }

    pub async fn daily_stats(&self, owner: &str, date: NaiveDate) -> Option<DailyStats> {
        self.stats.get(owner, date).await
    }

    pub async fn daily_stats_range(&self, owner: &str, from: NaiveDate, to: NaiveDate) -> Vec<DailyStats> {
        self.stats.range(owner, from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger() -> PositionLedger {
        PositionLedger::new(LedgerConfig::default(), Decimal::ZERO)
    }

    fn buy(size: Decimal, price: Decimal) -> Fill {
        Fill::new("U1", "BTC", OrderSide::Buy, size, price)
    }

    fn sell(size: Decimal, price: Decimal) -> Fill {
        Fill::new("U1", "BTC", OrderSide::Sell, size, price)
    }

    #[tokio::test]
    async fn test_same_side_adds_use_vwap() {
        let ledger = ledger();
        ledger.apply_fill(buy(dec!(1), dec!(100))).await.unwrap();
        let result = ledger.apply_fill(buy(dec!(3), dec!(120))).await.unwrap();

        assert_eq!(result.position.size, dec!(4));
        assert_eq!(result.position.entry_price, dec!(115));
        assert_eq!(result.realized_pnl, Decimal::ZERO);
        assert!(result.stats.is_none());
    }

    #[tokio::test]
    async fn test_opposite_fill_reduces_and_realizes() {
        let ledger = ledger();
        ledger.apply_fill(buy(dec!(2), dec!(100))).await.unwrap();
        let result = ledger.apply_fill(sell(dec!(0.5), dec!(110))).await.unwrap();

        assert_eq!(result.position.size, dec!(1.5));
        assert_eq!(result.position.entry_price, dec!(100));
        assert_eq!(result.realized_pnl, dec!(5));
        assert_eq!(result.position.side, PositionSide::Long);
        assert_eq!(result.stats.unwrap().winning_trades, 1);
    }

    #[tokio::test]
    async fn test_flatten_closes_position() {
        let ledger = ledger();
        ledger.apply_fill(sell(dec!(1), dec!(100))).await.unwrap();
        let result = ledger.apply_fill(buy(dec!(1), dec!(90))).await.unwrap();

        assert_eq!(result.position.status, PositionStatus::Closed);
        assert_eq!(result.position.size, Decimal::ZERO);
        assert_eq!(result.realized_pnl, dec!(10));
        assert!(ledger.position("U1", "BTC").await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_opposite_fill_closes_then_reopens() {
        let ledger = ledger();
        ledger.apply_fill(buy(dec!(1), dec!(100))).await.unwrap();
        let result = ledger.apply_fill(sell(dec!(3), dec!(95))).await.unwrap();

        let closed = result.closed.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.side, PositionSide::Long);
        assert_eq!(result.realized_pnl, dec!(-5));

        assert_eq!(result.position.side, PositionSide::Short);
        assert_eq!(result.position.size, dec!(2));
        assert_eq!(result.position.entry_price, dec!(95));
        assert_eq!(result.position.realized_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_size_tracks_signed_sum_of_fills() {
        let ledger = ledger();
        let fills = [
            (OrderSide::Buy, dec!(1.5)),
            (OrderSide::Sell, dec!(0.5)),
            (OrderSide::Sell, dec!(2)),
            (OrderSide::Buy, dec!(0.25)),
            (OrderSide::Buy, dec!(0.75)),
            (OrderSide::Sell, dec!(1)),
            (OrderSide::Buy, dec!(4)),
        ];
        let mut signed = Decimal::ZERO;
        for (i, (side, size)) in fills.into_iter().enumerate() {
            let price = dec!(100) + Decimal::from(i);
            let result = ledger
                .apply_fill(Fill::new("U1", "BTC", side, size, price))
                .await
                .unwrap();
            signed += if side == OrderSide::Buy { size } else { -size };

            assert!(result.position.size >= Decimal::ZERO);
            let observed = ledger.position("U1", "BTC").await.map(|p| p.signed_size()).unwrap_or_default();
            assert_eq!(observed, signed);
        }
    }

    #[tokio::test]
    async fn test_round_trip_at_same_price_is_flat_before_commission() {
        let ledger = PositionLedger::new(LedgerConfig::default(), dec!(0.001));
        ledger.apply_fill(buy(dec!(2), dec!(100))).await.unwrap();
        let realized = ledger.close("U1", "BTC", dec!(100)).await.unwrap();
        assert_eq!(realized, Decimal::ZERO);

        let account = ledger.account("U1").await;
        // 0.1% on 200 in and 200 out
        assert_eq!(account.commissions, dec!(0.4));
        assert_eq!(account.daily_pnl, dec!(-0.4));
        assert_eq!(account.equity, dec!(10000) - dec!(0.4));
    }

    #[tokio::test]
    async fn test_mark_reports_thresholds() {
        let ledger = ledger();
        let mut fill = buy(dec!(1), dec!(100)).with_leverage(dec!(10));
        fill.stop_loss = Some(dec!(95));
        fill.take_profit = Some(dec!(110));
        let opened = ledger.apply_fill(fill).await.unwrap().position;
        assert_eq!(opened.liquidation_price, Some(dec!(92.5)));

        assert_eq!(ledger.mark_price("U1", "BTC", dec!(101)).await.unwrap().trigger, None);
        assert_eq!(
            ledger.mark_price("U1", "BTC", dec!(94)).await.unwrap().trigger,
            Some(CloseTrigger::StopLoss)
        );
        assert_eq!(
            ledger.mark_price("U1", "BTC", dec!(92)).await.unwrap().trigger,
            Some(CloseTrigger::Liquidation)
        );
        let outcome = ledger.mark_price("U1", "BTC", dec!(112)).await.unwrap();
        assert_eq!(outcome.trigger, Some(CloseTrigger::TakeProfit));
        assert_eq!(outcome.position.unrealized_pnl, dec!(12));

        assert!(matches!(
            ledger.mark_price("U1", "ETH", dec!(1)).await,
            Err(LedgerError::PositionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_protection_applied_on_open() {
        let config = LedgerConfig {
            default_stop_loss_pct: Some(dec!(0.05)),
            default_take_profit_pct: Some(dec!(0.1)),
            ..LedgerConfig::default()
        };
        let ledger = PositionLedger::new(config, Decimal::ZERO);
        let short = ledger.apply_fill(sell(dec!(1), dec!(100))).await.unwrap().position;
        assert_eq!(short.stop_loss, Some(dec!(105)));
        assert_eq!(short.take_profit, Some(dec!(90)));
    }

    #[tokio::test]
    async fn test_close_updates_daily_stats() {
        let ledger = ledger();
        let today = Utc::now().date_naive();

        ledger.apply_fill(buy(dec!(1), dec!(100))).await.unwrap();
        ledger.close("U1", "BTC", dec!(130)).await.unwrap();
        ledger.apply_fill(buy(dec!(1), dec!(100))).await.unwrap();
        ledger.close("U1", "BTC", dec!(90)).await.unwrap();
        ledger.apply_fill(buy(dec!(1), dec!(100))).await.unwrap();
        let outcome = ledger
            .close_with_status("U1", "BTC", dec!(80), PositionStatus::Liquidated)
            .await
            .unwrap();

        assert_eq!(outcome.position.status, PositionStatus::Liquidated);
        let stats = ledger.daily_stats("U1", today).await.unwrap();
        assert_eq!(stats.trade_count, 3);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.largest_win, dec!(30));
        assert_eq!(stats.largest_loss, dec!(-20));
        assert_eq!(stats.max_loss_streak, 2);
        assert_eq!(stats.realized_pnl, Decimal::ZERO);
        assert_eq!(stats.volume, dec!(600));
        assert_eq!(ledger.daily_stats_range("U1", today, today).await.len(), 1);
    }

    #[tokio::test]
    async fn test_drawdown_from_high_water_mark() {
        let ledger = ledger();
        ledger.set_collateral("U1", dec!(1000)).await.unwrap();
        ledger.apply_fill(buy(dec!(1), dec!(100))).await.unwrap();

        ledger.mark_price("U1", "BTC", dec!(300)).await.unwrap();
        let peak = ledger.account("U1").await;
        assert_eq!(peak.equity, dec!(1200));
        assert_eq!(peak.high_water_mark, dec!(1200));

        ledger.mark_price("U1", "BTC", dec!(0.01)).await.unwrap();
        ledger.close("U1", "BTC", dec!(60)).await.unwrap();
        let after = ledger.account("U1").await;
        assert_eq!(after.equity, dec!(960));
        assert_eq!(after.high_water_mark, dec!(1200));
        assert_eq!(after.drawdown_pct, dec!(20));
    }

    #[tokio::test]
    async fn test_unrepresentable_amounts_are_refused_without_side_effects() {
        let ledger = PositionLedger::new(LedgerConfig::default(), dec!(0.001));
        ledger.apply_fill(buy(dec!(2), dec!(100))).await.unwrap();
        ledger.apply_fill(Fill::new("U2", "BTC", OrderSide::Sell, dec!(1), dec!(100))).await.unwrap();
        let before = ledger.account("U1").await;
        let huge = Decimal::from_scientific("5e28").unwrap();

        assert!(matches!(
            ledger.mark_symbol("BTC", huge).await,
            Err(LedgerError::InvalidPrice { .. })
        ));
        for owner in ["U1", "U2"] {
            let position = ledger.position(owner, "BTC").await.unwrap();
            assert_eq!(position.current_price, dec!(100));
            assert_eq!(position.unrealized_pnl, Decimal::ZERO);
        }

        assert!(matches!(
            ledger.apply_fill(buy(dec!(2), huge)).await,
            Err(LedgerError::InvalidFill(_))
        ));
        assert!(matches!(
            ledger.close("U1", "BTC", huge).await,
            Err(LedgerError::InvalidPrice { .. })
        ));
        assert_eq!(ledger.position("U1", "BTC").await.unwrap().size, dec!(2));
        assert_eq!(ledger.account("U1").await, before);
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let ledger = ledger();
        assert!(matches!(
            ledger.apply_fill(buy(dec!(0), dec!(100))).await,
            Err(LedgerError::InvalidFill(_))
        ));
        assert!(matches!(
            ledger.close("U1", "BTC", dec!(100)).await,
            Err(LedgerError::PositionNotFound { .. })
        ));
        assert!(matches!(
            ledger.set_collateral("U1", dec!(-1)).await,
            Err(LedgerError::InvalidCollateral(_))
        ));
    }
}
