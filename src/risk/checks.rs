//! Pure risk checks.
//!
//! Every function here is a function of its arguments only, so checks for
//! different owners can run concurrently without coordination.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AccountSnapshot, MarketConditions, Order, OrderSide, Position, PositionSide, PriceSnapshot, RiskLimit,
};

/// Which limit a check enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheckKind {
    PositionSize,
    Leverage,
    Drawdown,
    DailyLoss,
    Liquidity,
    Volatility,
}

impl RiskCheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCheckKind::PositionSize => "position_size",
            RiskCheckKind::Leverage => "leverage",
            RiskCheckKind::Drawdown => "drawdown",
            RiskCheckKind::DailyLoss => "daily_loss",
            RiskCheckKind::Liquidity => "liquidity",
            RiskCheckKind::Volatility => "volatility",
        }
    }
}

impl std::fmt::Display for RiskCheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A breached limit with the observed value and the threshold it crossed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskViolation {
    pub check: RiskCheckKind,
    pub value: Decimal,
    pub threshold: Decimal,
}

impl std::fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.check {
            RiskCheckKind::PositionSize => write!(
                f,
                "position limit: resulting size {} exceeds max {}",
                self.value, self.threshold
            ),
            RiskCheckKind::Leverage => write!(
                f,
                "leverage limit: resulting leverage {} exceeds max {}",
                self.value, self.threshold
            ),
            RiskCheckKind::Drawdown => write!(
                f,
                "drawdown limit: current drawdown {}% reached max {}%",
                self.value, self.threshold
            ),
            RiskCheckKind::DailyLoss => write!(
                f,
                "daily loss limit: daily P&L {} reached limit {}",
                self.value, self.threshold
            ),
            RiskCheckKind::Liquidity => write!(
                f,
                "liquidity floor: visible liquidity {} below {}",
                self.value, self.threshold
            ),
            RiskCheckKind::Volatility => write!(
                f,
                "volatility ceiling: volatility {} exceeds {}",
                self.value, self.threshold
            ),
        }
    }
}

/// Result of validating one order. Violations are expected outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Pass,
    Violation(RiskViolation),
}

impl RiskDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, RiskDecision::Pass)
    }

    pub fn violation(&self) -> Option<&RiskViolation> {
        match self {
            RiskDecision::Pass => None,
            RiskDecision::Violation(v) => Some(v),
        }
    }
}

/// Optional engine-wide gates on market state
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarketGates {
    pub min_liquidity: Option<Decimal>,
    pub max_volatility: Option<Decimal>,
}

/// Everything one validation reads
#[derive(Debug, Clone, Copy)]
pub struct RiskInput<'a> {
    pub order: &'a Order,
    pub snapshot: &'a PriceSnapshot,
    pub position: Option<&'a Position>,
    pub limit: &'a RiskLimit,
    pub account: &'a AccountSnapshot,
    pub conditions: MarketConditions,
    pub gates: MarketGates,
}

/// Run the checks in order, stopping at the first violation.
pub fn evaluate(input: &RiskInput<'_>) -> RiskDecision {
    let violation = check_position_size(input.order, input.position, input.limit)
        .or_else(|| {
            check_leverage(
                input.order,
                input.snapshot.last_price,
                input.position,
                input.account,
                input.limit,
            )
        })
        .or_else(|| check_drawdown(input.account, input.limit))
        .or_else(|| check_daily_loss(input.account, input.limit))
        .or_else(|| check_market_gates(&input.conditions, &input.gates));

    match violation {
        Some(violation) => RiskDecision::Violation(violation),
        None => RiskDecision::Pass,
    }
}

fn signed(side: OrderSide, size: Decimal) -> Decimal {
    match side {
        OrderSide::Buy => size,
        OrderSide::Sell => -size,
    }
}

/// Absolute position after the order fills
pub fn resulting_size(order: &Order, position: Option<&Position>) -> Decimal {
    let current = position.filter(|p| p.is_open()).map(|p| p.signed_size()).unwrap_or_default();
    (current + signed(order.side, order.size)).abs()
}

/// True when the order only shrinks an open position without flipping it
pub fn is_reduce_only(order: &Order, position: Option<&Position>) -> bool {
    position
        .filter(|p| p.is_open())
        .is_some_and(|p| order.side == p.side.closing_side() && order.size <= p.size)
}

pub fn check_position_size(order: &Order, position: Option<&Position>, limit: &RiskLimit) -> Option<RiskViolation> {
    if is_reduce_only(order, position) {
        return None;
    }
    let size = resulting_size(order, position);
    (size > limit.max_position_size).then(|| RiskViolation {
        check: RiskCheckKind::PositionSize,
        value: size,
        threshold: limit.max_position_size,
    })
}

/// Leverage after the fill: the largest of the requested leverage, the
/// leverage an open same-side position carries into the add, and the
/// resulting notional over account equity. No equity, or a notional too
/// large to represent, means unbounded leverage.
pub fn resulting_leverage(order: &Order, price: Decimal, position: Option<&Position>, account: &AccountSnapshot) -> Decimal {
    let against_equity = match resulting_size(order, position).checked_mul(price) {
        Some(notional) if account.equity > Decimal::ZERO => notional.checked_div(account.equity).unwrap_or(Decimal::MAX),
        _ => Decimal::MAX,
    };
    let carried = position
        .filter(|p| p.is_open() && p.side == PositionSide::from_order_side(order.side))
        .map(|p| p.leverage)
        .unwrap_or(Decimal::ONE);
    order.leverage.max(carried).max(against_equity)
}

pub fn check_leverage(
    order: &Order,
    price: Decimal,
    position: Option<&Position>,
    account: &AccountSnapshot,
    limit: &RiskLimit,
) -> Option<RiskViolation> {
    if is_reduce_only(order, position) {
        return None;
    }
    let leverage = resulting_leverage(order, price, position, account);
    (leverage > limit.max_leverage).then(|| RiskViolation {
        check: RiskCheckKind::Leverage,
        value: leverage,
        threshold: limit.max_leverage,
    })
}

pub fn check_drawdown(account: &AccountSnapshot, limit: &RiskLimit) -> Option<RiskViolation> {
    (account.drawdown_pct >= limit.max_drawdown_pct).then(|| RiskViolation {
        check: RiskCheckKind::Drawdown,
        value: account.drawdown_pct,
        threshold: limit.max_drawdown_pct,
    })
}

pub fn check_daily_loss(account: &AccountSnapshot, limit: &RiskLimit) -> Option<RiskViolation> {
    let floor = -limit.daily_loss_limit;
    (account.daily_pnl <= floor).then(|| RiskViolation {
        check: RiskCheckKind::DailyLoss,
        value: account.daily_pnl,
        threshold: floor,
    })
}

/// Volatility is only enforced once enough history exists to compute it.
pub fn check_market_gates(conditions: &MarketConditions, gates: &MarketGates) -> Option<RiskViolation> {
    if let Some(floor) = gates.min_liquidity {
        if conditions.liquidity < floor {
            return Some(RiskViolation {
                check: RiskCheckKind::Liquidity,
                value: conditions.liquidity,
                threshold: floor,
            });
        }
    }
    if let (Some(ceiling), Some(volatility)) = (gates.max_volatility, conditions.volatility) {
        if volatility > ceiling {
            return Some(RiskViolation {
                check: RiskCheckKind::Volatility,
                value: volatility,
                threshold: ceiling,
            });
        }
    }
    None
}
