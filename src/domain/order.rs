use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PriceSnapshot;
use crate::error::ValidationError;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of checking an order against a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Fill at this price
    Satisfied(Decimal),
    /// Condition not met; stay pending
    NotYet,
}

/// Order type with its execution condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit { price: Decimal },
}

impl OrderKind {
    /// Market orders take the last price. Limit buys fill when the last price
    /// is at or below the limit, limit sells when it is at or above.
    pub fn try_execute(&self, side: OrderSide, snapshot: &PriceSnapshot) -> Execution {
        let price = snapshot.last_price;
        match *self {
            OrderKind::Market => Execution::Satisfied(price),
            OrderKind::Limit { price: limit } => {
                let crossed = match side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                };
                if crossed {
                    Execution::Satisfied(price)
                } else {
                    Execution::NotYet
                }
            }
        }
    }

    pub fn limit_price(&self) -> Option<Decimal> {
        match self {
            OrderKind::Market => None,
            OrderKind::Limit { price } => Some(*price),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit { .. } => "LIMIT",
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Accepted, waiting for an execution attempt to fill it
    Pending,
    Filled,
    Cancelled,
    /// Rejected by risk or the ledger; carries a reason on the order
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order request (what the caller wants to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub owner: String,
    pub symbol: String,
    #[serde(flatten)]
    pub kind: OrderKind,
    pub side: OrderSide,
    pub size: Decimal,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn market(
        owner: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        size: Decimal,
    ) -> Self {
        Self {
            owner: owner.into(),
            symbol: symbol.into(),
            kind: OrderKind::Market,
            side,
            size,
            leverage: None,
            stop_loss: None,
            take_profit: None,
            client_order_id: None,
        }
    }

    pub fn limit(
        owner: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        size: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            kind: OrderKind::Limit { price },
            ..Self::market(owner, symbol, side, size)
        }
    }

    pub fn with_leverage(mut self, leverage: Decimal) -> Self {
        self.leverage = Some(leverage);
        self
    }

    pub fn with_protection(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }

    /// Structural validation; nothing here looks at market or account state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.owner.trim().is_empty() {
            return Err(ValidationError::MissingOwner);
        }
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::MissingSymbol);
        }
        if self.size <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveSize { size: self.size });
        }
        if let OrderKind::Limit { price } = self.kind {
            if price <= Decimal::ZERO {
                return Err(ValidationError::NonPositiveLimitPrice { price });
            }
        }
        if let Some(leverage) = self.leverage {
            if leverage < Decimal::ONE {
                return Err(ValidationError::InvalidLeverage { leverage });
            }
        }
        for (field, value) in [("stop_loss", self.stop_loss), ("take_profit", self.take_profit)] {
            if let Some(value) = value {
                if value <= Decimal::ZERO {
                    return Err(ValidationError::NonPositiveProtection { field, value });
                }
            }
        }
        Ok(())
    }
}

/// An order owned by the execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub client_order_id: Option<String>,
    pub owner: String,
    pub symbol: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub size: Decimal,
    pub leverage: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every transition; stores keep the highest revision they see
    #[serde(default)]
    pub revision: u64,
}

impl Order {
    /// Build a pending order from a validated request
    pub fn from_request(request: OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_order_id: request.client_order_id,
            owner: request.owner,
            symbol: request.symbol,
            kind: request.kind,
            side: request.side,
            size: request.size,
            leverage: request.leverage.unwrap_or(Decimal::ONE),
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            status: OrderStatus::Pending,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn try_execute(&self, snapshot: &PriceSnapshot) -> Execution {
        self.kind.try_execute(self.side, snapshot)
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    pub fn mark_filled(&mut self, price: Decimal) {
        self.status = OrderStatus::Filled;
        self.filled_size = self.size;
        self.avg_fill_price = Some(price);
        self.touch();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = OrderStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.touch();
    }

    pub fn mark_cancelled(&mut self) {
        self.status = OrderStatus::Cancelled;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }
}

/// Why a trade happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeReason {
    Order,
    StopLoss,
    TakeProfit,
    Liquidation,
}

impl TradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeReason::Order => "order",
            TradeReason::StopLoss => "stop_loss",
            TradeReason::TakeProfit => "take_profit",
            TradeReason::Liquidation => "liquidation",
        }
    }
}

/// Record of one executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    /// Absent for automatic closes
    pub order_id: Option<Uuid>,
    pub owner: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub realized_pnl: Decimal,
    pub reason: TradeReason,
    pub timestamp: DateTime<Utc>,
}
