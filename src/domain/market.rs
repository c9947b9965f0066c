use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One level of an order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Saturates rather than overflowing on absurd feed sizes
    pub fn notional(&self) -> Decimal {
        self.price.saturating_mul(self.size)
    }
}

/// Point-in-time market state for one symbol.
///
/// Snapshots are immutable once published to the cache; an update replaces
/// the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub last_price: Decimal,
    /// Bids, best first
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    /// Asks, best first
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
}

impl PriceSnapshot {
    /// Snapshot with no book depth
    pub fn new(symbol: impl Into<String>, last_price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            last_price,
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp,
        }
    }

    pub fn with_book(mut self, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        self.bids = bids;
        self.asks = asks;
        self
    }

    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// Reject values an untrusted feed must never push into the cache.
    ///
    /// Prices above `max_price` are refused so that P&L and notional on any
    /// position marked at them stay representable.
    pub fn check_sane(&self, max_price: Decimal) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("empty symbol".to_string());
        }
        if self.last_price <= Decimal::ZERO {
            return Err(format!("non-positive last price {}", self.last_price));
        }
        if self.last_price > max_price {
            return Err(format!("last price {} above ceiling {}", self.last_price, max_price));
        }
        for level in self.bids.iter().chain(self.asks.iter()) {
            if level.price <= Decimal::ZERO || level.price > max_price || level.size < Decimal::ZERO {
                return Err(format!(
                    "invalid book level price={} size={}",
                    level.price, level.size
                ));
            }
        }
        Ok(())
    }
}

/// OHLCV candle retained per (symbol, interval)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Market-derived inputs for the risk manager's market gates
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarketConditions {
    /// Visible notional on the side of the book an order would consume
    pub liquidity: Decimal,
    /// Standard deviation of simple returns over retained price history,
    /// `None` until enough history exists
    pub volatility: Option<Decimal>,
}
