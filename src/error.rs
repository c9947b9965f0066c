use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum TradeGateError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Boundary errors
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    MarketData(#[from] MarketDataError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TradeGateError
pub type Result<T> = std::result::Result<T, TradeGateError>;

/// Structural problems with an order request. Rejected before the order
/// enters the state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("owner is required")]
    MissingOwner,

    #[error("symbol is required")]
    MissingSymbol,

    #[error("size must be positive, got {size}")]
    NonPositiveSize { size: Decimal },

    #[error("limit price must be positive, got {price}")]
    NonPositiveLimitPrice { price: Decimal },

    #[error("leverage must be at least 1, got {leverage}")]
    InvalidLeverage { leverage: Decimal },

    #[error("{field} must be positive, got {value}")]
    NonPositiveProtection { field: &'static str, value: Decimal },

    #[error("duplicate client order id: {client_order_id}")]
    DuplicateClientOrderId { client_order_id: String },
}

/// Rejected risk limit updates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimitError {
    #[error("Invalid limit: {field} must be positive, got {value}")]
    InvalidLimit { field: &'static str, value: Decimal },

    #[error("Invalid limit: owner and symbol are required")]
    MissingKey,
}

/// Order lifecycle errors surfaced to callers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Invalid state: order {order_id} is {status}")]
    InvalidState { order_id: String, status: String },
}

/// Market data ingestion and lookup errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("No market data for {symbol}")]
    NoData { symbol: String },

    #[error("Rejected update for {symbol}: {reason}")]
    Rejected { symbol: String, reason: String },
}

/// Position ledger errors. `InvariantViolation` indicates a logic bug and the
/// mutation that triggered it is refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("No open position for {owner}/{symbol}")]
    PositionNotFound { owner: String, symbol: String },

    #[error("Invalid fill: {0}")]
    InvalidFill(String),

    #[error("Invalid price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: Decimal },

    #[error("Collateral must be positive, got {0}")]
    InvalidCollateral(Decimal),

    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),
}

impl From<Vec<String>> for TradeGateError {
    fn from(errors: Vec<String>) -> Self {
        TradeGateError::InvalidConfig(errors)
    }
}
