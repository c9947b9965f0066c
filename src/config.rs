use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Postgres persistence; the in-memory store is used when absent
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Recent prices retained per symbol (feeds the volatility gate)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Klines retained per (symbol, interval)
    #[serde(default = "default_kline_limit")]
    pub kline_limit: usize,
    /// Per-subscriber buffer; updates beyond it are dropped
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
    /// Ticks priced above this are refused
    #[serde(default = "default_max_price")]
    pub max_price: Decimal,
}

fn default_history_limit() -> usize {
    1000
}

fn default_kline_limit() -> usize {
    1000
}

fn default_subscriber_buffer() -> usize {
    100
}

fn default_reclaim_interval_secs() -> u64 {
    60
}

fn default_max_price() -> Decimal {
    dec!(1_000_000_000_000)
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            kline_limit: default_kline_limit(),
            subscriber_buffer: default_subscriber_buffer(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            max_price: default_max_price(),
        }
    }
}

impl MarketConfig {
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs.max(1))
    }
}

/// Limit applied to an (owner, symbol) with no explicit limit installed
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultLimitConfig {
    pub max_position_size: Decimal,
    pub max_leverage: Decimal,
    pub max_drawdown_pct: Decimal,
    pub daily_loss_limit: Decimal,
}

impl Default for DefaultLimitConfig {
    fn default() -> Self {
        Self {
            max_position_size: dec!(10),
            max_leverage: dec!(5),
            max_drawdown_pct: dec!(20),
            daily_loss_limit: dec!(1000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub default_limit: DefaultLimitConfig,
    /// Minimum visible notional on the consumed side of the book
    #[serde(default)]
    pub min_liquidity: Option<Decimal>,
    /// Maximum volatility (std-dev of simple returns) to accept new orders
    #[serde(default)]
    pub max_volatility: Option<Decimal>,
    /// Minimum returns needed before volatility is reported
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
    /// Retained risk-check records
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_volatility_window() -> usize {
    20
}

fn default_history_capacity() -> usize {
    1000
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            default_limit: DefaultLimitConfig::default(),
            min_liquidity: None,
            max_volatility: None,
            volatility_window: default_volatility_window(),
            history_capacity: default_history_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Commission as a fraction of notional (0.001 = 0.1%)
    #[serde(default = "default_commission_rate")]
    pub commission_rate: Decimal,
    /// Capacity of the trade record broadcast channel
    #[serde(default = "default_trade_channel_capacity")]
    pub trade_channel_capacity: usize,
    /// How long filled, failed and cancelled orders stay queryable
    #[serde(default = "default_order_retention_secs")]
    pub order_retention_secs: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

fn default_commission_rate() -> Decimal {
    dec!(0.001)
}

fn default_trade_channel_capacity() -> usize {
    1024
}

fn default_order_retention_secs() -> u64 {
    86_400
}

fn default_eviction_interval_secs() -> u64 {
    60
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
            trade_channel_capacity: default_trade_channel_capacity(),
            order_retention_secs: default_order_retention_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

impl ExecutionConfig {
    pub fn order_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(u32::try_from(self.order_retention_secs).unwrap_or(u32::MAX)))
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Collateral credited to an owner on first use
    #[serde(default = "default_initial_collateral")]
    pub initial_collateral: Decimal,
    #[serde(default = "default_maintenance_margin")]
    pub maintenance_margin: Decimal,
    /// Stop-loss distance from entry applied when an order carries none
    #[serde(default)]
    pub default_stop_loss_pct: Option<Decimal>,
    #[serde(default)]
    pub default_take_profit_pct: Option<Decimal>,
    /// Days of daily stats kept in memory
    #[serde(default = "default_stats_retention_days")]
    pub stats_retention_days: i64,
    #[serde(default = "default_rollover_interval_secs")]
    pub rollover_interval_secs: u64,
}

fn default_initial_collateral() -> Decimal {
    dec!(10000)
}

fn default_maintenance_margin() -> Decimal {
    dec!(0.025)
}

fn default_stats_retention_days() -> i64 {
    90
}

fn default_rollover_interval_secs() -> u64 {
    300
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_collateral: default_initial_collateral(),
            maintenance_margin: default_maintenance_margin(),
            default_stop_loss_pct: None,
            default_take_profit_pct: None,
            stats_retention_days: default_stats_retention_days(),
            rollover_interval_secs: default_rollover_interval_secs(),
        }
    }
}

impl LedgerConfig {
    pub fn rollover_interval(&self) -> Duration {
        Duration::from_secs(self.rollover_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g. config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADEGATE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // TRADEGATE_RISK__MAX_VOLATILITY, TRADEGATE_LEDGER__INITIAL_COLLATERAL, ...
            .add_source(
                Environment::with_prefix("TRADEGATE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.market.history_limit < 2 {
            errors.push("market.history_limit must be at least 2".to_string());
        }
        if self.market.kline_limit == 0 {
            errors.push("market.kline_limit must be positive".to_string());
        }
        if self.market.subscriber_buffer == 0 {
            errors.push("market.subscriber_buffer must be positive".to_string());
        }
        if self.market.max_price <= Decimal::ZERO {
            errors.push("market.max_price must be positive".to_string());
        }

        let limit = &self.risk.default_limit;
        for (name, value) in [
            ("max_position_size", limit.max_position_size),
            ("max_leverage", limit.max_leverage),
            ("max_drawdown_pct", limit.max_drawdown_pct),
            ("daily_loss_limit", limit.daily_loss_limit),
        ] {
            if value <= Decimal::ZERO {
                errors.push(format!("risk.default_limit.{name} must be positive"));
            }
        }
        if let Some(floor) = self.risk.min_liquidity {
            if floor < Decimal::ZERO {
                errors.push("risk.min_liquidity must not be negative".to_string());
            }
        }
        if let Some(ceiling) = self.risk.max_volatility {
            if ceiling <= Decimal::ZERO {
                errors.push("risk.max_volatility must be positive".to_string());
            }
        }
        if self.risk.volatility_window < 2 {
            errors.push("risk.volatility_window must be at least 2".to_string());
        }

        if self.execution.commission_rate < Decimal::ZERO || self.execution.commission_rate >= Decimal::ONE {
            errors.push("execution.commission_rate must be in [0, 1)".to_string());
        }

        if self.ledger.initial_collateral <= Decimal::ZERO {
            errors.push("ledger.initial_collateral must be positive".to_string());
        }
        if self.ledger.maintenance_margin < Decimal::ZERO || self.ledger.maintenance_margin >= Decimal::ONE {
            errors.push("ledger.maintenance_margin must be in [0, 1)".to_string());
        }
        for (name, pct) in [
            ("default_stop_loss_pct", self.ledger.default_stop_loss_pct),
            ("default_take_profit_pct", self.ledger.default_take_profit_pct),
        ] {
            if let Some(pct) = pct {
                if pct <= Decimal::ZERO || pct >= Decimal::ONE {
                    errors.push(format!("ledger.{name} must be between 0 and 1"));
                }
            }
        }
        if self.ledger.stats_retention_days <= 0 {
            errors.push("ledger.stats_retention_days must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.market.subscriber_buffer, 100);
        assert_eq!(config.execution.commission_rate, dec!(0.001));
        assert_eq!(config.ledger.maintenance_margin, dec!(0.025));
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent/tradegate").unwrap();
        assert_eq!(config.market.history_limit, 1000);
        assert!(config.database.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = AppConfig::default();
        config.risk.default_limit.max_leverage = Decimal::ZERO;
        config.execution.commission_rate = dec!(1.5);
        config.ledger.default_stop_loss_pct = Some(dec!(2));

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("max_leverage"));
    }
}
