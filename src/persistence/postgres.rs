use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

use super::TradeStore;
use crate::domain::{DailyStats, Order, Position, TradeRecord};
use crate::error::Result;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, client_order_id, owner, symbol, order_type, limit_price, side, size,
                leverage, status, filled_size, avg_fill_price, failure_reason, created_at, updated_at,
                revision
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                filled_size = EXCLUDED.filled_size,
                avg_fill_price = EXCLUDED.avg_fill_price,
                failure_reason = EXCLUDED.failure_reason,
                updated_at = EXCLUDED.updated_at,
                revision = EXCLUDED.revision
            WHERE orders.revision <= EXCLUDED.revision
            "#,
        )
        .bind(order.id)
        .bind(&order.client_order_id)
        .bind(&order.owner)
        .bind(&order.symbol)
        .bind(order.kind.as_str())
        .bind(order.kind.limit_price())
        .bind(order.side.as_str())
        .bind(order.size)
        .bind(order.leverage)
        .bind(order.status.as_str())
        .bind(order.filled_size)
        .bind(order.avg_fill_price)
        .bind(&order.failure_reason)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.revision as i64)
        .execute(&self.pool)
        .await?;

        debug!(order_id = %order.id, status = %order.status, "Order persisted");
        Ok(())
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                owner, symbol, opened_at, side, size, entry_price, current_price, leverage,
                unrealized_pnl, realized_pnl, commission, stop_loss, take_profit,
                liquidation_price, status, updated_at, revision
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (owner, symbol, opened_at) DO UPDATE SET
                side = EXCLUDED.side,
                size = EXCLUDED.size,
                entry_price = EXCLUDED.entry_price,
                current_price = EXCLUDED.current_price,
                leverage = EXCLUDED.leverage,
                unrealized_pnl = EXCLUDED.unrealized_pnl,
                realized_pnl = EXCLUDED.realized_pnl,
                commission = EXCLUDED.commission,
                stop_loss = EXCLUDED.stop_loss,
                take_profit = EXCLUDED.take_profit,
                liquidation_price = EXCLUDED.liquidation_price,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at,
                revision = EXCLUDED.revision
            WHERE positions.revision <= EXCLUDED.revision
            "#,
        )
        .bind(&position.owner)
        .bind(&position.symbol)
        .bind(position.opened_at)
        .bind(position.side.as_str())
        .bind(position.size)
        .bind(position.entry_price)
        .bind(position.current_price)
        .bind(position.leverage)
        .bind(position.unrealized_pnl)
        .bind(position.realized_pnl)
        .bind(position.commission)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.liquidation_price)
        .bind(position.status.as_str())
        .bind(position.updated_at)
        .bind(position.revision as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TradeStore for PostgresStore {
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn save_order(&self, order: &Order) -> Result<()> {
        self.upsert_order(order).await
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn update_order(&self, order: &Order) -> Result<()> {
        self.upsert_order(order).await
    }

    #[instrument(skip(self, position), fields(owner = %position.owner, symbol = %position.symbol))]
    async fn save_position(&self, position: &Position) -> Result<()> {
        self.upsert_position(position).await
    }

    #[instrument(skip(self, position), fields(owner = %position.owner, symbol = %position.symbol))]
    async fn update_position(&self, position: &Position) -> Result<()> {
        self.upsert_position(position).await
    }

    #[instrument(skip(self, trade), fields(trade_id = %trade.id))]
    async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, order_id, owner, symbol, side, size, price, commission, realized_pnl, reason, executed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(trade.order_id)
        .bind(&trade.owner)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.size)
        .bind(trade.price)
        .bind(trade.commission)
        .bind(trade.realized_pnl)
        .bind(trade.reason.as_str())
        .bind(trade.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, stats), fields(owner = %stats.owner, date = %stats.date))]
    async fn save_daily_stats(&self, stats: &DailyStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_stats (
                owner, date, trade_count, winning_trades, losing_trades, realized_pnl,
                gross_profit, gross_loss, commissions, volume, largest_win, largest_loss,
                current_win_streak, current_loss_streak, max_win_streak, max_loss_streak,
                max_drawdown_pct, high_water_mark, revision, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, NOW())
            ON CONFLICT (owner, date) DO UPDATE SET
                trade_count = EXCLUDED.trade_count,
                winning_trades = EXCLUDED.winning_trades,
                losing_trades = EXCLUDED.losing_trades,
                realized_pnl = EXCLUDED.realized_pnl,
                gross_profit = EXCLUDED.gross_profit,
                gross_loss = EXCLUDED.gross_loss,
                commissions = EXCLUDED.commissions,
                volume = EXCLUDED.volume,
                largest_win = EXCLUDED.largest_win,
                largest_loss = EXCLUDED.largest_loss,
                current_win_streak = EXCLUDED.current_win_streak,
                current_loss_streak = EXCLUDED.current_loss_streak,
                max_win_streak = EXCLUDED.max_win_streak,
                max_loss_streak = EXCLUDED.max_loss_streak,
                max_drawdown_pct = EXCLUDED.max_drawdown_pct,
                high_water_mark = EXCLUDED.high_water_mark,
                revision = EXCLUDED.revision,
                updated_at = NOW()
            WHERE daily_stats.revision <= EXCLUDED.revision
            "#,
        )
        .bind(&stats.owner)
        .bind(stats.date)
        .bind(stats.trade_count as i32)
        .bind(stats.winning_trades as i32)
        .bind(stats.losing_trades as i32)
        .bind(stats.realized_pnl)
        .bind(stats.gross_profit)
        .bind(stats.gross_loss)
        .bind(stats.commissions)
        .bind(stats.volume)
        .bind(stats.largest_win)
        .bind(stats.largest_loss)
        .bind(stats.current_win_streak as i32)
        .bind(stats.current_loss_streak as i32)
        .bind(stats.max_win_streak as i32)
        .bind(stats.max_loss_streak as i32)
        .bind(stats.max_drawdown_pct)
        .bind(stats.high_water_mark)
        .bind(stats.revision as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
