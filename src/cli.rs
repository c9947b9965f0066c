use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::domain::{Kline, OrderRequest, OrderStatus, PriceLevel, PriceSnapshot, RiskLimit};
use crate::engine::ExecutionEngine;
use crate::error::{Result, TradeGateError};

#[derive(Parser)]
#[command(name = "tradegate")]
#[command(version)]
#[command(about = "Risk-gated order execution and position ledger", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "TRADEGATE_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine with background tasks until interrupted
    Run,
    /// Drive a JSON-lines event file through the engine and print the result
    Replay {
        /// Events, one JSON object per line
        file: PathBuf,
        /// Print the final positions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load and validate configuration, then exit
    CheckConfig,
}

/// One line of a replay file
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    Tick {
        symbol: String,
        price: Decimal,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        bids: Vec<PriceLevel>,
        #[serde(default)]
        asks: Vec<PriceLevel>,
    },
    Kline(Kline),
    Limit(RiskLimit),
    Order(OrderRequest),
    Cancel {
        owner: String,
        client_order_id: String,
    },
    Collateral {
        owner: String,
        amount: Decimal,
    },
}

/// Counters from one replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub rejected: usize,
    pub filled: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub auto_closed: usize,
    pub owners: Vec<String>,
}

/// Apply every event in `reader` to `engine`, in order.
///
/// Orders are attempted inline so a replay is deterministic; limit orders
/// that are not yet executable stay pending and are retried by later ticks.
/// Lines that fail to parse or are refused by the engine are logged and
/// counted, not fatal.
pub async fn replay<R>(engine: &ExecutionEngine, reader: R) -> Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = ReplaySummary::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        summary.events += 1;

        let event: ReplayEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping unparseable event");
                summary.rejected += 1;
                continue;
            }
        };
        debug!(line = line_no, ?event, "Replaying event");

        if let Err(e) = apply(engine, event, &mut summary).await {
            warn!(line = line_no, error = %e, "Event refused");
            summary.rejected += 1;
        }
    }

    for owner in &summary.owners {
        for order in engine.orders(owner) {
            if order.status == OrderStatus::Pending {
                summary.pending += 1;
            }
        }
    }
    Ok(summary)
}

async fn apply(engine: &ExecutionEngine, event: ReplayEvent, summary: &mut ReplaySummary) -> Result<()> {
    match event {
        ReplayEvent::Tick {
            symbol,
            price,
            timestamp,
            bids,
            asks,
        } => {
            let snapshot =
                PriceSnapshot::new(symbol, price, timestamp.unwrap_or_else(Utc::now)).with_book(bids, asks);
            let report = engine.ingest(snapshot).await?;
            summary.filled += report.filled.len();
            summary.failed += report.failed.len();
            summary.auto_closed += report.auto_closed.len();
        }
        ReplayEvent::Kline(kline) => {
            engine.cache().update_kline(kline)?;
        }
        ReplayEvent::Limit(limit) => {
            engine.update_limit(limit).await?;
        }
        ReplayEvent::Order(request) => {
            track_owner(summary, &request.owner);
            let order_id = engine.submit(request).await?;
            let order = engine.attempt(order_id).await?;
            match order.status {
                OrderStatus::Filled => summary.filled += 1,
                OrderStatus::Failed => summary.failed += 1,
                OrderStatus::Pending | OrderStatus::Cancelled => {}
            }
        }
        ReplayEvent::Cancel { owner, client_order_id } => {
            let order = engine
                .order_by_client_id(&owner, &client_order_id)
                .ok_or_else(|| TradeGateError::Internal(format!("unknown client order id {client_order_id}")))?;
            engine.cancel(order.id).await?;
            summary.cancelled += 1;
        }
        ReplayEvent::Collateral { owner, amount } => {
            track_owner(summary, &owner);
            engine.set_collateral(&owner, amount).await?;
        }
    }
    Ok(())
}

fn track_owner(summary: &mut ReplaySummary, owner: &str) {
    if !summary.owners.iter().any(|o| o == owner) {
        summary.owners.push(owner.to_string());
    }
}

/// Human-readable end-of-replay report
pub async fn print_report(engine: &ExecutionEngine, summary: &ReplaySummary) {
    println!(
        "events: {}  rejected: {}  filled: {}  failed: {}  cancelled: {}  pending: {}  auto-closed: {}",
        summary.events,
        summary.rejected,
        summary.filled,
        summary.failed,
        summary.cancelled,
        summary.pending,
        summary.auto_closed
    );
    let today = Utc::now().date_naive();
    for owner in &summary.owners {
        let account = engine.account(owner).await;
        println!();
        println!(
            "{owner}: equity {} (realized {}, unrealized {}, commissions {}), drawdown {}%",
            account.equity.round_dp(4),
            account.realized_pnl.round_dp(4),
            account.unrealized_pnl.round_dp(4),
            account.commissions.round_dp(4),
            account.drawdown_pct.round_dp(2)
        );
        for position in engine.positions(owner).await {
            println!(
                "  {:<10} {:<5} size {:<12} entry {:<12} mark {:<12} upnl {}",
                position.symbol,
                position.side.as_str(),
                position.size,
                position.entry_price.round_dp(4),
                position.current_price,
                position.unrealized_pnl.round_dp(4)
            );
        }
        if let Some(stats) = engine.daily_stats(owner, today).await {
            println!(
                "  today: {} closes, win rate {}%, net {}",
                stats.trade_count,
                stats.win_rate().round_dp(1),
                stats.net_pnl().round_dp(4)
            );
        }
    }
}
