use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tradegate::cli::{self, Cli, Commands};
use tradegate::config::AppConfig;
use tradegate::engine::ExecutionEngine;
use tradegate::error::{Result, TradeGateError};
use tradegate::logging::{init_logging, init_logging_simple};
use tradegate::persistence::{MemoryStore, PostgresStore, TradeStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::CheckConfig => {
            init_logging_simple();
            let config = load_config(&cli)?;
            println!("configuration ok");
            println!(
                "  commission rate {}, default limit: position {} leverage {} drawdown {}% daily loss {}",
                config.execution.commission_rate,
                config.risk.default_limit.max_position_size,
                config.risk.default_limit.max_leverage,
                config.risk.default_limit.max_drawdown_pct,
                config.risk.default_limit.daily_loss_limit,
            );
            match &config.database {
                Some(db) => println!("  persistence: postgres ({} connections)", db.max_connections),
                None => println!("  persistence: in-memory"),
            }
        }
        Commands::Replay { file, json } => {
            init_logging_simple();
            let config = load_config(&cli)?;
            let engine = ExecutionEngine::new(&config, open_store(&config).await?);
            let reader = BufReader::new(tokio::fs::File::open(file).await?);
            let summary = cli::replay(&engine, reader).await?;
            if *json {
                for owner in &summary.owners {
                    let positions = engine.positions(owner).await;
                    println!("{}", serde_json::to_string_pretty(&positions)?);
                }
            } else {
                cli::print_report(&engine, &summary).await;
            }
        }
        Commands::Run => {
            let config = load_config(&cli)?;
            let _guard = init_logging(&config.logging);
            run(config).await?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let config = AppConfig::load_from(&cli.config)?;
    config.validate()?;
    Ok(config)
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn TradeStore>> {
    match &config.database {
        Some(db) => {
            let store = PostgresStore::new(&db.url, db.max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured, trades are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!("Starting tradegate");
    let engine = ExecutionEngine::new(&config, open_store(&config).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = engine.spawn_background(shutdown_rx);

    let mut trades = engine.trades();
    let trade_log = tokio::spawn(async move {
        while let Ok(trade) = trades.recv().await {
            info!(
                owner = %trade.owner,
                symbol = %trade.symbol,
                side = %trade.side,
                size = %trade.size,
                price = %trade.price,
                reason = trade.reason.as_str(),
                "Trade"
            );
        }
    });

    info!("Engine running, waiting for shutdown signal");
    shutdown_signal().await;
    info!("Shutdown signal received");

    shutdown_tx
        .send(true)
        .map_err(|e| TradeGateError::Internal(format!("shutdown broadcast failed: {e}")))?;
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task ended abnormally: {}", e);
        }
    }
    trade_log.abort();

    let failures = engine.persistence_failures();
    if failures > 0 {
        warn!(failures, "Persistence writes failed during this run");
    }
    info!("tradegate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
