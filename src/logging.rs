use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. When a log directory is set and
/// writable, a daily rolling file is added next to the console output; the
/// returned guard must be held for the life of the process so buffered lines
/// are flushed.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let default_directive = if config.level.trim().is_empty() {
        "info,tradegate=debug,sqlx=warn".to_string()
    } else {
        format!("{},sqlx=warn", config.level)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // `rolling::daily` panics if it cannot create the first file, so check
    // writability up front.
    let (file_layer, guard) = match config.directory.as_deref().filter(|d| writable(d)) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tradegate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => {
            if let Some(dir) = config.directory.as_deref() {
                eprintln!("Warning: cannot write to log directory {dir}, file logging disabled");
            }
            (None, None)
        }
    };

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let console_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init();

    if installed.is_err() {
        eprintln!("Warning: a global tracing subscriber is already installed");
    }
    guard
}

/// Minimal logging for short CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn writable(dir: &str) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = std::path::Path::new(dir).join(".tradegate_write_test");
    match std::fs::OpenOptions::new().create(true).append(true).open(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
