//! File logging for the CLI.
//!
//! Everything at the configured level goes to a daily rolling file under
//! `~/.plugin-sync/logs/`; only warnings and errors reach stderr so command
//! output stays clean.

use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "plugin-sync.log";

/// Keeps the non-blocking writer flushing. Hold for the life of the process.
pub struct LoggingGuard {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init() -> LoggingGuard {
    let debug = std::env::var("PLUGIN_SYNC_DEBUG_LOG")
        .map(|value| value == "1")
        .unwrap_or(false);
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    };

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    let (file, guard) = match log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr)
        .with(file)
        .try_init();

    LoggingGuard { _file: guard }
}

fn log_dir() -> Option<PathBuf> {
    let dir = dirs::home_dir()?.join(".plugin-sync").join("logs");
    fs_err::create_dir_all(&dir).ok()?;
    Some(dir)
}
