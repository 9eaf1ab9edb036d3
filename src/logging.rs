//! Logging Module
//!
//! Structured logging with file output for diagnostics.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "sos-tracker";
const LOG_FILE_SUFFIX: &str = "log";

/// Initialize logging with console and file output under `log_dir`,
/// keeping at most `retention_days` daily files.
pub fn init(log_dir: &Path, retention_days: usize) {
    // Ensure log directory exists
    let _ = std::fs::create_dir_all(log_dir);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(file_appender(log_dir, retention_days));

    // Console layer (debug builds only)
    #[cfg(debug_assertions)]
    let console_layer = Some(
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .pretty(),
    );

    #[cfg(not(debug_assertions))]
    let console_layer: Option<fmt::Layer<_>> = None;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            EnvFilter::new("debug,hyper=warn,reqwest=warn")
        }
        #[cfg(not(debug_assertions))]
        {
            EnvFilter::new("info,hyper=warn,reqwest=warn")
        }
    });

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer);

    // A second init (tests, embedding hosts) keeps the first subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Daily `sos-tracker.<date>.log` files, oldest pruned past `retention_days`.
fn file_appender(log_dir: &Path, retention_days: usize) -> RollingFileAppender {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_days.max(1))
        .build(log_dir)
        .unwrap_or_else(|e| {
            eprintln!("Log retention unavailable ({}), keeping all log files", e);
            tracing_appender::rolling::daily(log_dir, format!("{}.{}", LOG_FILE_PREFIX, LOG_FILE_SUFFIX))
        })
}
