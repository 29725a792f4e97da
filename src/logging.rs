//! Logging initialisation
//!
//! Two sinks: the application log carries everything at the configured
//! level (also mirrored to stderr), the transaction log carries only
//! events with target `transaction`, one line per lifecycle transition.

use crate::config::Config;
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Initialise the tracing registry with the application and transaction
/// file sinks. Must run once, after the logs directory exists.
pub fn init(config: &Config) -> Result<()> {
    let logs_dir = &config.directories.logs;
    std::fs::create_dir_all(logs_dir)?;

    let app_file = open_log(logs_dir.join(&config.logging.application_log_file).as_path())?;
    let transaction_file =
        open_log(logs_dir.join(&config.logging.transaction_log_file).as_path())?;

    let level = match config.logging.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let app_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(app_file))
        .with_filter(filter_fn(move |meta| {
            meta.target() != "transaction" && *meta.level() <= level
        }));

    let transaction_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(transaction_file))
        .with_filter(filter_fn(|meta| meta.target() == "transaction"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter_fn(move |meta| {
            meta.target() != "transaction" && *meta.level() <= level
        }));

    tracing_subscriber::registry()
        .with(app_layer)
        .with(transaction_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging init failed: {}", e)))?;

    Ok(())
}

fn open_log(path: &std::path::Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::Io)
}
