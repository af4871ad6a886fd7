//! Logging initialization using tracing.
//!
//! The level string is used unless `RUST_LOG` is set, which always wins.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one line per event
    #[default]
    Pretty,
    /// JSON lines for log aggregation
    Json,
}

/// Initialize human readable logging at `level` (trace, debug, info, warn,
/// error).
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    try_init_logging(level, LogFormat::Pretty)
}

/// Initialize logging with JSON output format.
/// Suitable for production environments with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    try_init_logging(level, LogFormat::Json)
}

/// Install a subscriber in the given format unless one is already set.
///
/// Pretty output goes through the test writer so `cargo test` captures it.
pub fn try_init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_test_writer(),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    result.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}
