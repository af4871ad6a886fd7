//! Monitor tunables.
//!
//! Defaults match what the node daemon uses in production; tests shrink the
//! intervals so polling loops finish quickly.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{QmpError, Result};

/// Configuration of a monitor connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Hard timeout for dialing, reading the greeting and the handshake
    pub connect_timeout_ms: u64,

    /// Number of bytes requested from the agent ring buffer per check
    pub ringbuf_size: u32,

    /// Interval between periodic agent liveness checks
    pub watchdog_interval_ms: u64,

    /// Interval between status queries of migration and block jobs
    pub job_poll_interval_ms: u64,

    /// Capacity of the event queue between the listener and the handler.
    /// Events arriving while it is full are dropped.
    pub event_queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            ringbuf_size: 16,
            watchdog_interval_ms: 10_000,
            job_poll_interval_ms: 1_000,
            event_queue_capacity: 100,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: MonitorConfig = serde_yaml::from_str(&content).map_err(|e| {
            QmpError::InvalidArgument(format!(
                "Failed to parse monitor config {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the background tasks.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("connect_timeout_ms", self.connect_timeout_ms == 0),
            ("ringbuf_size", self.ringbuf_size == 0),
            ("watchdog_interval_ms", self.watchdog_interval_ms == 0),
            ("job_poll_interval_ms", self.job_poll_interval_ms == 0),
            ("event_queue_capacity", self.event_queue_capacity == 0),
        ];

        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(QmpError::InvalidArgument(format!("{} must be non-zero", name)));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}
