//! QMP monitor registry and façade.
//!
//! There is at most one [`Monitor`] per socket path in the process. Calling
//! [`Monitor::connect`] again for a path that is already connected returns
//! the shared instance and rebinds its event handler to the new caller.
//!
//! Each monitor runs a watchdog which reads the guest agent ring buffer
//! (periodically and after every event) and emits [`EVENT_AGENT_STARTED`]
//! when the agent comes up.

use once_cell::sync::Lazy;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::codec::Event;
use crate::config::MonitorConfig;
use crate::connection::{Connection, EventHandler};
use crate::error::{QmpError, Result};
use crate::types::{ChardevInfo, StatusInfo, VersionInfo};

/// Event emitted when the guest agent reports it has started.
pub const EVENT_AGENT_STARTED: &str = "AGENT-STARTED";

/// Ring buffer marker written by the agent on start.
pub const AGENT_STATUS_STARTED: &str = "STARTED";

/// Ring buffer marker written by the agent on stop.
pub const AGENT_STATUS_STOPPED: &str = "STOPPED";

/// Process-wide table of live monitors keyed by socket path.
static MONITORS: Lazy<Mutex<HashMap<PathBuf, Arc<Monitor>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Last status marker found in the agent ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Started,
    Stopped,
}

/// Extract the last complete status line from ring buffer contents.
///
/// Only newline-terminated lines count; a trailing partial line is still
/// being written.
pub fn parse_agent_status(buffer: &str) -> Option<AgentStatus> {
    let entries: Vec<&str> = buffer.split('\n').collect();
    if entries.len() < 2 {
        return None;
    }

    match entries[entries.len() - 2] {
        AGENT_STATUS_STARTED => Some(AgentStatus::Started),
        AGENT_STATUS_STOPPED => Some(AgentStatus::Stopped),
        _ => None,
    }
}

/// A connected QEMU monitor.
pub struct Monitor {
    path: PathBuf,
    conn: Arc<Connection>,
    config: MonitorConfig,
    ringbuf_device: String,
    agent_started: AtomicBool,
}

impl Monitor {
    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Connect to the monitor socket at `path`, or reuse the live monitor
    /// already registered for it.
    ///
    /// `ringbuf_device` names the chardev the guest agent writes its status
    /// to; an empty name disables the agent watchdog.
    pub async fn connect(
        path: impl AsRef<Path>,
        ringbuf_device: &str,
        handler: Option<EventHandler>,
    ) -> Result<Arc<Self>> {
        Self::connect_with_config(path, ringbuf_device, handler, MonitorConfig::default()).await
    }

    pub async fn connect_with_config(
        path: impl AsRef<Path>,
        ringbuf_device: &str,
        handler: Option<EventHandler>,
        config: MonitorConfig,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let mut monitors = MONITORS.lock().await;

        if let Some(existing) = monitors.get(&path) {
            if !existing.conn.is_closed() {
                debug!(socket = %path.display(), "Reusing existing monitor connection");
                existing.conn.set_handler(handler).await;
                return Ok(existing.clone());
            }
            monitors.remove(&path);
        }

        config.validate()?;

        info!(socket = %path.display(), "Connecting to QEMU monitor");

        let deadline = Instant::now() + config.connect_timeout();
        let stream = tokio::time::timeout_at(deadline, UnixStream::connect(&path))
            .await
            .map_err(|_| QmpError::Timeout(path.display().to_string()))??;

        let conn = Connection::open(
            stream,
            &path,
            handler,
            config.event_queue_capacity,
            deadline,
        )
        .await?;

        let monitor = Arc::new(Self {
            path: path.clone(),
            conn,
            config,
            ringbuf_device: ringbuf_device.to_string(),
            agent_started: AtomicBool::new(false),
        });

        monitor.spawn_background_tasks();
        monitors.insert(path, monitor.clone());

        Ok(monitor)
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let closed = self.conn.closed_token();

        tokio::spawn(watch_agent(
            Arc::downgrade(self),
            closed.clone(),
            self.conn.events_seen(),
            self.config.watchdog_interval(),
        ));

        // Drop the registry entry when QEMU goes away on its own.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(monitor) = weak.upgrade() {
                monitor.unregister().await;
            }
        });
    }

    /// Close the connection and forget the monitor. Idempotent.
    pub async fn disconnect(&self) {
        self.conn.close().await;
        self.unregister().await;
    }

    async fn unregister(&self) {
        let mut monitors = MONITORS.lock().await;
        let is_self = monitors
            .get(&self.path)
            .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered), self));
        if is_self {
            monitors.remove(&self.path);
            debug!(socket = %self.path.display(), "Monitor removed from registry");
        }
    }

    /// Token cancelled when the monitor disconnects.
    pub fn wait(&self) -> Result<CancellationToken> {
        if self.conn.is_closed() {
            return Err(QmpError::Disconnected);
        }

        Ok(self.conn.closed_token())
    }

    pub fn is_disconnected(&self) -> bool {
        self.conn.is_closed()
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Whether descriptor passing is available on this connection.
    pub fn supports_fd_passing(&self) -> bool {
        self.conn.supports_oob()
    }

    /// Whether the guest agent has reported itself started. Never blocks.
    pub fn agent_started(&self) -> bool {
        self.agent_started.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Command primitive
    // =========================================================================

    /// Run `name` and decode its `return` value.
    pub(crate) async fn run<T: DeserializeOwned>(&self, name: &str, arguments: Option<Value>) -> Result<T> {
        let value = self.conn.execute(name, arguments, None).await?;
        self.decode(name, value).await
    }

    /// Run `name`, ignoring whatever it returns.
    pub(crate) async fn run_unit(&self, name: &str, arguments: Option<Value>) -> Result<()> {
        self.run::<IgnoredAny>(name, arguments).await.map(|_| ())
    }

    /// Run `name` with a descriptor attached.
    pub(crate) async fn run_with_fd<T: DeserializeOwned>(
        &self,
        name: &str,
        arguments: Value,
        fd: std::os::fd::RawFd,
    ) -> Result<T> {
        let value = self.conn.execute(name, Some(arguments), Some(fd)).await?;
        self.decode(name, value).await
    }

    async fn decode<T: DeserializeOwned>(&self, name: &str, value: Value) -> Result<T> {
        match T::deserialize(&value) {
            Ok(decoded) => Ok(decoded),
            Err(e) => {
                debug!(command = name, error = %e, "Unexpected QMP reply shape");
                let err = QmpError::decode(&value.to_string(), e);
                Err(self.conn.confirm_alive(err).await)
            }
        }
    }

    // =========================================================================
    // Run state
    // =========================================================================

    /// Current run state as reported by QEMU (`running`, `paused`, ...).
    pub async fn status(&self) -> Result<String> {
        let info: StatusInfo = self.run("query-status", None).await?;
        Ok(info.status)
    }

    /// QEMU version; also serves as a cheap liveness probe.
    pub async fn version(&self) -> Result<VersionInfo> {
        self.run("query-version", None).await
    }

    /// Start (or resume) emulation.
    pub async fn start(&self) -> Result<()> {
        self.run_unit("cont", None).await
    }

    /// Temporarily stop emulation.
    pub async fn pause(&self) -> Result<()> {
        self.run_unit("stop", None).await
    }

    /// Ask the guest to shut down gracefully (ACPI power button).
    pub async fn powerdown(&self) -> Result<()> {
        self.run_unit("system_powerdown", None).await
    }

    /// Make QEMU exit immediately.
    pub async fn quit(&self) -> Result<()> {
        self.run_unit("quit", None).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.run_unit("system_reset", None).await
    }

    // =========================================================================
    // Console
    // =========================================================================

    /// Open the host side of the PTY backing the chardev labelled `target`.
    pub async fn console(&self, target: &str) -> Result<tokio::fs::File> {
        let chardevs: Vec<ChardevInfo> = self.run("query-chardev", None).await?;

        for chardev in chardevs.iter().filter(|c| c.label == target) {
            let pty_path = Path::new(chardev.filename.trim_start_matches("pty:"));
            if !pty_path.exists() {
                continue;
            }

            let console = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(pty_path)
                .await?;
            debug!(label = target, pty = %pty_path.display(), "Opened console");
            return Ok(console);
        }

        Err(QmpError::NoSuchConsole(target.to_string()))
    }

    // =========================================================================
    // Agent watchdog
    // =========================================================================

    async fn check_agent(&self) {
        if self.ringbuf_device.is_empty() {
            return;
        }

        let arguments = json!({
            "device": self.ringbuf_device,
            "size": self.config.ringbuf_size,
            "format": "utf8",
        });

        let buffer: String = match self.run("ringbuf-read", Some(arguments)).await {
            Ok(buffer) => buffer,
            Err(e) => {
                trace!(device = %self.ringbuf_device, error = %e, "Skipping agent ring buffer check");
                return;
            }
        };

        match parse_agent_status(&buffer) {
            Some(AgentStatus::Started) => {
                if !self.agent_started.swap(true, Ordering::SeqCst) {
                    info!(socket = %self.path.display(), "Guest agent started");
                    self.conn.emit(Event::synthetic(EVENT_AGENT_STARTED)).await;
                }
            }
            Some(AgentStatus::Stopped) => {
                if self.agent_started.swap(false, Ordering::SeqCst) {
                    info!(socket = %self.path.display(), "Guest agent stopped");
                }
            }
            None => {}
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("path", &self.path)
            .field("ringbuf_device", &self.ringbuf_device)
            .field("disconnected", &self.conn.is_closed())
            .field("agent_started", &self.agent_started())
            .finish()
    }
}

/// Check the agent ring buffer on start, every `interval`, and after each
/// delivered event, until the connection closes.
async fn watch_agent(
    monitor: Weak<Monitor>,
    closed: CancellationToken,
    events_seen: Arc<tokio::sync::Notify>,
    interval: std::time::Duration,
) {
    loop {
        match monitor.upgrade() {
            Some(monitor) => monitor.check_agent().await,
            None => break,
        }

        tokio::select! {
            _ = closed.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
            _ = events_seen.notified() => {}
        }
    }
}
