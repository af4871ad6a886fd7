//! Connection multiplexer.
//!
//! One socket, three kinds of traffic:
//!
//! - commands written by callers, serialized by the send lock so only one
//!   command is on the wire at a time;
//! - replies, routed by the background listener to the waiter registered
//!   under the reply's transaction id;
//! - events, pushed by the listener into a bounded queue (dropped when
//!   full) and handed to the event handler on the blocking pool, with at
//!   most [`MAX_HANDLER_CALLS`] handler calls running at once.
//!
//! When the socket closes every registered waiter is woken with
//! [`QmpError::Disconnected`], and the `closed` token is cancelled once.
//!
//! Commands are not cancel-safe. Dropping a command future after its line
//! was fully written only forgets the waiter; dropping it mid-write would
//! leave a torn line on the wire, so the connection is closed instead.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::{decode_frame, Command, Event, Frame, Greeting, IdGenerator, Response};
use crate::error::{QmpError, Result};
use crate::transport::send_with_fd;

/// Command used to tell a hiccup from a dead QEMU.
const PING_COMMAND: &str = "query-version";

/// Event handler calls allowed to run at once. Events arriving while all
/// slots are busy are dropped.
pub const MAX_HANDLER_CALLS: usize = 16;

/// Callback receiving monitor events.
///
/// Runs on the blocking thread pool, so it may block without stalling the
/// connection.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

// ============================================================================
// PENDING REQUESTS
// ============================================================================

type Waiter = oneshot::Sender<Result<Value>>;

/// Waiters keyed by transaction id.
///
/// Once closed, registration fails and every waiter has been woken, so no
/// caller can end up waiting on a dead socket.
#[derive(Default)]
pub(crate) struct PendingTable {
    closed: bool,
    waiters: HashMap<u32, Waiter>,
}

impl PendingTable {
    pub(crate) fn register(&mut self, id: u32) -> Result<oneshot::Receiver<Result<Value>>> {
        if self.closed {
            return Err(QmpError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        Ok(rx)
    }

    pub(crate) fn forget(&mut self, id: u32) {
        self.waiters.remove(&id);
    }

    /// Deliver a reply. Returns false when nobody waits for that id.
    pub(crate) fn resolve(&mut self, response: Response) -> bool {
        match self.waiters.remove(&response.id) {
            Some(waiter) => {
                let _ = waiter.send(response.payload);
                true
            }
            None => false,
        }
    }

    /// Fail every waiter and refuse new ones.
    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        let drained = self.waiters.len();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(QmpError::Disconnected));
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

/// A negotiated monitor connection.
pub struct Connection {
    socket_path: PathBuf,
    oob: bool,
    ids: IdGenerator,
    /// Send lock. Held from write until the reply arrives.
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Arc<Mutex<PendingTable>>,
    handler: Arc<RwLock<Option<EventHandler>>>,
    handler_slots: Arc<Semaphore>,
    closed: CancellationToken,
    events_seen: Arc<Notify>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Read the greeting, start the listener and negotiate capabilities.
    ///
    /// Everything must finish before `deadline`, otherwise the half-open
    /// connection is torn down and [`QmpError::Timeout`] is returned.
    pub async fn open(
        stream: UnixStream,
        socket_path: &Path,
        handler: Option<EventHandler>,
        event_queue_capacity: usize,
        deadline: Instant,
    ) -> Result<Arc<Self>> {
        let timed_out = || QmpError::Timeout(socket_path.display().to_string());

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut banner = String::new();
        let read = tokio::time::timeout_at(deadline, reader.read_line(&mut banner))
            .await
            .map_err(|_| timed_out())??;
        if read == 0 {
            return Err(QmpError::Disconnected);
        }

        let greeting = Greeting::decode(&banner)?;
        debug!(
            socket = %socket_path.display(),
            capabilities = ?greeting.capabilities(),
            "QMP greeting received"
        );

        let conn = Arc::new(Self {
            socket_path: socket_path.to_path_buf(),
            oob: greeting.supports_oob(),
            ids: IdGenerator::new(),
            writer: Mutex::new(Some(write_half)),
            pending: Arc::new(Mutex::new(PendingTable::default())),
            handler: Arc::new(RwLock::new(handler)),
            handler_slots: Arc::new(Semaphore::new(MAX_HANDLER_CALLS)),
            closed: CancellationToken::new(),
            events_seen: Arc::new(Notify::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let (event_tx, event_rx) = mpsc::channel(event_queue_capacity);

        let listener = tokio::spawn(listen(
            reader,
            conn.pending.clone(),
            event_tx,
            conn.closed.clone(),
            conn.socket_path.clone(),
        ));
        let dispatcher = tokio::spawn(dispatch_events(
            event_rx,
            conn.handler.clone(),
            conn.handler_slots.clone(),
            conn.events_seen.clone(),
            conn.closed.clone(),
        ));
        conn.track(listener);
        conn.track(dispatcher);

        let arguments = conn.oob.then(|| json!({ "enable": ["oob"] }));
        let handshake = tokio::time::timeout_at(
            deadline,
            conn.execute("qmp_capabilities", arguments, None),
        )
        .await;

        match handshake {
            Ok(Ok(_)) => {
                info!(socket = %socket_path.display(), oob = conn.oob, "QMP capabilities negotiated");
                Ok(conn)
            }
            Ok(Err(e)) => {
                conn.close().await;
                Err(e)
            }
            Err(_) => {
                conn.close().await;
                Err(timed_out())
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether descriptor passing was negotiated.
    pub fn supports_oob(&self) -> bool {
        self.oob
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled once the connection is gone.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Signalled after each event handed to the handler.
    pub fn events_seen(&self) -> Arc<Notify> {
        self.events_seen.clone()
    }

    /// Replace the event handler. In-flight dispatches keep the handler
    /// they already cloned.
    pub async fn set_handler(&self, handler: Option<EventHandler>) {
        *self.handler.write().await = handler;
    }

    /// Deliver a locally generated event through the current handler.
    pub async fn emit(&self, event: Event) {
        deliver(&self.handler, &self.handler_slots, event).await;
    }

    /// Run a command and return its `return` value.
    ///
    /// I/O and decode failures trigger a ping; if QEMU does not answer the
    /// connection is closed and [`QmpError::Disconnected`] is returned
    /// instead of the raw error.
    pub async fn execute(&self, name: &str, arguments: Option<Value>, fd: Option<RawFd>) -> Result<Value> {
        match self.transact(name, arguments, fd).await {
            Err(e @ (QmpError::Io(_) | QmpError::Decode { .. })) => Err(self.confirm_alive(e).await),
            other => other,
        }
    }

    /// Check QEMU still answers; swap `err` for a disconnection if not.
    pub async fn confirm_alive(&self, err: QmpError) -> QmpError {
        match self.ping().await {
            Ok(()) => err,
            Err(ping_err) => {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %err,
                    ping_error = %ping_err,
                    "Monitor did not answer ping, disconnecting"
                );
                self.close().await;
                QmpError::Disconnected
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.transact(PING_COMMAND, None, None).await.map(|_| ())
    }

    async fn transact(&self, name: &str, arguments: Option<Value>, fd: Option<RawFd>) -> Result<Value> {
        if self.is_closed() {
            return Err(QmpError::Disconnected);
        }
        if fd.is_some() && !self.oob {
            return Err(QmpError::OobUnsupported);
        }

        let guard = self.writer.lock().await;
        if guard.is_none() {
            return Err(QmpError::Disconnected);
        }

        let command = Command::new(name, arguments, self.ids.next());
        let line = command.encode()?;
        let id = command.id();

        let reply = self.pending.lock().await.register(id)?;
        let mut flight = InFlight {
            conn: self,
            writer: guard,
            id,
            writing: false,
            finished: false,
        };

        trace!(socket = %self.socket_path.display(), command = name, id, "sending QMP command");

        let Some(writer) = flight.writer.as_mut() else {
            return Err(QmpError::Disconnected);
        };
        flight.writing = true;

        // A peer that stopped reading must not keep close() waiting on the
        // send lock.
        let written = tokio::select! {
            written = async {
                match fd {
                    Some(fd) => send_with_fd(writer, &line, fd).await,
                    None => write_line(writer, &line).await,
                }
            } => written,
            _ = self.closed.cancelled() => return Err(QmpError::Disconnected),
        };
        flight.writing = false;

        if let Err(e) = written {
            debug!(command = name, id, error = %e, "failed to write QMP command");
            return Err(QmpError::Io(e));
        }

        let result = reply.await.unwrap_or(Err(QmpError::Disconnected));
        flight.finished = true;
        drop(flight);

        if let Err(ref e) = result {
            debug!(command = name, id, error = %e, "QMP command failed");
        }
        result
    }

    /// Tear the connection down. Safe to call more than once.
    pub async fn close(&self) {
        let first = !self.closed.is_cancelled();
        mark_closed(&self.pending, &self.closed).await;

        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }

        // Dropping both halves closes the socket.
        self.writer.lock().await.take();

        if first {
            info!(socket = %self.socket_path.display(), "Monitor connection closed");
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(poisoned) => poisoned.into_inner().push(task),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// A command between registration and reply, holding the send lock.
struct InFlight<'a> {
    conn: &'a Connection,
    writer: MutexGuard<'a, Option<OwnedWriteHalf>>,
    id: u32,
    /// Part of the line may already be on the wire.
    writing: bool,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let pending = self.conn.pending.clone();
        let id = self.id;

        if !self.writing {
            if let Ok(mut table) = pending.try_lock() {
                table.forget(id);
            } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let pending = pending.clone();
                runtime.spawn(async move { pending.lock().await.forget(id) });
            }
            return;
        }

        warn!(
            socket = %self.conn.socket_path.display(),
            id,
            "Command abandoned mid-write, closing monitor connection"
        );
        self.writer.take();
        self.conn.closed.cancel();
        if let Ok(mut table) = pending.try_lock() {
            table.close();
        } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pending = pending.clone();
            runtime.spawn(async move { pending.lock().await.close() });
        };
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

async fn mark_closed(pending: &Mutex<PendingTable>, closed: &CancellationToken) {
    let drained = pending.lock().await.close();
    if drained > 0 {
        debug!(drained, "woke pending QMP requests with disconnection");
    }
    closed.cancel();
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Read frames until EOF, routing replies and queueing events.
async fn listen(
    mut reader: BufReader<OwnedReadHalf>,
    pending: Arc<Mutex<PendingTable>>,
    events: mpsc::Sender<Event>,
    closed: CancellationToken,
    socket_path: PathBuf,
) {
    debug!(socket = %socket_path.display(), "QMP listener started");

    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                info!(socket = %socket_path.display(), "Monitor socket closed by peer");
                break;
            }
            Ok(_) => route(&line, &pending, &events).await,
            Err(e) => {
                warn!(socket = %socket_path.display(), error = %e, "Failed to read from monitor socket");
                break;
            }
        }
    }

    mark_closed(&pending, &closed).await;
}

/// Route one inbound line.
pub(crate) async fn route(line: &[u8], pending: &Mutex<PendingTable>, events: &mpsc::Sender<Event>) {
    let line = line.trim_ascii();
    if line.is_empty() {
        return;
    }

    match decode_frame(line) {
        Some(Frame::Event(event)) => {
            trace!(event = %event.name, "QMP event received");
            match events.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!(event = %event.name, "Event queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Some(Frame::Response(response)) => {
            let id = response.id;
            if !pending.lock().await.resolve(response) {
                debug!(id, "Discarding QMP reply nobody waits for");
            }
        }
        None => {
            debug!(line = %String::from_utf8_lossy(line), "Discarding undecodable QMP frame");
        }
    }
}

async fn dispatch_events(
    mut events: mpsc::Receiver<Event>,
    handler: Arc<RwLock<Option<EventHandler>>>,
    slots: Arc<Semaphore>,
    events_seen: Arc<Notify>,
    closed: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = closed.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        deliver(&handler, &slots, event).await;
        events_seen.notify_one();
    }
}

async fn deliver(handler: &RwLock<Option<EventHandler>>, slots: &Arc<Semaphore>, event: Event) {
    let current = handler.read().await.clone();
    match current {
        Some(handler) => {
            let Ok(permit) = slots.clone().try_acquire_owned() else {
                warn!(event = %event.name, "All event handler slots busy, dropping event");
                return;
            };
            tokio::task::spawn_blocking(move || {
                handler(event);
                drop(permit);
            });
        }
        None => {
            trace!(event = %event.name, "No event handler registered, discarding event");
        }
    }
}
