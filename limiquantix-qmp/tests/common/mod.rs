//! In-process mock of a QEMU monitor socket.
//!
//! Speaks just enough QMP for the integration tests: writes the greeting,
//! answers `qmp_capabilities`, records every command it receives and hands
//! the rest to a per-test responder. It also flags any command that arrives
//! while a previous one is still unanswered.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use limiquantix_common::LogFormat;

/// What the mock does with a command.
#[derive(Debug, Clone)]
pub enum Reply {
    Return(Value),
    Error(&'static str, String),
    /// Written verbatim (the mock appends the newline).
    Raw(String),
    /// Never answer.
    Silent,
    /// Close the connection instead of answering.
    Hangup,
}

impl Reply {
    pub fn ok() -> Self {
        Self::Return(json!({}))
    }

    pub fn not_found(desc: &str) -> Self {
        Self::Error("DeviceNotFound", desc.to_string())
    }

    pub fn generic(desc: &str) -> Self {
        Self::Error("GenericError", desc.to_string())
    }
}

pub type Responder = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub capabilities: Vec<&'static str>,
    pub send_greeting: bool,
    pub reply_delay: Duration,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            send_greeting: true,
            reply_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Shared {
    commands: StdMutex<Vec<Value>>,
    outstanding: AtomicUsize,
    overlapped: AtomicBool,
    accepted: AtomicUsize,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

pub struct MockQemu {
    _dir: tempfile::TempDir,
    path: PathBuf,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockQemu {
    pub async fn start(responder: impl Fn(&str, &Value) -> Reply + Send + Sync + 'static) -> Self {
        Self::with_options(MockOptions::default(), responder).await
    }

    pub async fn with_options(
        options: MockOptions,
        responder: impl Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    ) -> Self {
        init_logging();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let shared = Arc::new(Shared::default());
        let responder: Responder = Arc::new(responder);

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let (read_half, mut write_half) = stream.into_split();

                if options.send_greeting {
                    let greeting = json!({
                        "QMP": {
                            "version": {"qemu": {"major": 8, "minor": 2, "micro": 0}, "package": ""},
                            "capabilities": options.capabilities,
                        }
                    });
                    write_half
                        .write_all(format!("{}\n", greeting).as_bytes())
                        .await
                        .unwrap();
                }

                *accept_shared.writer.lock().await = Some(write_half);
                tokio::spawn(serve(
                    BufReader::new(read_half),
                    accept_shared.clone(),
                    responder.clone(),
                    options.reply_delay,
                ));
            }
        });

        Self {
            _dir: dir,
            path,
            shared,
            accept_task,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every command received, in order, as sent on the wire.
    pub fn commands(&self) -> Vec<Value> {
        self.shared.commands.lock().unwrap().clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|c| c["execute"].as_str().map(str::to_string))
            .collect()
    }

    /// Last received command with the given name.
    pub fn last(&self, name: &str) -> Option<Value> {
        self.commands()
            .into_iter()
            .rev()
            .find(|c| c["execute"] == name)
    }

    pub fn count(&self, name: &str) -> usize {
        self.command_names().iter().filter(|n| *n == name).count()
    }

    /// Whether a command ever arrived before the previous one was answered.
    pub fn overlapped(&self) -> bool {
        self.shared.overlapped.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Push an event line to the connected client.
    pub async fn send_event(&self, name: &str, data: Value) {
        let line = json!({
            "event": name,
            "data": data,
            "timestamp": {"seconds": 1_700_000_000, "microseconds": 250},
        });
        write_line(&self.shared, &line.to_string()).await;
    }

    /// Push raw bytes to the connected client, newline appended.
    pub async fn send_raw(&self, bytes: &[u8]) {
        if let Some(writer) = self.shared.writer.lock().await.as_mut() {
            let mut line = bytes.to_vec();
            line.push(b'\n');
            let _ = writer.write_all(&line).await;
        }
    }

    /// Drop the client connection, as if QEMU exited.
    pub async fn hangup(&self) {
        self.shared.writer.lock().await.take();
    }
}

impl Drop for MockQemu {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    mut reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    shared: Arc<Shared>,
    responder: Responder,
    delay: Duration,
) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();

    // Read eagerly so a command sent before the previous reply is noticed.
    let read_shared = shared.clone();
    let read_task = tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }

            let command: Value = match serde_json::from_str(line.trim()) {
                Ok(command) => command,
                Err(_) => continue,
            };

            if read_shared.outstanding.fetch_add(1, Ordering::SeqCst) > 0 {
                read_shared.overlapped.store(true, Ordering::SeqCst);
            }
            read_shared.commands.lock().unwrap().push(command.clone());

            if tx.send(command).is_err() {
                break;
            }
        }
    });

    while let Some(command) = rx.recv().await {
        let name = command["execute"]
            .as_str()
            .or(command["exec-oob"].as_str())
            .unwrap_or_default()
            .to_string();
        let arguments = command.get("arguments").cloned().unwrap_or(Value::Null);
        let id = command.get("id").cloned().unwrap_or(Value::Null);

        let reply = if name == "qmp_capabilities" {
            Reply::ok()
        } else {
            responder(&name, &arguments)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // Count the command as answered before the client can see the reply.
        shared.outstanding.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Return(value) => {
                write_line(&shared, &json!({"return": value, "id": id}).to_string()).await
            }
            Reply::Error(class, desc) => {
                let line = json!({"error": {"class": class, "desc": desc}, "id": id});
                write_line(&shared, &line.to_string()).await
            }
            Reply::Raw(raw) => write_line(&shared, &raw).await,
            Reply::Silent => {}
            Reply::Hangup => {
                shared.writer.lock().await.take();
                break;
            }
        }
    }

    read_task.abort();
}

async fn write_line(shared: &Shared, line: &str) {
    if let Some(writer) = shared.writer.lock().await.as_mut() {
        let _ = writer.write_all(format!("{}\n", line).as_bytes()).await;
    }
}

pub fn init_logging() {
    let _ = limiquantix_common::try_init_logging("debug", LogFormat::Pretty);
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
