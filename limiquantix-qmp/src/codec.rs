//! QMP wire codec.
//!
//! Every message is a single line of JSON terminated by `\n`:
//!
//! ```text
//! -> {"execute":"query-status","id":2}
//! <- {"return":{"status":"running","running":true},"id":2}
//! <- {"event":"STOP","data":{},"timestamp":{"seconds":1700000000,"microseconds":12}}
//! ```
//!
//! Commands carry a transaction id which QEMU echoes back in the reply, so
//! replies are routed by id rather than by arrival order. Frames without a
//! non-empty `event` field are replies.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{QmpError, Result};

/// Capability QEMU advertises when it accepts out-of-band execution.
pub const CAPABILITY_OOB: &str = "oob";

// ============================================================================
// TRANSACTION IDS
// ============================================================================

/// Monotonic transaction id source. Never yields `0`, which is reserved for
/// replies that cannot be attributed to a command.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting after `last` (used by tests to exercise wrap-around).
    pub fn starting_after(last: u32) -> Self {
        Self {
            last: AtomicU32::new(last),
        }
    }

    /// Allocate the next id, wrapping from `u32::MAX` back to `1`.
    pub fn next(&self) -> u32 {
        let step = |current: u32| match current.wrapping_add(1) {
            0 => 1,
            next => next,
        };

        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| Some(step(current)))
            .unwrap_or_else(|current| current);

        step(previous)
    }
}

// ============================================================================
// OUTBOUND
// ============================================================================

/// A command envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    #[serde(skip_serializing_if = "Option::is_none")]
    execute: Option<String>,
    #[serde(rename = "exec-oob", skip_serializing_if = "Option::is_none")]
    exec_oob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    id: u32,
}

impl Command {
    /// A regular, queued command.
    pub fn new(name: &str, arguments: Option<Value>, id: u32) -> Self {
        Self {
            execute: Some(name.to_string()),
            exec_oob: None,
            arguments,
            id,
        }
    }

    /// A command that bypasses QEMU's command queue (`exec-oob`).
    pub fn out_of_band(name: &str, arguments: Option<Value>, id: u32) -> Self {
        Self {
            execute: None,
            exec_oob: Some(name.to_string()),
            arguments,
            id,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.execute
            .as_deref()
            .or(self.exec_oob.as_deref())
            .unwrap_or_default()
    }

    /// Serialize as one newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)
            .map_err(|e| QmpError::InvalidArgument(format!("Unserializable command: {}", e)))?;
        line.push(b'\n');
        Ok(line)
    }
}

// ============================================================================
// GREETING
// ============================================================================

/// The banner QEMU writes as soon as a client connects.
#[derive(Debug, Clone, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    qmp: GreetingInfo,
}

#[derive(Debug, Clone, Deserialize)]
struct GreetingInfo {
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    capabilities: Vec<String>,
}

impl Greeting {
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(|e| QmpError::decode(line, e))
    }

    pub fn capabilities(&self) -> &[String] {
        &self.qmp.capabilities
    }

    pub fn supports_oob(&self) -> bool {
        self.qmp.capabilities.iter().any(|c| c == CAPABILITY_OOB)
    }

    pub fn version(&self) -> Option<&Value> {
        self.qmp.version.as_ref()
    }
}

// ============================================================================
// INBOUND
// ============================================================================

/// Time an event was emitted, as sent by QEMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

/// An asynchronous notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl Event {
    /// An event generated locally rather than read from the socket.
    pub fn synthetic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: Map::new(),
            timestamp: None,
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        let ts = self.timestamp?;
        let nanos = u32::try_from(ts.microseconds.checked_mul(1_000)?).ok()?;
        Utc.timestamp_opt(ts.seconds, nanos).single()
    }
}

/// Error object of a failed command.
#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    class: String,
    desc: String,
}

/// A reply to a command.
#[derive(Debug)]
pub struct Response {
    pub id: u32,
    /// `return` value, or the failure to hand to the waiter.
    pub payload: Result<Value>,
}

/// A decoded inbound line.
#[derive(Debug)]
pub enum Frame {
    Event(Event),
    Response(Response),
}

/// Decode one inbound line.
///
/// Works on raw bytes so a line that is not valid UTF-8 is just another
/// undecodable frame. Returns `None` for lines that cannot be attributed to
/// anything: invalid JSON, malformed events and replies whose id is unusable. A reply whose
/// body is malformed still yields a [`Response`] carrying a decode error,
/// so the waiter is woken instead of hanging.
pub fn decode_frame(line: &[u8]) -> Option<Frame> {
    let value: Value = serde_json::from_slice(line).ok()?;
    let object = value.as_object()?;

    let is_event = object
        .get("event")
        .and_then(Value::as_str)
        .is_some_and(|name| !name.is_empty());
    if is_event {
        return serde_json::from_value(value).ok().map(Frame::Event);
    }

    let id = match object.get("id") {
        None => 0,
        Some(id) => u32::try_from(id.as_u64()?).ok()?,
    };

    let payload = if let Some(error) = object.get("error") {
        match ErrorBody::deserialize(error) {
            Ok(body) => Err(QmpError::Protocol {
                class: body.class,
                desc: body.desc,
            }),
            Err(e) => Err(QmpError::decode(&String::from_utf8_lossy(line), e)),
        }
    } else if let Some(ret) = object.get("return") {
        Ok(ret.clone())
    } else {
        Err(QmpError::decode(
            &String::from_utf8_lossy(line),
            "reply carries neither return nor error",
        ))
    };

    Some(Frame::Response(Response { id, payload }))
}
