//! Error types for the QMP monitor.

use thiserror::Error;

/// Longest slice of an offending payload carried by [`QmpError::Decode`].
const MAX_PAYLOAD_EXCERPT: usize = 256;

/// Errors that can occur while talking to a QEMU monitor socket.
#[derive(Error, Debug)]
pub enum QmpError {
    /// The monitor connection is gone (closed, crashed or never came back
    /// from a failed ping).
    #[error("Monitor is disconnected")]
    Disconnected,

    /// QEMU answered with a well-formed error reply.
    #[error("QMP error ({class}): {desc}")]
    Protocol { class: String, desc: String },

    /// A reply could not be decoded into the expected shape.
    #[error("Failed to decode monitor reply ({reason}): {payload}")]
    Decode { payload: String, reason: String },

    /// Establishing the connection took too long.
    #[error("Timed out connecting to monitor: {0}")]
    Timeout(String),

    /// A long-running job reached the failed state.
    #[error("Job {job} failed: {reason}")]
    JobFailed { job: String, reason: String },

    /// A block job disappeared while being waited on.
    #[error("Block job not found: {0}")]
    JobNotFound(String),

    /// No console with the given label exists (or its PTY is gone).
    #[error("No such console: {0}")]
    NoSuchConsole(String),

    /// File descriptor passing was requested but not negotiated.
    #[error("Monitor does not support out-of-band file descriptor passing")]
    OobUnsupported,

    /// A block node could not be removed because something still uses it.
    #[error("Block device is in use: {0}")]
    BlockDeviceInUse(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller supplied an unusable argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Local I/O failure (socket, console, NBD).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QmpError {
    /// Build a decode error, keeping only an escaped excerpt of the payload.
    pub fn decode(payload: &str, reason: impl ToString) -> Self {
        Self::Decode {
            payload: excerpt(payload),
            reason: reason.to_string(),
        }
    }

    /// Whether this is QEMU reporting that the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Protocol { class, desc } => {
                class == "DeviceNotFound"
                    || desc.contains("not found")
                    || desc.contains("Failed to find")
            }
            _ => false,
        }
    }

    /// Whether QEMU reported a duplicate object id.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Protocol { desc, .. } if desc.contains("duplicate"))
    }

    /// Whether the error means the monitor is unusable.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Escape control characters and cut long payloads.
fn excerpt(payload: &str) -> String {
    let escaped: String = payload.escape_debug().collect();
    if escaped.chars().count() <= MAX_PAYLOAD_EXCERPT {
        return escaped;
    }

    let mut cut: String = escaped.chars().take(MAX_PAYLOAD_EXCERPT).collect();
    cut.push_str("...");
    cut
}

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, QmpError>;
