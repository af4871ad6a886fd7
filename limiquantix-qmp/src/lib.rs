//! # limiquantix QMP
//!
//! Client for the QEMU Machine Protocol monitor socket of a running VM.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   Monitor (registry, typed commands, jobs)   │
//! └──────────────────────┬───────────────────────┘
//!                        │ execute(name, args, fd)
//! ┌──────────────────────▼───────────────────────┐
//! │   Connection (send lock, pending replies)    │
//! │     listener task ──► replies by id          │
//! │                   └─► event queue ──► handler│
//! └──────────────────────┬───────────────────────┘
//!                        │ newline-delimited JSON (+ SCM_RIGHTS)
//!                   QEMU monitor socket
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use limiquantix_qmp::{EventHandler, Monitor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> limiquantix_qmp::Result<()> {
//!     let handler: EventHandler = Arc::new(|event| println!("{}", event.name));
//!     let monitor = Monitor::connect("/run/limiquantix/vm-1/qmp.sock", "agent-ringbuf", Some(handler)).await?;
//!
//!     monitor.start().await?;
//!     println!("VM is {}", monitor.status().await?);
//!
//!     monitor.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod jobs;
pub mod monitor;
pub mod transport;
pub mod types;

pub use codec::{Event, Timestamp};
pub use config::MonitorConfig;
pub use connection::EventHandler;
pub use error::{QmpError, Result};
pub use monitor::{
    parse_agent_status, AgentStatus, Monitor, AGENT_STATUS_STARTED, AGENT_STATUS_STOPPED,
    EVENT_AGENT_STARTED,
};
pub use types::*;
