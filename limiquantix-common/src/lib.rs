//! # limiquantix Common
//!
//! Shared utilities for limiquantix components.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use limiquantix_common::{init_logging, LogFormat};
//!
//! // Human readable output for development
//! init_logging("info").unwrap();
//!
//! // Or pick the format from configuration
//! limiquantix_common::try_init_logging("debug", LogFormat::Json).ok();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, try_init_logging, LogFormat};
