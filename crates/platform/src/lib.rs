//! # IKE Platform
//!
//! Ambient plumbing shared by the IKEv2 engine crates.
//!
//! This crate provides:
//! - Unified platform error types (`PlatformError`, `PlatformResult`)
//! - The diagnostic sink contract (`LogSink`, `LogType`, `TracingSink`)
//! - JSON configuration loaders
//!
//! # Examples
//!
//! ```
//! use ike_platform::{LogSink, LogType, TracingSink};
//!
//! let sink = TracingSink;
//! sink.emit("IkeSaDirectory", "cookie mode enabled", LogType::HALF_OPEN, true);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod log;

pub use error::{PlatformError, PlatformResult};
pub use log::{init_tracing, LogSink, LogType, TracingSink};
