//! Parley Telemetry - logging setup for the Parley plugin host.
//!
//! Libraries in this workspace log through `tracing` macros only; binaries
//! call [`setup_logging`] once at startup to install a subscriber.
//! `PARLEY_LOG` overrides the configured filter at run time.
//!
//! # Example
//!
//! ```rust,no_run
//! use parley_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), parley_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("parley_plugins=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!("Host starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LOG_ENV, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
