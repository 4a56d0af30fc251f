//! Telemetry errors.

use thiserror::Error;

/// Why logging could not be set up.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Bad filter, or an unusable log directory.
    #[error("invalid logging configuration: {0}")]
    ConfigError(String),

    /// Another global subscriber is already installed.
    #[error("cannot install log subscriber: {0}")]
    InitError(String),
}

/// Result alias for telemetry setup.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
