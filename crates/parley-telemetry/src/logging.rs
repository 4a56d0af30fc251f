//! Subscriber setup for Parley binaries.
//!
//! Logs go to stderr or to rolling files, never to stdout: `parleyd`
//! reserves stdout for forwarded plugin actions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::{TelemetryError, TelemetryResult};

/// Environment variable that replaces the configured filter when set.
pub const LOG_ENV: &str = "PARLEY_LOG";

/// How often rolling log files are cut.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    /// One file per day.
    #[default]
    Daily,
    /// One file per hour.
    Hourly,
    /// A single ever-growing file.
    Never,
}

impl FileRotation {
    fn rotation(self) -> Rotation {
        match self {
            Self::Daily => Rotation::DAILY,
            Self::Hourly => Rotation::HOURLY,
            Self::Never => Rotation::NEVER,
        }
    }
}

/// Line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, for reading at a terminal.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Where log lines are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Standard error.
    #[default]
    Stderr,
    /// Rolling files.
    File(FileLogConfig),
}

/// Rolling file settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLogConfig {
    /// Directory holding the log files. Created if missing.
    pub directory: PathBuf,
    /// File name prefix (`parleyd` gives `parleyd.2026-10-15`).
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Rotation period.
    #[serde(default)]
    pub rotation: FileRotation,
}

fn default_prefix() -> String {
    "parleyd".into()
}

/// Logging settings, usually the `[log]` table of the daemon config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Base filter, e.g. `info` or `warn,parley_plugins=debug`.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
    /// Output destination.
    pub target: LogTarget,
    /// Colored output. Ignored for JSON and file output.
    pub ansi: bool,
    /// Extra per-target directives appended to `level`.
    pub directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            ansi: true,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Defaults with the given base filter.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Self::default()
        }
    }

    /// Use `format`.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Append a directive such as `parley_plugins=trace`.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Write to rolling files in `directory` instead of stderr.
    #[must_use]
    pub fn with_file_logging(
        mut self,
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
        rotation: FileRotation,
    ) -> Self {
        self.target = LogTarget::File(FileLogConfig {
            directory: directory.into(),
            prefix: prefix.into(),
            rotation,
        });
        self
    }

    /// The filter string in effect: `env_override` wins when non-empty.
    fn filter_spec(&self, env_override: Option<&str>) -> String {
        if let Some(spec) = env_override.map(str::trim).filter(|s| !s.is_empty()) {
            return spec.to_string();
        }
        std::iter::once(self.level.as_str())
            .chain(self.directives.iter().map(String::as_str))
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn filter(&self, env_override: Option<&str>) -> TelemetryResult<EnvFilter> {
        let spec = self.filter_spec(env_override);
        EnvFilter::try_new(&spec)
            .map_err(|e| TelemetryError::ConfigError(format!("invalid log filter '{spec}': {e}")))
    }

    fn writer(&self) -> TelemetryResult<(BoxMakeWriter, bool)> {
        match &self.target {
            LogTarget::Stderr => Ok((BoxMakeWriter::new(std::io::stderr), self.ansi)),
            LogTarget::File(file) => {
                std::fs::create_dir_all(&file.directory).map_err(|e| {
                    TelemetryError::ConfigError(format!(
                        "cannot create log directory {}: {e}",
                        file.directory.display()
                    ))
                })?;
                let appender = RollingFileAppender::new(
                    file.rotation.rotation(),
                    &file.directory,
                    &file.prefix,
                );
                Ok((BoxMakeWriter::new(appender), false))
            },
        }
    }
}

/// Install the global subscriber described by `config`. [`LOG_ENV`], when
/// set, replaces the configured filter.
///
/// # Errors
///
/// Returns [`TelemetryError::ConfigError`] for a bad filter or log
/// directory and [`TelemetryError::InitError`] if a subscriber is already
/// installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let env_override = std::env::var(LOG_ENV).ok();
    let filter = config.filter(env_override.as_deref())?;
    let (writer, ansi) = config.writer()?;

    let layer = fmt::layer().with_writer(writer);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().with_ansi(ansi).boxed(),
        LogFormat::Compact => layer.compact().with_ansi(ansi).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::InitError(e.to_string()))
}

/// [`setup_logging`] with [`LogConfig::default`].
///
/// # Errors
///
/// See [`setup_logging`].
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_log_to_stderr() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.target, LogTarget::Stderr);
    }

    #[test]
    fn test_filter_spec_joins_directives() {
        let config = LogConfig::new("warn").with_directive("parley_plugins=debug");
        assert_eq!(config.filter_spec(None), "warn,parley_plugins=debug");
        assert!(config.filter(None).is_ok());
    }

    #[test]
    fn test_env_override_wins() {
        let config = LogConfig::new("warn").with_directive("parley_plugins=debug");
        assert_eq!(config.filter_spec(Some("trace")), "trace");
        assert_eq!(config.filter_spec(Some("  ")), "warn,parley_plugins=debug");
    }

    #[test]
    fn test_invalid_filter() {
        let config = LogConfig::new("info").with_directive("[broken=");
        assert!(matches!(config.filter(None), Err(TelemetryError::ConfigError(_))));
    }

    #[test]
    fn test_file_target_from_toml() {
        let config: LogConfig = toml::from_str(
            r#"
level = "debug"
format = "json"

[target.file]
directory = "/var/log/parley"
rotation = "hourly"
"#,
        )
        .unwrap();

        assert_eq!(config.format, LogFormat::Json);
        let LogTarget::File(file) = &config.target else {
            panic!("expected file target, got {:?}", config.target);
        };
        assert_eq!(file.directory, PathBuf::from("/var/log/parley"));
        assert_eq!(file.prefix, "parleyd");
        assert_eq!(file.rotation, FileRotation::Hourly);
        assert!(config.ansi);
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        let config = LogConfig::new("info").with_file_logging(&dir, "test", FileRotation::Never);

        let (_, ansi) = config.writer().unwrap();
        assert!(!ansi);
        assert!(dir.is_dir());
    }
}
