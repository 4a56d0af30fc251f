//! Daemon configuration: the runtime settings plus a `[log]` table.

use std::path::Path;

use anyhow::{Context, Result};
use parley_plugins::RuntimeConfig;
use parley_telemetry::LogConfig;
use serde::{Deserialize, Serialize};

/// Everything `parleyd` reads from its TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DaemonConfig {
    /// Plugin runtime settings (top-level keys and tables).
    #[serde(flatten)]
    pub(crate) runtime: RuntimeConfig,
    /// Logging settings.
    #[serde(default)]
    pub(crate) log: LogConfig,
}

impl DaemonConfig {
    /// Load `path`, or the default runtime config file when `path` is
    /// `None`. A missing default file yields the defaults; a missing
    /// explicit file is an error.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = RuntimeConfig::default_path()?;
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            },
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub(crate) fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
