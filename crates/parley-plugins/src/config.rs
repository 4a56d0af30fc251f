//! Runtime configuration.
//!
//! Loaded from `runtime.toml` under the parley home directory
//! (`$PARLEY_HOME`, or `~/.parley/`):
//!
//! ```toml
//! plugin_root = "/srv/parley/plugins"
//!
//! [supervisor]
//! poll_interval_ms = 1000
//! min_restart_interval_ms = 5000
//! default_max_restarts = 3
//!
//! [ipc]
//! skill_call_timeout_ms = 10000
//! health_check_timeout_ms = 5000
//!
//! [permissions]
//! center = ["send_message", "storage_get", "storage_set"]
//! worker = ["send_message"]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::signature::{Ed25519Verifier, ManifestVerifier, UnenforcedVerifier};

/// Environment variable overriding the parley home directory.
pub const HOME_ENV: &str = "PARLEY_HOME";

const CONFIG_FILE: &str = "runtime.toml";

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory plugins are installed into (`<root>/<id>/<version>/`).
    #[serde(default = "default_plugin_root")]
    pub plugin_root: PathBuf,
    /// Base64 Ed25519 publisher keys. When empty, manifest signatures are
    /// not enforced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_keys: Vec<String>,
    /// Process supervision settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// IPC timeouts.
    #[serde(default)]
    pub ipc: IpcConfig,
    /// Host-side action whitelists per deployment role.
    #[serde(default)]
    pub permissions: PermissionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_root: default_plugin_root(),
            trusted_keys: Vec::new(),
            supervisor: SupervisorConfig::default(),
            ipc: IpcConfig::default(),
            permissions: PermissionConfig::default(),
        }
    }
}

/// Process supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How often the watchdog checks whether a process is still alive.
    pub poll_interval_ms: u64,
    /// Minimum spacing between two crash restarts of one instance.
    pub min_restart_interval_ms: u64,
    /// Restart budget for manifests that do not declare one.
    pub default_max_restarts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            min_restart_interval_ms: 5_000,
            default_max_restarts: 3,
        }
    }
}

impl SupervisorConfig {
    /// Watchdog poll interval. Never zero.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Minimum spacing between crash restarts.
    #[must_use]
    pub fn min_restart_interval(&self) -> Duration {
        Duration::from_millis(self.min_restart_interval_ms)
    }
}

/// IPC timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// How long a cross-plugin skill call waits for a reply.
    pub skill_call_timeout_ms: u64,
    /// How long a hot update waits for the health-check response.
    pub health_check_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            skill_call_timeout_ms: 10_000,
            health_check_timeout_ms: 5_000,
        }
    }
}

impl IpcConfig {
    /// Skill call timeout.
    #[must_use]
    pub fn skill_call_timeout(&self) -> Duration {
        Duration::from_millis(self.skill_call_timeout_ms)
    }

    /// Health check timeout.
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Host-side action whitelists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Actions allowed for plugins running on the center.
    pub center: Vec<String>,
    /// Actions allowed for plugins running on workers.
    pub worker: Vec<String>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        let owned = |actions: &[&str]| actions.iter().map(|a| (*a).to_string()).collect();
        Self {
            center: owned(&[
                "send_message",
                "storage_get",
                "storage_set",
                "storage_delete",
                "http_request",
                "schedule_task",
            ]),
            worker: owned(&["send_message", "storage_get"]),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ConfigError`] if the TOML is invalid.
    pub fn from_toml(content: &str) -> PluginResult<Self> {
        toml::from_str(content).map_err(|e| PluginError::ConfigError(format!("Invalid config: {e}")))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined or the
    /// file cannot be read.
    pub fn load_default() -> PluginResult<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config path (`<parley home>/runtime.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn default_path() -> PluginResult<PathBuf> {
        Ok(parley_home()?.join(CONFIG_FILE))
    }

    /// Save configuration to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self, path: impl AsRef<Path>) -> PluginResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| PluginError::ConfigError(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build the manifest verifier these settings call for.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ConfigError`] if a trusted key is malformed.
    pub fn verifier(&self) -> PluginResult<Arc<dyn ManifestVerifier>> {
        if self.trusted_keys.is_empty() {
            return Ok(Arc::new(UnenforcedVerifier));
        }
        let mut verifier = Ed25519Verifier::new();
        for key in &self.trusted_keys {
            verifier = verifier
                .with_base64_key(key)
                .map_err(|e| PluginError::ConfigError(format!("trusted key: {e}")))?;
        }
        Ok(Arc::new(verifier))
    }
}

/// The parley home directory: `$PARLEY_HOME` if set, else `~/.parley`.
///
/// # Errors
///
/// Returns [`PluginError::ConfigError`] if `$PARLEY_HOME` is relative or no
/// home directory can be determined.
pub fn parley_home() -> PluginResult<PathBuf> {
    if let Ok(custom) = std::env::var(HOME_ENV) {
        let path = PathBuf::from(custom);
        if !path.is_absolute() {
            return Err(PluginError::ConfigError(format!(
                "{HOME_ENV} must be an absolute path"
            )));
        }
        return Ok(path);
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".parley"))
        .ok_or_else(|| {
            PluginError::ConfigError(format!(
                "neither {HOME_ENV} nor a home directory is available"
            ))
        })
}

fn default_plugin_root() -> PathBuf {
    parley_home().map_or_else(|_| PathBuf::from("plugins"), |home| home.join("plugins"))
}
