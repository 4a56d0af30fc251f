//! Plugin runtime error types.

use std::path::PathBuf;
use std::time::Duration;

use crate::plugin::PluginId;

/// Errors from plugin runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The requested plugin (or plugin version) was not found in the registry.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// The plugin ID is invalid.
    #[error("invalid plugin id: {0}")]
    InvalidId(String),

    /// A manifest is malformed or misses required fields.
    #[error("invalid manifest {path}: {message}")]
    InvalidManifest {
        /// Where the manifest came from (file or archive entry).
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// A manifest signature was present and did not verify.
    #[error("signature verification failed for {plugin_id}: {message}")]
    SignatureInvalid {
        /// The plugin whose manifest failed verification.
        plugin_id: PluginId,
        /// Verifier message.
        message: String,
    },

    /// This exact plugin version is already installed.
    #[error("plugin {plugin_id}@{version} is already installed")]
    AlreadyInstalled {
        /// Plugin identity.
        plugin_id: PluginId,
        /// Installed version.
        version: String,
    },

    /// The entry command could not be launched.
    #[error("failed to spawn {plugin_id}@{version}: {message}")]
    ProcessSpawnFailure {
        /// Plugin identity.
        plugin_id: PluginId,
        /// Plugin version.
        version: String,
        /// Spawn failure reason.
        message: String,
    },

    /// The restart budget is consumed; the instance is parked as crashed.
    #[error("plugin {plugin_id} exhausted its restart budget ({max_restarts} restarts)")]
    CrashExhausted {
        /// Plugin identity.
        plugin_id: PluginId,
        /// The configured budget.
        max_restarts: u32,
    },

    /// The operation is not valid in the instance's current state.
    #[error("plugin {plugin_id} is {state}, cannot {operation}")]
    InvalidState {
        /// Plugin identity.
        plugin_id: PluginId,
        /// Current lifecycle state.
        state: String,
        /// The attempted operation.
        operation: &'static str,
    },

    /// The instance has no live process to talk to.
    #[error("plugin {0} is not running")]
    NotRunning(PluginId),

    /// An action fell outside the plugin's declared or whitelisted scope.
    #[error("plugin {plugin_id} is not permitted to perform '{action}'")]
    PermissionDenied {
        /// Plugin identity.
        plugin_id: PluginId,
        /// The denied action type.
        action: String,
    },

    /// A plugin wrote something that is not a valid protocol message.
    #[error("malformed message from plugin {plugin_id}: {message}")]
    IpcDecode {
        /// Plugin identity.
        plugin_id: PluginId,
        /// Decoder error.
        message: String,
    },

    /// Writing to the plugin's stdin failed.
    #[error("failed to write to plugin {plugin_id}: {message}")]
    IpcWrite {
        /// Plugin identity.
        plugin_id: PluginId,
        /// Write error.
        message: String,
    },

    /// A cross-plugin skill call target is missing or not running.
    #[error("skill call to {target} unavailable: {reason}")]
    SkillCallUnavailable {
        /// The requested target plugin.
        target: String,
        /// Why the call could not be made.
        reason: String,
    },

    /// A cross-plugin skill call got no reply in time.
    #[error("skill call {skill} on {target} timed out after {timeout:?}")]
    SkillCallTimeout {
        /// The target plugin.
        target: String,
        /// The requested skill.
        skill: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The health check of a freshly started version failed.
    #[error("health check failed for {plugin_id}@{version}: {message}")]
    HealthCheckFailed {
        /// Plugin identity.
        plugin_id: PluginId,
        /// The version under test.
        version: String,
        /// Failure description.
        message: String,
    },

    /// Package archive could not be read or extracted.
    #[error("extraction error: {message}")]
    ExtractionError {
        /// Description of the extraction failure.
        message: String,
    },

    /// Path traversal detected in an archive entry.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// The offending path.
        path: String,
    },

    /// Downloading a package failed.
    #[error("download of {url} failed: {message}")]
    DownloadFailed {
        /// Source URL.
        url: String,
        /// Failure reason.
        message: String,
    },

    /// Runtime configuration could not be loaded.
    #[error("config error: {0}")]
    ConfigError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for plugin runtime operations.
pub type PluginResult<T> = Result<T, PluginError>;
