//! Plugin manifest types.
//!
//! A plugin manifest (`plugin.json`) describes a plugin's identity, entry
//! command, the actions it may perform, the events it subscribes to and the
//! intents it answers. Manifests are immutable once loaded; a version bump
//! ships a new manifest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;
use crate::signature::ManifestVerifier;

/// File name of the manifest inside a plugin directory or package.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Event name that subscribes a plugin to every event.
pub const WILDCARD_EVENT: &str = "*";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A plugin manifest loaded from `plugin.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier.
    pub id: PluginId,
    /// Human-readable display name.
    #[serde(default)]
    pub name: String,
    /// Version string; names the install directory.
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Entry command line, resolved relative to the plugin directory
    /// (e.g. `"python3 main.py --quiet"`).
    #[serde(default)]
    pub entry: String,
    /// Action types the plugin may emit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Event names the plugin subscribes to (`*` for all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    /// Free-text intents routed to this plugin.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intents: Vec<Intent>,
    /// Skill names this plugin answers via `call_skill`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Deployment roles the plugin runs on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_on: Vec<RunOn>,
    /// Per-request time budget in seconds.
    #[serde(default = "default_timeout_secs", alias = "timeout")]
    pub timeout_secs: u64,
    /// Crash restarts allowed before the instance is parked. Falls back to
    /// the host's supervisor default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    /// Base64 signature over [`PluginManifest::signing_payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Deployment role a plugin may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOn {
    /// The central orchestrator.
    Center,
    /// A worker node. The most restrictive role.
    Worker,
}

/// A keyword/regex rule that routes free text to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Intent name; matched events are named `intent_<name>`.
    pub name: String,
    /// Case-insensitive substrings that trigger the intent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Optional regular expression that triggers the intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Higher priorities are routed first.
    #[serde(default)]
    pub priority: i32,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl Intent {
    /// Create a keyword-only intent.
    #[must_use]
    pub fn keywords(name: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
            regex: None,
            priority: 0,
            compiled: None,
        }
    }

    /// Attach a regular expression.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error message if the pattern is invalid.
    pub fn with_regex(mut self, pattern: &str) -> Result<Self, String> {
        let compiled = Regex::new(pattern).map_err(|e| e.to_string())?;
        self.regex = Some(pattern.to_string());
        self.compiled = Some(compiled);
        Ok(self)
    }

    /// Set the routing priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether `text` triggers this intent.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        if let Some(re) = &self.compiled
            && re.is_match(text)
        {
            return true;
        }
        if self.keywords.is_empty() {
            return false;
        }
        let lowered = text.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| !k.is_empty())
            .any(|k| lowered.contains(&k.to_lowercase()))
    }

    fn compile(&mut self) -> Result<(), String> {
        if let Some(pattern) = &self.regex
            && self.compiled.is_none()
        {
            self.compiled = Some(Regex::new(pattern).map_err(|e| e.to_string())?);
        }
        Ok(())
    }
}

impl PluginManifest {
    /// Load and validate a manifest file without signature enforcement.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidManifest`] if the file cannot be read,
    /// parsed, or misses required fields.
    pub fn load(path: impl AsRef<Path>) -> PluginResult<Self> {
        Self::load_with(path, &crate::signature::UnenforcedVerifier)
    }

    /// Load and validate a manifest file, checking any signature with
    /// `verifier`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidManifest`] for unreadable or invalid
    /// manifests and [`PluginError::SignatureInvalid`] for a signature the
    /// verifier rejects.
    pub fn load_with(path: impl AsRef<Path>, verifier: &dyn ManifestVerifier) -> PluginResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| PluginError::InvalidManifest {
            path: path.to_path_buf(),
            message: format!("cannot read manifest: {e}"),
        })?;
        let manifest = Self::from_slice(&bytes, path)?;
        manifest.verify_signature(verifier)?;
        debug!(plugin_id = %manifest.id, version = %manifest.version, "Loaded manifest");
        Ok(manifest)
    }

    /// Parse and validate manifest JSON. `origin` is only used in errors.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidManifest`] if the JSON is malformed or
    /// a required field is empty.
    pub fn from_slice(bytes: &[u8], origin: &Path) -> PluginResult<Self> {
        let mut manifest: Self =
            serde_json::from_slice(bytes).map_err(|e| PluginError::InvalidManifest {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        manifest
            .validate()
            .map_err(|message| PluginError::InvalidManifest {
                path: origin.to_path_buf(),
                message,
            })?;
        Ok(manifest)
    }

    /// Check required fields and compile intent patterns.
    fn validate(&mut self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("field `name` must not be empty".into());
        }
        if self.entry.trim().is_empty() {
            return Err("field `entry` must not be empty".into());
        }
        if !is_safe_version(&self.version) {
            return Err(format!(
                "field `version` must be a non-empty path-safe string, got {:?}",
                self.version
            ));
        }
        for intent in &mut self.intents {
            if intent.name.trim().is_empty() {
                return Err("intent `name` must not be empty".into());
            }
            intent
                .compile()
                .map_err(|e| format!("intent `{}` has an invalid regex: {e}", intent.name))?;
        }
        Ok(())
    }

    /// Run the signature hook. Manifests without a signature pass.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SignatureInvalid`] if the verifier rejects
    /// the signature.
    pub fn verify_signature(&self, verifier: &dyn ManifestVerifier) -> PluginResult<()> {
        let Some(signature) = &self.signature else {
            return Ok(());
        };
        verifier
            .verify(self, signature)
            .map_err(|message| PluginError::SignatureInvalid {
                plugin_id: self.id.clone(),
                message,
            })
    }

    /// Canonical bytes covered by the signature: the manifest JSON with the
    /// `signature` field removed.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned).unwrap_or_default()
    }

    /// Whether the plugin receives events named `event_name`.
    #[must_use]
    pub fn subscribes_to(&self, event_name: &str) -> bool {
        self.events
            .iter()
            .any(|e| e == WILDCARD_EVENT || e == event_name)
    }

    /// Whether the manifest declares `action` among its permissions.
    #[must_use]
    pub fn declares_permission(&self, action: &str) -> bool {
        self.permissions.iter().any(|p| p == action)
    }

    /// Per-request time budget.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Directory this version installs into under `plugin_root`.
    #[must_use]
    pub fn install_dir(&self, plugin_root: &Path) -> PathBuf {
        plugin_root.join(self.id.as_str()).join(&self.version)
    }
}

/// Versions become directory names, so they may not contain separators or
/// relative components.
fn is_safe_version(version: &str) -> bool {
    !version.is_empty()
        && version != "."
        && version != ".."
        && !version.contains(['/', '\\'])
        && !version.chars().any(char::is_whitespace)
}
