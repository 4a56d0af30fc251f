//! Plugin identity and lifecycle state.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Unique, stable plugin identifier.
///
/// Identifiers double as directory names under the plugin root, so they are
/// restricted to lowercase ASCII alphanumerics, `-` and `_`, and must start
/// and end with an alphanumeric character.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PluginId(String);

/// Deserialize with validation: rejects malformed IDs (e.g. path traversal
/// payloads in crafted manifests).
impl<'de> Deserialize<'de> for PluginId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl PluginId {
    /// Create a new `PluginId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidId`] if the ID is empty or malformed.
    pub fn new(id: impl Into<String>) -> PluginResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create a `PluginId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a string is a valid plugin ID without constructing one.
    #[must_use]
    pub fn is_valid_id(id: &str) -> bool {
        Self::validate(id).is_ok()
    }

    fn validate(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::InvalidId("plugin id must not be empty".into()));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(PluginError::InvalidId(format!(
                "plugin id must contain only lowercase alphanumerics, '-' and '_', got: {id}"
            )));
        }
        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !edge_ok(id.chars().next()) || !edge_ok(id.chars().last()) {
            return Err(PluginError::InvalidId(format!(
                "plugin id must start and end with an alphanumeric character, got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PluginId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PluginId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The lifecycle state of a plugin instance.
///
/// ```text
/// stopped ──start──▶ running ──stop──▶ stopped
///                       │
///                     exit
///                       ▼
///                    crashed ──budget left──▶ restarting ──spawned──▶ running
///                       ▲                          │
///                       └──────spawn failed────────┘
/// ```
///
/// A `crashed` instance with no budget left stays parked until an operator
/// stops (and then starts) it. Every non-stopped state may be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Installed, no process.
    Stopped,
    /// Process is live and both monitoring tasks are active.
    Running,
    /// Process exited while it was expected to be running.
    Crashed,
    /// A crash-driven restart is in progress.
    Restarting,
}

impl PluginState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Stopped | Self::Restarting, Self::Running)
                | (Self::Running | Self::Crashed | Self::Restarting, Self::Stopped)
                | (Self::Running | Self::Restarting, Self::Crashed)
                | (Self::Crashed, Self::Restarting)
        )
    }

    /// Lowercase name used in logs and errors.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
