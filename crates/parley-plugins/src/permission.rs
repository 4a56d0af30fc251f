//! Action permission gate.
//!
//! An action is allowed only if the plugin's manifest declares it (the
//! manifest is the ceiling) and the host whitelists it for at least one of
//! the roles the plugin runs on. A manifest without `run_on` targets gets
//! the worker whitelist, the most restrictive one.

use std::collections::HashSet;

use tracing::warn;

use crate::config::PermissionConfig;
use crate::error::{PluginError, PluginResult};
use crate::manifest::{PluginManifest, RunOn};

/// Host-side whitelist check for plugin actions.
#[derive(Debug, Clone)]
pub struct PermissionGate {
    center: HashSet<String>,
    worker: HashSet<String>,
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new(&PermissionConfig::default())
    }
}

impl PermissionGate {
    /// Build a gate from configured whitelists.
    #[must_use]
    pub fn new(config: &PermissionConfig) -> Self {
        Self {
            center: config.center.iter().cloned().collect(),
            worker: config.worker.iter().cloned().collect(),
        }
    }

    /// Whether a plugin with `manifest` may perform `action`. Denials are
    /// logged.
    #[must_use]
    pub fn is_action_allowed(&self, manifest: &PluginManifest, action: &str) -> bool {
        self.check(manifest, action).is_ok()
    }

    /// Like [`is_action_allowed`](Self::is_action_allowed), as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::PermissionDenied`] if the manifest does not
    /// declare `action` or no run-on role whitelists it.
    pub fn check(&self, manifest: &PluginManifest, action: &str) -> PluginResult<()> {
        if !manifest.declares_permission(action) {
            warn!(
                plugin_id = %manifest.id,
                action,
                "Action denied: not declared in manifest permissions"
            );
            return Err(denied(manifest, action));
        }

        let whitelisted = if manifest.run_on.is_empty() {
            self.whitelist(RunOn::Worker).contains(action)
        } else {
            manifest
                .run_on
                .iter()
                .any(|role| self.whitelist(*role).contains(action))
        };
        if !whitelisted {
            warn!(
                plugin_id = %manifest.id,
                action,
                run_on = ?manifest.run_on,
                "Action denied: not whitelisted for the plugin's run-on targets"
            );
            return Err(denied(manifest, action));
        }
        Ok(())
    }

    fn whitelist(&self, role: RunOn) -> &HashSet<String> {
        match role {
            RunOn::Center => &self.center,
            RunOn::Worker => &self.worker,
        }
    }
}

fn denied(manifest: &PluginManifest, action: &str) -> PluginError {
    PluginError::PermissionDenied {
        plugin_id: manifest.id.clone(),
        action: action.to_string(),
    }
}
