//! Health-checked blue/green version swaps.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::error::{PluginError, PluginResult};
use crate::instance::PluginInstance;
use crate::ipc::{HEALTH_CHECK_EVENT, PluginEvent};
use crate::manifest::{MANIFEST_FILE, PluginManifest};
use crate::pending::{PendingRequests, WaitError};
use crate::registry::PluginRegistry;
use crate::supervisor::ProcessSupervisor;

/// Replaces a live plugin version with a new one once the new one proves
/// healthy. A failed health check leaves the old version serving.
#[derive(Debug, Clone)]
pub struct HotUpdateController {
    registry: Arc<PluginRegistry>,
    supervisor: ProcessSupervisor,
    pending: PendingRequests,
    plugin_root: PathBuf,
    health_check_timeout: Duration,
}

impl HotUpdateController {
    /// Create a controller for plugins installed under `plugin_root`.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        supervisor: ProcessSupervisor,
        pending: PendingRequests,
        plugin_root: impl Into<PathBuf>,
        health_check_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor,
            pending,
            plugin_root: plugin_root.into(),
            health_check_timeout,
        }
    }

    /// Start `new_version` of plugin `id` from its install directory, health
    /// check it, and on success swap it in for the running version.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyInstalled`] if `new_version` is the
    /// version already running, manifest errors for the new version,
    /// [`PluginError::ProcessSpawnFailure`] if it cannot start, and
    /// [`PluginError::HealthCheckFailed`] if it does not answer the health
    /// check with `ok: true` in time. In every error case the old version
    /// is untouched and the new one is neither running nor registered.
    pub async fn hot_update(&self, id: &str, new_version: &str) -> PluginResult<Arc<PluginInstance>> {
        let old = self.registry.running_instance(id);
        if let Some(old) = &old
            && old.version() == new_version
        {
            return Err(PluginError::AlreadyInstalled {
                plugin_id: old.id().clone(),
                version: new_version.to_string(),
            });
        }

        let dir = self.plugin_root.join(id).join(new_version);
        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = PluginManifest::load_with(&manifest_path, self.registry.verifier())?;
        if manifest.id.as_str() != id || manifest.version != new_version {
            return Err(PluginError::InvalidManifest {
                path: manifest_path,
                message: format!(
                    "manifest declares {}@{}, expected {id}@{new_version}",
                    manifest.id, manifest.version
                ),
            });
        }

        let candidate = Arc::new(PluginInstance::new(manifest, dir));
        self.supervisor.start(&candidate).await?;

        if let Err(message) = self.health_check(&candidate).await {
            warn!(
                plugin_id = id,
                version = new_version,
                reason = %message,
                "Health check failed; keeping current version"
            );
            self.supervisor.stop(&candidate).await?;
            return Err(PluginError::HealthCheckFailed {
                plugin_id: candidate.id().clone(),
                version: new_version.to_string(),
                message,
            });
        }

        let old_version = old
            .as_ref()
            .map(|o| o.version().to_string())
            .unwrap_or_default();
        self.registry.replace(&old_version, Arc::clone(&candidate));
        if let Some(old) = &old {
            self.supervisor.stop(old).await?;
        }

        info!(
            plugin_id = id,
            from = %old_version,
            to = new_version,
            "Hot update complete"
        );
        Ok(candidate)
    }

    /// Send a `health-check` event and wait for an `ok: true` response.
    async fn health_check(&self, instance: &PluginInstance) -> Result<(), String> {
        let event = PluginEvent::new(HEALTH_CHECK_EVENT, json!({ "version": instance.version() }));
        let waiter = self.pending.expect_response(event.id.clone());

        self.supervisor
            .send(instance, &event)
            .await
            .map_err(|e| e.to_string())?;

        match waiter.wait(self.health_check_timeout).await {
            Ok(response) if response.ok => Ok(()),
            Ok(_) => Err("plugin reported unhealthy".into()),
            Err(WaitError::TimedOut) => Err(format!(
                "no response within {}ms",
                self.health_check_timeout.as_millis()
            )),
            Err(WaitError::Abandoned) => Err("health check abandoned".into()),
        }
    }
}
