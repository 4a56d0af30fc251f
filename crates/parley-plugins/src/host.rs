//! The plugin host: one registry, supervisor, dispatcher, skill bridge and
//! hot-update controller wired together for a host process.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::{SkillBridge, SkillCall};
use crate::config::RuntimeConfig;
use crate::discovery;
use crate::dispatcher::{ActionSink, DispatchSummary, Dispatcher};
use crate::error::{PluginError, PluginResult};
use crate::hot_update::HotUpdateController;
use crate::instance::PluginInstance;
use crate::ipc::PluginEvent;
use crate::package;
use crate::pending::PendingRequests;
use crate::permission::PermissionGate;
use crate::plugin::PluginId;
use crate::registry::PluginRegistry;
use crate::supervisor::ProcessSupervisor;

/// Runs plugins for a host process.
///
/// Must be created inside a Tokio runtime: construction spawns the task
/// that feeds plugin responses to the dispatcher.
pub struct PluginHost {
    config: RuntimeConfig,
    registry: Arc<PluginRegistry>,
    supervisor: ProcessSupervisor,
    dispatcher: Arc<Dispatcher>,
    bridge: SkillBridge,
    hot_update: HotUpdateController,
    inbound_task: JoinHandle<()>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugin_root", &self.config.plugin_root)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    /// Build a host from `config`, forwarding permitted plugin actions to
    /// `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ConfigError`] if a configured trusted key is
    /// malformed.
    pub fn new(config: RuntimeConfig, sink: Arc<dyn ActionSink>) -> PluginResult<Self> {
        let registry = Arc::new(PluginRegistry::new().with_verifier(config.verifier()?));
        let (supervisor, mut inbound) = ProcessSupervisor::new(config.supervisor.clone());
        let pending = PendingRequests::new();

        let bridge = SkillBridge::new(
            Arc::clone(&registry),
            supervisor.clone(),
            pending.clone(),
            config.ipc.skill_call_timeout(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            supervisor.clone(),
            PermissionGate::new(&config.permissions),
            bridge.clone(),
            pending.clone(),
            sink,
        ));
        let hot_update = HotUpdateController::new(
            Arc::clone(&registry),
            supervisor.clone(),
            pending,
            config.plugin_root.clone(),
            config.ipc.health_check_timeout(),
        );

        let inbound_dispatcher = Arc::clone(&dispatcher);
        let inbound_task = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                inbound_dispatcher.handle_response(message).await;
            }
        });

        Ok(Self {
            config,
            registry,
            supervisor,
            dispatcher,
            bridge,
            hot_update,
            inbound_task,
        })
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The plugin registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The process supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Register every plugin version already installed under the plugin
    /// root. Returns how many were registered.
    pub fn load_installed(&self) -> usize {
        let mut loaded: usize = 0;
        let found = discovery::discover_installed(&self.config.plugin_root, self.registry.verifier());
        for plugin in found {
            match self
                .registry
                .register(PluginInstance::new(plugin.manifest, plugin.dir))
            {
                Ok(_) => loaded = loaded.saturating_add(1),
                Err(PluginError::AlreadyInstalled { .. }) => {},
                Err(e) => warn!(error = %e, "Failed to register discovered plugin"),
            }
        }
        info!(root = %self.config.plugin_root.display(), loaded, "Loaded installed plugins");
        loaded
    }

    /// Start the latest version of every registered plugin that has no
    /// running version. Failures are logged. Returns how many started.
    pub async fn start_all(&self) -> usize {
        let mut started: usize = 0;
        let mut ids: Vec<PluginId> = self.registry.list().iter().map(|i| i.id().clone()).collect();
        ids.dedup();
        for id in ids {
            if self.registry.running_instance(id.as_str()).is_some() {
                continue;
            }
            let Some(instance) = self.registry.latest(id.as_str()) else {
                continue;
            };
            match self.supervisor.start(&instance).await {
                Ok(()) => started = started.saturating_add(1),
                Err(e) => error!(plugin_id = %id, error = %e, "Failed to start plugin"),
            }
        }
        started
    }

    /// Install a package. If another version of the plugin is running, the
    /// new version is hot-updated in; otherwise it is registered stopped.
    ///
    /// # Errors
    ///
    /// Returns install errors (bad package, signature, duplicate version)
    /// and, for hot updates, any [`HotUpdateController::hot_update`] error.
    /// A failed hot update removes the extracted files again.
    pub async fn install_package(&self, package: &Path) -> PluginResult<Arc<PluginInstance>> {
        let manifest = package::read_manifest(package, self.registry.verifier())?;
        let live = self.registry.running_instance(manifest.id.as_str());

        match live {
            Some(live) if live.version() != manifest.version => {
                if self
                    .registry
                    .get(manifest.id.as_str(), Some(&manifest.version))
                    .is_some()
                {
                    return Err(PluginError::AlreadyInstalled {
                        plugin_id: manifest.id,
                        version: manifest.version,
                    });
                }
                let (manifest, dir) = package::install_package(
                    package,
                    &self.config.plugin_root,
                    self.registry.verifier(),
                )?;
                let updated = self
                    .hot_update
                    .hot_update(manifest.id.as_str(), &manifest.version)
                    .await;
                if updated.is_err()
                    && let Err(e) = std::fs::remove_dir_all(&dir)
                {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove rejected version");
                }
                updated
            },
            _ => self.registry.install(package, &self.config.plugin_root),
        }
    }

    /// Download and [`install_package`](Self::install_package). The
    /// download is always removed afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DownloadFailed`] or any install error.
    pub async fn install_from_url(&self, url: &str) -> PluginResult<Arc<PluginInstance>> {
        let download = package::download_package(url).await?;
        let result = self.install_package(download.path()).await;
        if let Err(e) = download.close() {
            warn!(url, error = %e, "Failed to remove downloaded package");
        }
        result
    }

    /// Start a registered plugin version (`None` = latest).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] or any supervisor start error.
    pub async fn start(&self, id: &str, version: Option<&str>) -> PluginResult<Arc<PluginInstance>> {
        let instance = self.lookup(id, version)?;
        self.supervisor.start(&instance).await?;
        Ok(instance)
    }

    /// Stop a registered plugin version (`None` = latest).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the version is not registered.
    pub async fn stop(&self, id: &str, version: Option<&str>) -> PluginResult<()> {
        let instance = self.lookup(id, version)?;
        self.supervisor.stop(&instance).await
    }

    /// Operator restart of a plugin version (`None` = latest).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] or any supervisor start error.
    pub async fn restart(&self, id: &str, version: Option<&str>) -> PluginResult<()> {
        let instance = self.lookup(id, version)?;
        self.supervisor.restart(&instance).await
    }

    /// Hot-update plugin `id` to an already extracted `new_version`.
    ///
    /// # Errors
    ///
    /// See [`HotUpdateController::hot_update`].
    pub async fn hot_update(&self, id: &str, new_version: &str) -> PluginResult<Arc<PluginInstance>> {
        self.hot_update.hot_update(id, new_version).await
    }

    /// Deliver a host event to subscribers and intent matches.
    pub async fn dispatch_event(&self, event: &PluginEvent) -> DispatchSummary {
        self.dispatcher.dispatch_event(event).await
    }

    /// Deliver an event to one plugin version (`None` = latest).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] or any write error.
    pub async fn dispatch_to_plugin(
        &self,
        id: &str,
        version: Option<&str>,
        event: &PluginEvent,
    ) -> PluginResult<()> {
        self.dispatcher.dispatch_to_plugin(id, version, event).await
    }

    /// Call a plugin skill on behalf of `caller` and wait for its reply.
    ///
    /// # Errors
    ///
    /// See [`SkillBridge::call`].
    pub async fn call_skill(
        &self,
        caller: &PluginId,
        target: &str,
        skill: &str,
        params: Value,
    ) -> PluginResult<Value> {
        let call = SkillCall {
            caller: caller.clone(),
            target: target.to_string(),
            skill: skill.to_string(),
            params,
            correlation_id: None,
        };
        self.bridge.call(&call).await
    }

    /// Stop every plugin that has a process and stop reading responses.
    pub async fn shutdown(self) {
        for instance in self.registry.list() {
            if let Err(e) = self.supervisor.stop(&instance).await {
                warn!(plugin_id = %instance.id(), error = %e, "Failed to stop plugin");
            }
        }
        self.inbound_task.abort();
        info!("Plugin host shut down");
    }

    fn lookup(&self, id: &str, version: Option<&str>) -> PluginResult<Arc<PluginInstance>> {
        self.registry.get(id, version).ok_or_else(|| {
            PluginError::NotFound(match version {
                Some(v) if !v.is_empty() => format!("{id}@{v}"),
                _ => id.to_string(),
            })
        })
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.inbound_task.abort();
    }
}
