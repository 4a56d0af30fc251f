//! Plugin registry.
//!
//! Maps each plugin id to its installed versions in install order; the last
//! element is the latest. One lock guards the whole map and is only held for
//! bookkeeping, never across process or IPC work.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::error::{PluginError, PluginResult};
use crate::instance::PluginInstance;
use crate::package;
use crate::plugin::{PluginId, PluginState};
use crate::signature::{ManifestVerifier, UnenforcedVerifier};

type Entries = HashMap<PluginId, Vec<Arc<PluginInstance>>>;

/// Registry of installed plugin versions.
pub struct PluginRegistry {
    entries: Mutex<Entries>,
    verifier: Arc<dyn ManifestVerifier>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.lock().len())
            .field("verifier", &self.verifier)
            .finish()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Create an empty registry that does not enforce manifest signatures.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            verifier: Arc::new(UnenforcedVerifier),
        }
    }

    /// Use `verifier` for manifests of installed packages.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn ManifestVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// The signature verifier used on install.
    #[must_use]
    pub fn verifier(&self) -> &dyn ManifestVerifier {
        self.verifier.as_ref()
    }

    /// Install a package archive under `target_dir` and register a stopped
    /// instance for it.
    ///
    /// Nothing is registered unless extraction fully succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyInstalled`] if the version is already
    /// registered or present on disk, and any manifest, signature or
    /// extraction error from the package.
    pub fn install(&self, package: &Path, target_dir: &Path) -> PluginResult<Arc<PluginInstance>> {
        let manifest = package::read_manifest(package, self.verifier())?;
        if self
            .get(manifest.id.as_str(), Some(&manifest.version))
            .is_some()
        {
            return Err(PluginError::AlreadyInstalled {
                plugin_id: manifest.id,
                version: manifest.version,
            });
        }

        let (manifest, dir) = package::install_package(package, target_dir, self.verifier())?;
        let instance = PluginInstance::new(manifest, &dir);
        self.register(instance).inspect_err(|_| {
            // Lost a race with a concurrent install of the same version.
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "Failed to remove orphaned install");
            }
        })
    }

    /// Download a package from `url` and [`install`](Self::install) it.
    /// The temporary download is always removed.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DownloadFailed`] if the download fails, plus
    /// any error from [`install`](Self::install).
    pub async fn install_from_url(
        &self,
        url: &str,
        target_dir: &Path,
    ) -> PluginResult<Arc<PluginInstance>> {
        let download = package::download_package(url).await?;
        let result = self.install(download.path(), target_dir);
        if let Err(e) = download.close() {
            warn!(url, error = %e, "Failed to remove downloaded package");
        }
        result
    }

    /// Register an instance as the latest version of its plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyInstalled`] if the same id and version
    /// is already registered.
    pub fn register(&self, instance: PluginInstance) -> PluginResult<Arc<PluginInstance>> {
        let instance = Arc::new(instance);
        let mut entries = self.lock();
        let versions = entries.entry(instance.id().clone()).or_default();
        if versions.iter().any(|v| v.version() == instance.version()) {
            return Err(PluginError::AlreadyInstalled {
                plugin_id: instance.id().clone(),
                version: instance.version().to_string(),
            });
        }
        versions.push(Arc::clone(&instance));
        drop(entries);

        info!(
            plugin_id = %instance.id(),
            version = %instance.version(),
            "Registered plugin"
        );
        Ok(instance)
    }

    /// Look up an instance. `None` as version selects the latest.
    #[must_use]
    pub fn get(&self, id: &str, version: Option<&str>) -> Option<Arc<PluginInstance>> {
        let entries = self.lock();
        let versions = entries.get(id)?;
        match version {
            None | Some("") => versions.last().cloned(),
            Some(version) => versions.iter().find(|v| v.version() == version).cloned(),
        }
    }

    /// The latest installed version of `id`.
    #[must_use]
    pub fn latest(&self, id: &str) -> Option<Arc<PluginInstance>> {
        self.get(id, None)
    }

    /// The running instance of `id`, if any version is running.
    #[must_use]
    pub fn running_instance(&self, id: &str) -> Option<Arc<PluginInstance>> {
        let entries = self.lock();
        entries
            .get(id)?
            .iter()
            .rev()
            .find(|v| v.is_running())
            .cloned()
    }

    /// Every registered instance, ordered by id then install order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<PluginInstance>> {
        let entries = self.lock();
        let mut ids: Vec<&PluginId> = entries.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| entries.get(id))
            .flat_map(|versions| versions.iter().cloned())
            .collect()
    }

    /// Every instance currently in the running state.
    #[must_use]
    pub fn running(&self) -> Vec<Arc<PluginInstance>> {
        self.list().into_iter().filter(|i| i.is_running()).collect()
    }

    /// Remove one version from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the version is not registered
    /// and [`PluginError::InvalidState`] if it still has a live process.
    pub fn remove(&self, id: &str, version: &str) -> PluginResult<Arc<PluginInstance>> {
        let mut entries = self.lock();
        let versions = entries
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let index = versions
            .iter()
            .position(|v| v.version() == version)
            .ok_or_else(|| PluginError::NotFound(format!("{id}@{version}")))?;

        let state = versions[index].state();
        if matches!(state, PluginState::Running | PluginState::Restarting) {
            return Err(PluginError::InvalidState {
                plugin_id: versions[index].id().clone(),
                state: state.to_string(),
                operation: "remove",
            });
        }

        let removed = versions.remove(index);
        if versions.is_empty() {
            entries.remove(id);
        }
        drop(entries);

        info!(plugin_id = %removed.id(), version, "Removed plugin");
        Ok(removed)
    }

    /// Atomically swap `old_version` of a plugin for `new_instance`, which
    /// becomes the latest version. Any stale entry for the new version is
    /// dropped. Returns the replaced instance, if it was registered.
    pub fn replace(
        &self,
        old_version: &str,
        new_instance: Arc<PluginInstance>,
    ) -> Option<Arc<PluginInstance>> {
        let mut entries = self.lock();
        let versions = entries.entry(new_instance.id().clone()).or_default();

        let old = versions
            .iter()
            .position(|v| v.version() == old_version)
            .map(|index| versions.remove(index));
        versions.retain(|v| v.version() != new_instance.version());
        versions.push(Arc::clone(&new_instance));
        drop(entries);

        info!(
            plugin_id = %new_instance.id(),
            from = old_version,
            to = %new_instance.version(),
            "Swapped plugin version"
        );
        old
    }

    /// Number of distinct plugin ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginManifest;

    fn instance(id: &str, version: &str) -> PluginInstance {
        let json = format!(r#"{{"id": "{id}", "name": "{id}", "version": "{version}", "entry": "run"}}"#);
        let manifest = PluginManifest::from_slice(json.as_bytes(), Path::new("plugin.json")).unwrap();
        PluginInstance::new(manifest, format!("/plugins/{id}/{version}"))
    }

    #[test]
    fn test_register_and_get_latest() {
        let registry = PluginRegistry::new();
        registry.register(instance("weather", "1.0")).unwrap();
        registry.register(instance("weather", "1.1")).unwrap();

        assert_eq!(registry.latest("weather").unwrap().version(), "1.1");
        assert_eq!(registry.get("weather", Some("")).unwrap().version(), "1.1");
        assert_eq!(
            registry.get("weather", Some("1.0")).unwrap().version(),
            "1.0"
        );
        assert!(registry.get("weather", Some("2.0")).is_none());
        assert!(registry.get("missing", None).is_none());
    }

    #[test]
    fn test_lookup_is_idempotent() {
        let registry = PluginRegistry::new();
        registry.register(instance("weather", "1.0")).unwrap();
        let first = registry.get("weather", Some("1.0")).unwrap();
        let second = registry.get("weather", Some("1.0")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let registry = PluginRegistry::new();
        registry.register(instance("weather", "1.0")).unwrap();
        assert!(matches!(
            registry.register(instance("weather", "1.0")),
            Err(PluginError::AlreadyInstalled { .. })
        ));
    }

    #[test]
    fn test_list_is_flattened() {
        let registry = PluginRegistry::new();
        registry.register(instance("weather", "1.0")).unwrap();
        registry.register(instance("weather", "1.1")).unwrap();
        registry.register(instance("echo", "0.1")).unwrap();

        let listed: Vec<String> = registry
            .list()
            .iter()
            .map(|i| format!("{}@{}", i.id(), i.version()))
            .collect();
        assert_eq!(listed, vec!["echo@0.1", "weather@1.0", "weather@1.1"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.running().is_empty());
    }

    #[test]
    fn test_remove() {
        let registry = PluginRegistry::new();
        registry.register(instance("weather", "1.0")).unwrap();
        registry.remove("weather", "1.0").unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.remove("weather", "1.0"),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_refuses_running_instance() {
        let registry = PluginRegistry::new();
        let inst = registry.register(instance("weather", "1.0")).unwrap();
        inst.transition(PluginState::Running, "start").unwrap();
        assert!(matches!(
            registry.remove("weather", "1.0"),
            Err(PluginError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_replace_swaps_pointer() {
        let registry = PluginRegistry::new();
        registry.register(instance("weather", "1.0")).unwrap();
        let v2 = Arc::new(instance("weather", "2.0"));

        let old = registry.replace("1.0", Arc::clone(&v2)).unwrap();
        assert_eq!(old.version(), "1.0");
        assert!(Arc::ptr_eq(&registry.latest("weather").unwrap(), &v2));
        assert!(registry.get("weather", Some("1.0")).is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_replace_drops_stale_new_version() {
        let registry = PluginRegistry::new();
        registry.register(instance("weather", "1.0")).unwrap();
        registry.register(instance("weather", "2.0")).unwrap();
        let fresh = Arc::new(instance("weather", "2.0"));

        registry.replace("1.0", Arc::clone(&fresh));
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert!(Arc::ptr_eq(&listed[0], &fresh));
    }
}
