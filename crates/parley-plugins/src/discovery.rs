//! Discovery of installed plugins on disk.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::manifest::{MANIFEST_FILE, PluginManifest};
use crate::signature::ManifestVerifier;

/// A loadable manifest found under the plugin root.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// The parsed manifest.
    pub manifest: PluginManifest,
    /// The versioned directory containing it.
    pub dir: PathBuf,
}

/// Scan `<plugin_root>/<id>/<version>/plugin.json`.
///
/// Plugins are returned grouped by id (sorted), each id's versions oldest
/// first: semantic-version order when both versions parse, lexical order
/// otherwise. Unreadable directories and invalid manifests are logged and
/// skipped. A missing plugin root yields nothing.
#[must_use]
pub fn discover_installed(
    plugin_root: &Path,
    verifier: &dyn ManifestVerifier,
) -> Vec<DiscoveredPlugin> {
    let mut found = Vec::new();
    for id_dir in subdirectories(plugin_root) {
        for version_dir in subdirectories(&id_dir) {
            let manifest_path = version_dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }
            match PluginManifest::load_with(&manifest_path, verifier) {
                Ok(manifest) => {
                    if !version_dir.ends_with(
                        Path::new(manifest.id.as_str()).join(&manifest.version),
                    ) {
                        warn!(
                            path = %manifest_path.display(),
                            plugin_id = %manifest.id,
                            version = %manifest.version,
                            "Manifest does not match its install directory, skipping"
                        );
                        continue;
                    }
                    found.push(DiscoveredPlugin {
                        manifest,
                        dir: version_dir,
                    });
                },
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "Skipping invalid plugin");
                },
            }
        }
    }

    found.sort_by(|a, b| {
        a.manifest
            .id
            .cmp(&b.manifest.id)
            .then_with(|| compare_versions(&a.manifest.version, &b.manifest.version))
    });
    debug!(root = %plugin_root.display(), count = found.len(), "Discovered plugins");
    found
}

/// Order two version strings, semantically when both are semver.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "Cannot read plugin directory");
            }
            return Vec::new();
        },
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .map(|entry| entry.path())
        .collect();
    dirs.sort();
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::UnenforcedVerifier;

    fn write_manifest(root: &Path, id: &str, version: &str) {
        let dir = root.join(id).join(version);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            format!(r#"{{"id": "{id}", "name": "{id}", "version": "{version}", "entry": "run"}}"#),
        )
        .unwrap();
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0-beta", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1.1"), Ordering::Less);
    }

    #[test]
    fn test_discovers_versions_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "weather", "1.10.0");
        write_manifest(tmp.path(), "weather", "1.9.0");
        write_manifest(tmp.path(), "echo", "0.1.0");

        let found: Vec<String> = discover_installed(tmp.path(), &UnenforcedVerifier)
            .into_iter()
            .map(|p| format!("{}@{}", p.manifest.id, p.manifest.version))
            .collect();
        assert_eq!(found, vec!["echo@0.1.0", "weather@1.9.0", "weather@1.10.0"]);
    }

    #[test]
    fn test_skips_invalid_and_misplaced() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "weather", "1.0.0");

        let broken = tmp.path().join("broken").join("1.0.0");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(MANIFEST_FILE), "{ not json").unwrap();

        let misplaced = tmp.path().join("other").join("9.9.9");
        std::fs::create_dir_all(&misplaced).unwrap();
        std::fs::copy(
            tmp.path().join("weather/1.0.0").join(MANIFEST_FILE),
            misplaced.join(MANIFEST_FILE),
        )
        .unwrap();

        let found = discover_installed(tmp.path(), &UnenforcedVerifier);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].manifest.id.as_str(), "weather");
    }

    #[test]
    fn test_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover_installed(&tmp.path().join("nope"), &UnenforcedVerifier).is_empty());
    }
}
