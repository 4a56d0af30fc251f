//! Plugin package handling.
//!
//! A package is a zip archive with `plugin.json` at its root. Installing a
//! package reads the manifest first, then extracts every entry into
//! `<plugin_root>/<id>/<version>/`, guarding against:
//! - Path traversal (`../` components, absolute paths)
//! - Symlink entries
//! - Excessive entry counts and uncompressed sizes (zip bombs)

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::{PluginError, PluginResult};
use crate::manifest::{MANIFEST_FILE, PluginManifest};
use crate::signature::ManifestVerifier;

/// Maximum number of entries allowed in a package.
const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total extracted size (500 MB).
const MAX_EXTRACTED_SIZE: u64 = 500_000_000;

/// Maximum size of the manifest entry itself.
const MAX_MANIFEST_SIZE: u64 = 1_000_000;

/// Maximum package download size (200 MB).
const MAX_DOWNLOAD_SIZE: usize = 200_000_000;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Read and validate the manifest at the root of a package without
/// extracting anything.
///
/// # Errors
///
/// Returns [`PluginError::ExtractionError`] if the archive is unreadable,
/// [`PluginError::InvalidManifest`] if `plugin.json` is missing or invalid,
/// and [`PluginError::SignatureInvalid`] if its signature is rejected.
pub fn read_manifest(
    package: &Path,
    verifier: &dyn ManifestVerifier,
) -> PluginResult<PluginManifest> {
    let mut archive = open_archive(package)?;
    let origin = package.join(MANIFEST_FILE);

    let mut entry = archive
        .by_name(MANIFEST_FILE)
        .map_err(|e| PluginError::InvalidManifest {
            path: origin.clone(),
            message: format!("package has no {MANIFEST_FILE} at its root: {e}"),
        })?;
    if entry.size() > MAX_MANIFEST_SIZE {
        return Err(PluginError::InvalidManifest {
            path: origin,
            message: format!("manifest exceeds {MAX_MANIFEST_SIZE} bytes"),
        });
    }

    let mut bytes = Vec::new();
    (&mut entry)
        .take(MAX_MANIFEST_SIZE)
        .read_to_end(&mut bytes)
        .map_err(|e| PluginError::ExtractionError {
            message: format!("failed to read {MANIFEST_FILE}: {e}"),
        })?;

    let manifest = PluginManifest::from_slice(&bytes, &origin)?;
    manifest.verify_signature(verifier)?;
    Ok(manifest)
}

/// Install a package under `plugin_root`, returning its manifest and the
/// versioned directory it was extracted into.
///
/// On any extraction failure the versioned directory is removed again, so
/// a failed install leaves nothing behind.
///
/// # Errors
///
/// Returns [`PluginError::AlreadyInstalled`] if the versioned directory
/// already exists, plus any error from [`read_manifest`] or extraction.
pub fn install_package(
    package: &Path,
    plugin_root: &Path,
    verifier: &dyn ManifestVerifier,
) -> PluginResult<(PluginManifest, PathBuf)> {
    let manifest = read_manifest(package, verifier)?;
    let dest = manifest.install_dir(plugin_root);

    if dest.exists() {
        return Err(PluginError::AlreadyInstalled {
            plugin_id: manifest.id.clone(),
            version: manifest.version.clone(),
        });
    }
    std::fs::create_dir_all(&dest).map_err(|e| PluginError::ExtractionError {
        message: format!("failed to create {}: {e}", dest.display()),
    })?;

    if let Err(e) = extract_package(package, &dest) {
        if let Err(cleanup) = std::fs::remove_dir_all(&dest) {
            warn!(
                dir = %dest.display(),
                error = %cleanup,
                "Failed to clean up partially extracted package"
            );
        }
        return Err(e);
    }

    info!(
        plugin_id = %manifest.id,
        version = %manifest.version,
        dir = %dest.display(),
        "Extracted plugin package"
    );
    Ok((manifest, dest))
}

/// Extract every entry of a package into `dest`, preserving relative paths
/// and unix file modes.
///
/// # Errors
///
/// Returns [`PluginError::ExtractionError`] on archive or filesystem
/// failures and [`PluginError::PathTraversal`] on entries that would escape
/// `dest`.
pub fn extract_package(package: &Path, dest: &Path) -> PluginResult<()> {
    let mut archive = open_archive(package)?;

    if archive.len() > MAX_ENTRY_COUNT {
        return Err(PluginError::ExtractionError {
            message: format!("archive exceeds maximum entry count ({MAX_ENTRY_COUNT})"),
        });
    }

    let dest = dest
        .canonicalize()
        .map_err(|e| PluginError::ExtractionError {
            message: format!("failed to canonicalize destination: {e}"),
        })?;

    let mut total_size: u64 = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| PluginError::ExtractionError {
                message: format!("failed to read archive entry {index}: {e}"),
            })?;

        if entry.unix_mode().is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
            return Err(PluginError::ExtractionError {
                message: format!("symlink entries are not allowed: {}", entry.name()),
            });
        }

        let relative = entry
            .enclosed_name()
            .ok_or_else(|| PluginError::PathTraversal {
                path: entry.name().to_string(),
            })?;
        let target = dest.join(&relative);
        if !target.starts_with(&dest) {
            return Err(PluginError::PathTraversal {
                path: entry.name().to_string(),
            });
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| PluginError::ExtractionError {
                message: format!("failed to create directory {}: {e}", target.display()),
            })?;
            continue;
        }

        total_size = total_size.saturating_add(entry.size());
        if total_size > MAX_EXTRACTED_SIZE {
            return Err(PluginError::ExtractionError {
                message: format!(
                    "archive exceeds maximum extracted size ({MAX_EXTRACTED_SIZE} bytes)"
                ),
            });
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PluginError::ExtractionError {
                message: format!("failed to create directory {}: {e}", parent.display()),
            })?;
        }
        let mode = entry.unix_mode();
        let declared = entry.size();
        write_entry(&mut entry, declared, mode, &target)?;
        debug!(path = %relative.display(), "Extracted package entry");
    }

    Ok(())
}

fn write_entry<R: Read>(
    entry: &mut R,
    declared: u64,
    mode: Option<u32>,
    target: &Path,
) -> PluginResult<()> {
    let mut out = File::create(target).map_err(|e| PluginError::ExtractionError {
        message: format!("failed to create {}: {e}", target.display()),
    })?;
    // Never copy more than the declared size.
    let copied = std::io::copy(&mut entry.take(declared), &mut out).map_err(|e| {
        PluginError::ExtractionError {
            message: format!("failed to extract {}: {e}", target.display()),
        }
    })?;
    if copied != declared {
        return Err(PluginError::ExtractionError {
            message: format!(
                "entry {} is truncated ({copied} of {declared} bytes)",
                target.display()
            ),
        });
    }

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| PluginError::ExtractionError {
                message: format!("failed to set mode on {}: {e}", target.display()),
            })?;
    }

    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

fn open_archive(package: &Path) -> PluginResult<ZipArchive<File>> {
    let file = File::open(package).map_err(|e| PluginError::ExtractionError {
        message: format!("failed to open package {}: {e}", package.display()),
    })?;
    ZipArchive::new(file).map_err(|e| PluginError::ExtractionError {
        message: format!("{} is not a valid zip archive: {e}", package.display()),
    })
}

/// Download a package into a temporary file.
///
/// The returned file is deleted when dropped.
///
/// # Errors
///
/// Returns [`PluginError::DownloadFailed`] on network errors, non-success
/// status codes or oversized bodies.
pub async fn download_package(url: &str) -> PluginResult<NamedTempFile> {
    let failed = |message: String| PluginError::DownloadFailed {
        url: url.to_string(),
        message,
    };

    debug!(url, "Downloading plugin package");
    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| failed(e.to_string()))?;
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    if bytes.len() > MAX_DOWNLOAD_SIZE {
        return Err(failed(format!(
            "package exceeds maximum download size ({MAX_DOWNLOAD_SIZE} bytes)"
        )));
    }

    let mut file = NamedTempFile::new()?;
    file.write_all(&bytes)?;
    file.flush()?;
    debug!(url, bytes = bytes.len(), "Downloaded plugin package");
    Ok(file)
}
