//! A running (or runnable) copy of one plugin version.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::trace;

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::plugin::{PluginId, PluginState};
use crate::supervisor::ProcessHandle;

#[derive(Debug)]
struct InstanceStatus {
    state: PluginState,
    restart_count: u32,
    last_restart: Option<Instant>,
    pid: Option<u32>,
}

/// One installed plugin version and its runtime bookkeeping.
///
/// The manifest and directory never change. Lifecycle state, the restart
/// counter and the pid are updated by the supervisor; the process handle is
/// only touched while holding its async lock, which serializes start, stop
/// and crash restarts for this instance.
pub struct PluginInstance {
    manifest: Arc<PluginManifest>,
    dir: PathBuf,
    status: Mutex<InstanceStatus>,
    pub(crate) process: tokio::sync::Mutex<Option<ProcessHandle>>,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", self.id())
            .field("version", &self.version())
            .field("dir", &self.dir)
            .field("status", &*self.status())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of an instance, for listings and status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    /// Plugin identity.
    pub id: PluginId,
    /// Plugin version.
    pub version: String,
    /// Lifecycle state.
    pub state: PluginState,
    /// Crash restarts since the last explicit start.
    pub restart_count: u32,
    /// OS process id, while a process exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Install directory.
    pub dir: PathBuf,
}

impl PluginInstance {
    /// Create a stopped instance for `manifest` installed at `dir`.
    #[must_use]
    pub fn new(manifest: PluginManifest, dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest: Arc::new(manifest),
            dir: dir.into(),
            status: Mutex::new(InstanceStatus {
                state: PluginState::Stopped,
                restart_count: 0,
                last_restart: None,
                pid: None,
            }),
            process: tokio::sync::Mutex::new(None),
        }
    }

    /// Plugin identity.
    #[must_use]
    pub fn id(&self) -> &PluginId {
        &self.manifest.id
    }

    /// Plugin version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// The manifest this instance was created from.
    #[must_use]
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Install directory; the process runs with this as its working directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PluginState {
        self.status().state
    }

    /// Whether the instance currently accepts events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == PluginState::Running
    }

    /// Crash restarts performed since the last explicit start.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.status().restart_count
    }

    /// When the last crash restart was attempted.
    #[must_use]
    pub fn last_restart(&self) -> Option<Instant> {
        self.status().last_restart
    }

    /// OS pid of the current process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.status().pid
    }

    /// Snapshot for display.
    #[must_use]
    pub fn info(&self) -> InstanceInfo {
        let status = self.status();
        InstanceInfo {
            id: self.manifest.id.clone(),
            version: self.manifest.version.clone(),
            state: status.state,
            restart_count: status.restart_count,
            pid: status.pid,
            dir: self.dir.clone(),
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub(crate) fn transition(
        &self,
        next: PluginState,
        operation: &'static str,
    ) -> PluginResult<PluginState> {
        let mut status = self.status();
        let current = status.state;
        if !current.can_transition_to(next) {
            return Err(PluginError::InvalidState {
                plugin_id: self.manifest.id.clone(),
                state: current.to_string(),
                operation,
            });
        }
        status.state = next;
        trace!(plugin_id = %self.manifest.id, from = %current, to = %next, "State transition");
        Ok(current)
    }

    /// Move to `next` only if the current state is `expected`.
    pub(crate) fn transition_from(&self, expected: PluginState, next: PluginState) -> bool {
        let mut status = self.status();
        if status.state != expected || !expected.can_transition_to(next) {
            return false;
        }
        status.state = next;
        true
    }

    /// Move to `Stopped` from any state, returning the previous one.
    pub(crate) fn mark_stopped(&self) -> PluginState {
        let mut status = self.status();
        std::mem::replace(&mut status.state, PluginState::Stopped)
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.status().pid = pid;
    }

    /// Count a crash restart attempt and stamp its time.
    pub(crate) fn record_restart(&self) -> u32 {
        let mut status = self.status();
        status.restart_count = status.restart_count.saturating_add(1);
        status.last_restart = Some(Instant::now());
        status.restart_count
    }

    pub(crate) fn reset_restarts(&self) {
        let mut status = self.status();
        status.restart_count = 0;
        status.last_restart = None;
    }

    fn status(&self) -> MutexGuard<'_, InstanceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
