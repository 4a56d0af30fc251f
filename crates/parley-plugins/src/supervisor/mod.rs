//! Process supervisor.
//!
//! Owns every plugin child process. Starting an instance spawns its entry
//! command with piped stdio and launches two tasks for as long as the
//! instance lives: a watchdog that polls the process and drives crash
//! restarts, and a reader that decodes responses from the plugin's stdout
//! and forwards them on the inbound channel returned by
//! [`ProcessSupervisor::new`].
//!
//! The watchdog owns the child process and its reader task. Stopping an
//! instance cancels the watchdog, which tears the reader down before
//! killing the process and closing the pipes.

mod command;
mod watchdog;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{PluginError, PluginResult};
use crate::instance::PluginInstance;
use crate::ipc::{self, PluginEvent, PluginResponse};
use crate::plugin::PluginState;

use self::watchdog::{Live, Watchdog};

/// Write half of a plugin's stdin, shared between senders and the watchdog
/// (which swaps it on restart and clears it on teardown).
type StdinSlot = Arc<Mutex<Option<ChildStdin>>>;

/// A response decoded from a plugin's stdout.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The instance that wrote it.
    pub instance: Arc<PluginInstance>,
    /// The decoded response.
    pub response: PluginResponse,
}

/// Handle to a started instance's process machinery.
pub(crate) struct ProcessHandle {
    stdin: StdinSlot,
    cancel: CancellationToken,
    watchdog: JoinHandle<()>,
}

struct Inner {
    config: SupervisorConfig,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

/// Starts, stops and restarts plugin processes. Cheap to clone.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Create a supervisor and the receiver for every plugin's responses.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            inner: Arc::new(Inner { config, inbound }),
        };
        (supervisor, rx)
    }

    /// Supervision settings.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Spawn a stopped instance and begin supervising it. Resets the
    /// restart counter.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidState`] unless the instance is stopped,
    /// and [`PluginError::ProcessSpawnFailure`] if the entry command cannot
    /// be launched (the instance then stays stopped).
    pub async fn start(&self, instance: &Arc<PluginInstance>) -> PluginResult<()> {
        let mut process = instance.process.lock().await;
        let state = instance.state();
        if state != PluginState::Stopped || process.is_some() {
            return Err(PluginError::InvalidState {
                plugin_id: instance.id().clone(),
                state: state.to_string(),
                operation: "start",
            });
        }

        let (live, stdin) = spawn_process(instance, &self.inner.inbound)?;
        let pid = live.pid();
        instance.reset_restarts();
        if let Err(e) = instance.transition(PluginState::Running, "start") {
            live.shutdown(None).await;
            return Err(e);
        }

        let stdin: StdinSlot = Arc::new(Mutex::new(Some(stdin)));
        let cancel = CancellationToken::new();
        let watchdog = Watchdog {
            instance: Arc::clone(instance),
            config: self.inner.config.clone(),
            inbound: self.inner.inbound.clone(),
            stdin: Arc::clone(&stdin),
            cancel: cancel.clone(),
        };
        let watchdog = tokio::spawn(watchdog.run(live));
        *process = Some(ProcessHandle {
            stdin,
            cancel,
            watchdog,
        });

        info!(
            plugin_id = %instance.id(),
            version = %instance.version(),
            pid = ?pid,
            "Started plugin"
        );
        Ok(())
    }

    /// Kill the instance's process, tear down both tasks and close its
    /// pipes. Stopping a stopped instance is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for shutdown
    /// escalation.
    pub async fn stop(&self, instance: &PluginInstance) -> PluginResult<()> {
        let mut process = instance.process.lock().await;
        let previous = instance.mark_stopped();
        let Some(handle) = process.take() else {
            debug!(plugin_id = %instance.id(), "Plugin already stopped");
            return Ok(());
        };

        handle.cancel.cancel();
        if let Err(e) = handle.watchdog.await {
            warn!(plugin_id = %instance.id(), error = %e, "Watchdog task failed");
        }
        // The watchdog clears the slot; make sure no writer keeps the pipe.
        handle.stdin.lock().await.take();
        instance.set_pid(None);

        info!(
            plugin_id = %instance.id(),
            version = %instance.version(),
            previous = %previous,
            "Stopped plugin"
        );
        Ok(())
    }

    /// Operator restart: stop, then start with a fresh restart budget. No
    /// backoff applies.
    ///
    /// # Errors
    ///
    /// Returns any error from [`start`](Self::start).
    pub async fn restart(&self, instance: &Arc<PluginInstance>) -> PluginResult<()> {
        self.stop(instance).await?;
        self.start(instance).await
    }

    /// Write one event line to the instance's stdin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CrashExhausted`] if the instance crashed for
    /// good, [`PluginError::NotRunning`] if it otherwise has no live
    /// process, and [`PluginError::IpcWrite`] if the write fails.
    pub async fn send(&self, instance: &PluginInstance, event: &PluginEvent) -> PluginResult<()> {
        if !instance.is_running() {
            let max_restarts = restart_budget(instance, &self.inner.config);
            if instance.state() == PluginState::Crashed && instance.restart_count() >= max_restarts {
                return Err(PluginError::CrashExhausted {
                    plugin_id: instance.id().clone(),
                    max_restarts,
                });
            }
            return Err(PluginError::NotRunning(instance.id().clone()));
        }
        let slot = {
            let process = instance.process.lock().await;
            process.as_ref().map(|handle| Arc::clone(&handle.stdin))
        }
        .ok_or_else(|| PluginError::NotRunning(instance.id().clone()))?;

        let line = ipc::encode_event(instance.id(), event)?;
        let mut stdin = slot.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| PluginError::NotRunning(instance.id().clone()))?;
        let write_failed = |e: std::io::Error| PluginError::IpcWrite {
            plugin_id: instance.id().clone(),
            message: e.to_string(),
        };
        pipe.write_all(&line).await.map_err(write_failed)?;
        pipe.flush().await.map_err(write_failed)?;
        debug!(
            plugin_id = %instance.id(),
            event_id = %event.id,
            event = %event.name,
            "Sent event to plugin"
        );
        Ok(())
    }
}

/// Crash restarts allowed before an instance is left crashed.
fn restart_budget(instance: &PluginInstance, config: &SupervisorConfig) -> u32 {
    instance
        .manifest()
        .max_restarts
        .unwrap_or(config.default_max_restarts)
}

/// Spawn the instance's entry command with piped stdio and start its
/// reader task.
fn spawn_process(
    instance: &Arc<PluginInstance>,
    inbound: &mpsc::UnboundedSender<InboundMessage>,
) -> PluginResult<(Live, ChildStdin)> {
    let spawn_failed = |message: String| PluginError::ProcessSpawnFailure {
        plugin_id: instance.id().clone(),
        version: instance.version().to_string(),
        message,
    };

    let (program, args) = command::split_command(&instance.manifest().entry).map_err(spawn_failed)?;
    let program = resolve_program(instance, &program);

    let mut child: Child = Command::new(&program)
        .args(&args)
        .current_dir(instance.dir())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_failed(format!("{}: {e}", program.display())))?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(spawn_failed("child stdio was not captured".into()));
    };
    instance.set_pid(child.id());

    let live = Live::new(child, stdout, Arc::clone(instance), inbound.clone());
    Ok((live, stdin))
}

/// Relative programs containing a separator resolve against the plugin
/// directory; bare names are looked up on `PATH`.
fn resolve_program(instance: &PluginInstance, program: &str) -> PathBuf {
    let path = PathBuf::from(program);
    if path.is_relative() && path.components().count() > 1 {
        instance.dir().join(path)
    } else {
        path
    }
}
