//! Per-instance watchdog and stdout reader tasks.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{InboundMessage, StdinSlot, restart_budget, spawn_process};
use crate::config::SupervisorConfig;
use crate::instance::PluginInstance;
use crate::ipc;
use crate::plugin::PluginState;

/// A live child process and the reader task draining its stdout.
pub(super) struct Live {
    child: Child,
    reader: JoinHandle<()>,
    reader_cancel: CancellationToken,
}

impl Live {
    pub(super) fn new(
        child: Child,
        stdout: ChildStdout,
        instance: Arc<PluginInstance>,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Self {
        let reader_cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(instance, stdout, inbound, reader_cancel.clone()));
        Self {
            child,
            reader,
            reader_cancel,
        }
    }

    pub(super) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the reader, then kill and reap the process, then close stdin.
    pub(super) async fn shutdown(mut self, stdin: Option<&StdinSlot>) {
        self.reader_cancel.cancel();
        if let Err(e) = (&mut self.reader).await {
            warn!(error = %e, "Reader task failed");
        }
        if let Err(e) = self.child.kill().await {
            // Already reaped by the watchdog's poll.
            debug!(error = %e, "Kill skipped");
        }
        if let Some(stdin) = stdin {
            stdin.lock().await.take();
        }
    }

    /// The process already exited: give the reader a moment to drain what
    /// the plugin wrote before dying, then tear it down.
    async fn reap(mut self, grace: Duration, stdin: &StdinSlot) {
        if tokio::time::timeout(grace, &mut self.reader).await.is_err() {
            self.reader_cancel.cancel();
            if let Err(e) = (&mut self.reader).await {
                warn!(error = %e, "Reader task failed");
            }
        }
        stdin.lock().await.take();
    }
}

/// Polls one instance's process and performs bounded crash restarts.
pub(super) struct Watchdog {
    pub(super) instance: Arc<PluginInstance>,
    pub(super) config: SupervisorConfig,
    pub(super) inbound: mpsc::UnboundedSender<InboundMessage>,
    pub(super) stdin: StdinSlot,
    pub(super) cancel: CancellationToken,
}

impl Watchdog {
    pub(super) async fn run(self, mut live: Live) {
        let poll = self.config.poll_interval();
        loop {
            let status = tokio::select! {
                () = self.cancel.cancelled() => {
                    live.shutdown(Some(&self.stdin)).await;
                    return;
                },
                () = tokio::time::sleep(poll) => match live.child.try_wait() {
                    Ok(Some(status)) => status,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(plugin_id = %self.instance.id(), error = %e, "Liveness check failed");
                        continue;
                    },
                },
            };

            live.reap(poll, &self.stdin).await;
            self.instance.set_pid(None);
            if !self
                .instance
                .transition_from(PluginState::Running, PluginState::Crashed)
            {
                // Exit raced with an explicit stop.
                return;
            }
            self.log_crash(status);

            match self.restart().await {
                Some(next) => live = next,
                None => return,
            }
        }
    }

    fn log_crash(&self, status: ExitStatus) {
        warn!(
            plugin_id = %self.instance.id(),
            version = %self.instance.version(),
            status = %status,
            restart_count = self.instance.restart_count(),
            "Plugin process exited unexpectedly"
        );
    }

    /// Restart a crashed instance while budget remains, spacing attempts by
    /// the configured minimum interval. Returns the new process, or `None`
    /// when the budget is spent or the instance was stopped meanwhile.
    async fn restart(&self) -> Option<Live> {
        let max_restarts = restart_budget(&self.instance, &self.config);
        loop {
            if self.instance.restart_count() >= max_restarts {
                error!(
                    plugin_id = %self.instance.id(),
                    version = %self.instance.version(),
                    max_restarts,
                    "Plugin exhausted its restart budget; leaving it crashed"
                );
                return None;
            }

            if let Some(last) = self.instance.last_restart() {
                let wait = self
                    .config
                    .min_restart_interval()
                    .saturating_sub(last.elapsed());
                if !wait.is_zero() {
                    debug!(
                        plugin_id = %self.instance.id(),
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "Delaying restart"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return None,
                        () = tokio::time::sleep(wait) => {},
                    }
                }
            }

            if self.cancel.is_cancelled()
                || !self
                    .instance
                    .transition_from(PluginState::Crashed, PluginState::Restarting)
            {
                return None;
            }
            let attempt = self.instance.record_restart();

            match spawn_process(&self.instance, &self.inbound) {
                Ok((live, stdin)) => {
                    *self.stdin.lock().await = Some(stdin);
                    if !self
                        .instance
                        .transition_from(PluginState::Restarting, PluginState::Running)
                    {
                        live.shutdown(Some(&self.stdin)).await;
                        return None;
                    }
                    info!(
                        plugin_id = %self.instance.id(),
                        version = %self.instance.version(),
                        attempt,
                        max_restarts,
                        pid = ?live.pid(),
                        "Restarted crashed plugin"
                    );
                    return Some(live);
                },
                Err(e) => {
                    error!(
                        plugin_id = %self.instance.id(),
                        attempt,
                        error = %e,
                        "Restart attempt failed"
                    );
                    if !self
                        .instance
                        .transition_from(PluginState::Restarting, PluginState::Crashed)
                    {
                        return None;
                    }
                },
            }
        }
    }
}

/// Decode responses from the plugin's stdout until EOF, a decode error, or
/// cancellation.
async fn read_loop(
    instance: Arc<PluginInstance>,
    stdout: ChildStdout,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) if line.trim().is_empty() => {},
            Ok(Some(line)) => match ipc::decode_response(instance.id(), &line) {
                Ok(response) => {
                    let message = InboundMessage {
                        instance: Arc::clone(&instance),
                        response,
                    };
                    if inbound.send(message).is_err() {
                        debug!(plugin_id = %instance.id(), "Inbound channel closed");
                        return;
                    }
                },
                Err(e) => {
                    if instance.is_running() {
                        warn!(
                            plugin_id = %instance.id(),
                            error = %e,
                            "Malformed message from plugin; closing reader"
                        );
                    }
                    return;
                },
            },
            Ok(None) => {
                debug!(plugin_id = %instance.id(), "Plugin closed stdout");
                return;
            },
            Err(e) => {
                if instance.is_running() {
                    warn!(plugin_id = %instance.id(), error = %e, "Failed to read from plugin");
                }
                return;
            },
        }
    }
}
