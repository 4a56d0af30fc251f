//! Line-oriented stdio surface of the daemon.
//!
//! Each stdin line is a host event (`{"name": ..., "payload": ...}`); each
//! permitted plugin action is written to stdout as one JSON line.

use async_trait::async_trait;
use parley_plugins::{Action, ActionSink, PluginEvent, PluginInstance};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Deserialize)]
struct HostEvent {
    name: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    id: Option<String>,
}

/// Parse one stdin line. Blank lines yield `Ok(None)`.
pub(crate) fn parse_event(line: &str) -> Result<Option<PluginEvent>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event: HostEvent = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if event.name.is_empty() {
        return Err("event name is empty".into());
    }
    Ok(Some(match event.id {
        Some(id) => PluginEvent::with_id(id, event.name, event.payload),
        None => PluginEvent::new(event.name, event.payload),
    }))
}

/// The stdout record for one forwarded action.
pub(crate) fn action_record(source: &PluginInstance, action: &Action) -> Value {
    json!({
        "plugin_id": source.id(),
        "version": source.version(),
        "action": action,
    })
}

/// Writes forwarded actions to stdout, one JSON object per line.
pub(crate) struct StdoutSink {
    out: Mutex<Stdout>,
}

impl StdoutSink {
    pub(crate) fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

#[async_trait]
impl ActionSink for StdoutSink {
    async fn deliver(&self, source: &PluginInstance, action: &Action) {
        let mut line = match serde_json::to_vec(&action_record(source, action)) {
            Ok(line) => line,
            Err(e) => {
                warn!(plugin_id = %source.id(), error = %e, "Cannot encode action");
                return;
            },
        };
        line.push(b'\n');

        let mut out = self.out.lock().await;
        let written = match out.write_all(&line).await {
            Ok(()) => out.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(plugin_id = %source.id(), error = %e, "Cannot write action to stdout");
        }
    }
}
