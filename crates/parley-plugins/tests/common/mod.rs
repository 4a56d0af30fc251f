//! Shared fixtures for the process-level tests.
//!
//! Test plugins are small `sh` scripts. Each one is installed at
//! `<root>/<id>/<version>/` next to a generated `plugin.json` whose entry
//! runs `sh run.sh` in that directory.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_plugins::{
    Action, ActionSink, IpcConfig, PluginHost, PluginInstance, RuntimeConfig, SupervisorConfig,
};
use serde_json::{Value, json};

/// Reads events and answers every one with `ok: true`.
pub const HEALTHY: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  printf '{"id":"%s","ok":true}\n' "$id"
done
"#;

/// Reads events and never answers.
pub const SILENT: &str = "exec cat > /dev/null\n";

/// Appends every event line to `events.jsonl` in the plugin directory.
pub const RECORDER: &str = "exec cat >> events.jsonl\n";

/// Exits immediately with a failure status.
pub const CRASHER: &str = "exit 1\n";

/// Install a script plugin and return its directory.
pub fn write_plugin(root: &Path, id: &str, version: &str, extra: Value, script: &str) -> PathBuf {
    let dir = root.join(id).join(version);
    std::fs::create_dir_all(&dir).unwrap();

    let mut manifest = manifest_json(id, version);
    if let (Some(base), Value::Object(extra)) = (manifest.as_object_mut(), extra) {
        base.extend(extra);
    }
    std::fs::write(
        dir.join("plugin.json"),
        serde_json::to_vec_pretty(&manifest).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.join("run.sh"), script).unwrap();
    dir
}

/// Build a zip package holding `plugin.json` and `run.sh`.
pub fn build_package(out: &Path, manifest: &Value, script: &str) -> PathBuf {
    let mut writer = zip::ZipWriter::new(std::fs::File::create(out).unwrap());
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
    writer.start_file("plugin.json", options).unwrap();
    writer
        .write_all(&serde_json::to_vec(manifest).unwrap())
        .unwrap();
    writer
        .start_file("run.sh", options.unix_permissions(0o755))
        .unwrap();
    writer.write_all(script.as_bytes()).unwrap();
    writer.finish().unwrap();
    out.to_path_buf()
}

/// Manifest JSON for a script plugin.
pub fn manifest_json(id: &str, version: &str) -> Value {
    json!({
        "id": id,
        "name": id,
        "version": version,
        "entry": "sh run.sh",
    })
}

/// Runtime settings tuned for fast tests.
pub fn test_config(plugin_root: &Path) -> RuntimeConfig {
    RuntimeConfig {
        plugin_root: plugin_root.to_path_buf(),
        supervisor: SupervisorConfig {
            poll_interval_ms: 20,
            min_restart_interval_ms: 100,
            default_max_restarts: 3,
        },
        ipc: IpcConfig {
            skill_call_timeout_ms: 2_000,
            health_check_timeout_ms: 2_000,
        },
        ..RuntimeConfig::default()
    }
}

/// A host over `plugin_root` with every installed plugin registered.
pub fn host(config: RuntimeConfig) -> (PluginHost, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let host = PluginHost::new(config, Arc::clone(&sink) as Arc<dyn ActionSink>).unwrap();
    host.load_installed();
    (host, sink)
}

/// Sink that keeps every delivered action.
#[derive(Default)]
pub struct RecordingSink {
    actions: Mutex<Vec<(String, Action)>>,
}

impl RecordingSink {
    /// `(plugin id, action)` pairs in delivery order.
    pub fn actions(&self) -> Vec<(String, Action)> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionSink for RecordingSink {
    async fn deliver(&self, source: &PluginInstance, action: &Action) {
        self.actions
            .lock()
            .unwrap()
            .push((source.id().to_string(), action.clone()));
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if condition() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Events recorded by a [`RECORDER`] plugin.
pub fn recorded_events(dir: &Path) -> Vec<Value> {
    std::fs::read_to_string(dir.join("events.jsonl"))
        .unwrap_or_default()
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}
