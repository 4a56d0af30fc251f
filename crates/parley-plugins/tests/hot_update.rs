//! Blue/green hot updates against real plugin processes.

#![cfg(unix)]

mod common;

use common::{
    HEALTHY, SILENT, build_package, host, manifest_json, test_config, write_plugin,
};
use parley_plugins::{PluginError, PluginState};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_healthy_version_replaces_running_one() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(tmp.path(), "weather", "1.0.0", json!({}), HEALTHY);
    let (host, _sink) = host(test_config(tmp.path()));

    let old = host.start("weather", None).await.unwrap();
    let old_pid = old.pid().unwrap();

    write_plugin(tmp.path(), "weather", "2.0.0", json!({}), HEALTHY);
    let new = host.hot_update("weather", "2.0.0").await.unwrap();

    assert_eq!(new.version(), "2.0.0");
    assert_eq!(new.state(), PluginState::Running);
    assert!(new.pid().is_some_and(|pid| pid != old_pid));

    assert_eq!(old.state(), PluginState::Stopped);
    assert!(old.pid().is_none());

    let registry = host.registry();
    let live = registry.running_instance("weather").unwrap();
    assert_eq!(live.version(), "2.0.0");
    assert!(registry.get("weather", Some("1.0.0")).is_none());
    assert_eq!(registry.latest("weather").unwrap().version(), "2.0.0");

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_version_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(tmp.path(), "weather", "1.0.0", json!({}), HEALTHY);
    let mut config = test_config(tmp.path());
    config.ipc.health_check_timeout_ms = 300;
    let (host, _sink) = host(config);

    let old = host.start("weather", None).await.unwrap();
    let old_pid = old.pid().unwrap();

    write_plugin(tmp.path(), "weather", "2.0.0", json!({}), SILENT);
    let err = host.hot_update("weather", "2.0.0").await.unwrap_err();
    assert!(matches!(err, PluginError::HealthCheckFailed { .. }), "{err}");

    assert_eq!(old.state(), PluginState::Running);
    assert_eq!(old.pid(), Some(old_pid));
    let registry = host.registry();
    assert_eq!(registry.running_instance("weather").unwrap().version(), "1.0.0");
    assert!(registry.get("weather", Some("2.0.0")).is_none());

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unhealthy_answer_is_rejected() {
    let unhealthy = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  printf '{"id":"%s","ok":false}\n' "$id"
done
"#;
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(tmp.path(), "weather", "1.0.0", json!({}), HEALTHY);
    let (host, _sink) = host(test_config(tmp.path()));
    let old = host.start("weather", None).await.unwrap();

    write_plugin(tmp.path(), "weather", "2.0.0", json!({}), unhealthy);
    let err = host.hot_update("weather", "2.0.0").await.unwrap_err();
    assert!(err.to_string().contains("unhealthy"), "{err}");
    assert_eq!(old.state(), PluginState::Running);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_version_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(tmp.path(), "weather", "1.0.0", json!({}), HEALTHY);
    let (host, _sink) = host(test_config(tmp.path()));
    host.start("weather", None).await.unwrap();

    let err = host.hot_update("weather", "1.0.0").await.unwrap_err();
    assert!(matches!(err, PluginError::AlreadyInstalled { .. }));

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_installing_package_over_running_version_hot_updates() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("plugins");
    write_plugin(&root, "weather", "1.0.0", json!({}), HEALTHY);
    let (host, _sink) = host(test_config(&root));
    let old = host.start("weather", None).await.unwrap();

    let package = build_package(
        &tmp.path().join("weather-2.zip"),
        &manifest_json("weather", "2.0.0"),
        HEALTHY,
    );
    let new = host.install_package(&package).await.unwrap();

    assert_eq!(new.version(), "2.0.0");
    assert_eq!(new.state(), PluginState::Running);
    assert_eq!(old.state(), PluginState::Stopped);
    assert!(root.join("weather/2.0.0/run.sh").is_file());

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_package_is_removed_from_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("plugins");
    write_plugin(&root, "weather", "1.0.0", json!({}), HEALTHY);
    let mut config = test_config(&root);
    config.ipc.health_check_timeout_ms = 300;
    let (host, _sink) = host(config);
    let old = host.start("weather", None).await.unwrap();

    let package = build_package(
        &tmp.path().join("weather-2.zip"),
        &manifest_json("weather", "2.0.0"),
        SILENT,
    );
    let err = host.install_package(&package).await.unwrap_err();
    assert!(matches!(err, PluginError::HealthCheckFailed { .. }));

    assert!(!root.join("weather/2.0.0").exists());
    assert_eq!(old.state(), PluginState::Running);

    host.shutdown().await;
}
