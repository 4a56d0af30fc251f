//! Cross-plugin skill calls through real plugin processes.

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use common::{SILENT, eventually, host, recorded_events, test_config, write_plugin};
use parley_plugins::{PluginError, PluginEvent, PluginId};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

/// Answers `call_skill` with a `reply` carrying a forecast.
const FORECASTER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"name":"call_skill"'*)
      printf '{"id":"%s","ok":true,"actions":[{"type":"reply","payload":{"correlation_id":"%s","result":{"city":"Paris","temp":21}}}]}\n' "$id" "$id" ;;
    *)
      printf '{"id":"%s","ok":true}\n' "$id" ;;
  esac
done
"#;

/// Records every event and asks `weather` for a forecast on each message.
const ASKER: &str = r#"while IFS= read -r line; do
  printf '%s\n' "$line" >> events.jsonl
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"name":"on_message"'*)
      printf '{"id":"%s","ok":true,"actions":[{"type":"call_skill","target":"weather","payload":{"skill":"forecast","params":{"city":"Paris"},"correlation_id":"ask-1"}}]}\n' "$id" ;;
    *)
      printf '{"id":"%s","ok":true}\n' "$id" ;;
  esac
done
"#;

fn caller() -> PluginId {
    PluginId::from_static("assistant")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_to_missing_plugin_fails_fast() {
    let tmp = tempfile::tempdir().unwrap();
    let (host, _sink) = host(test_config(tmp.path()));

    let started = Instant::now();
    let err = host
        .call_skill(&caller(), "ghost", "anything", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::SkillCallUnavailable { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_to_stopped_plugin_is_unavailable() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(tmp.path(), "weather", "1.0.0", json!({}), FORECASTER);
    let (host, _sink) = host(test_config(tmp.path()));

    let err = host
        .call_skill(&caller(), "weather", "forecast", json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not running"), "{err}");

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_times_out_when_target_is_silent() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(tmp.path(), "weather", "1.0.0", json!({}), SILENT);
    let mut config = test_config(tmp.path());
    config.ipc.skill_call_timeout_ms = 300;
    let (host, _sink) = host(config);
    host.start_all().await;

    let started = Instant::now();
    let err = host
        .call_skill(&caller(), "weather", "forecast", json!({ "city": "Paris" }))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::SkillCallTimeout { .. }));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(270), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_300), "waited too long: {elapsed:?}");

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_call_returns_reply_result() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(tmp.path(), "weather", "1.0.0", json!({}), FORECASTER);
    let (host, _sink) = host(test_config(tmp.path()));
    host.start_all().await;

    let result = host
        .call_skill(&caller(), "weather", "forecast", json!({ "city": "Paris" }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "city": "Paris", "temp": 21 }));

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_initiated_call_reports_skill_result() {
    let tmp = tempfile::tempdir().unwrap();
    write_plugin(tmp.path(), "weather", "1.0.0", json!({}), FORECASTER);
    let asker = write_plugin(
        tmp.path(),
        "assistant",
        "1.0.0",
        json!({ "events": ["on_message"] }),
        ASKER,
    );
    let (host, _sink) = host(test_config(tmp.path()));
    assert_eq!(host.start_all().await, 2);

    host.dispatch_event(&PluginEvent::new("on_message", json!({ "text": "forecast please" })))
        .await;

    let has_result = || {
        recorded_events(&asker)
            .iter()
            .any(|e| e["name"] == "skill_result")
    };
    assert!(eventually(WAIT, has_result).await);

    let events = recorded_events(&asker);
    let result = events.iter().find(|e| e["name"] == "skill_result").unwrap();
    assert_eq!(result["payload"]["ok"], true);
    assert_eq!(result["payload"]["skill"], "forecast");
    assert_eq!(result["payload"]["target"], "weather");
    assert_eq!(result["payload"]["correlation_id"], "ask-1");
    assert_eq!(result["payload"]["result"]["temp"], 21);

    host.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_initiated_call_reports_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let asker = write_plugin(
        tmp.path(),
        "assistant",
        "1.0.0",
        json!({ "events": ["on_message"] }),
        ASKER,
    );
    let (host, _sink) = host(test_config(tmp.path()));
    host.start_all().await;

    host.dispatch_event(&PluginEvent::new("on_message", json!({ "text": "forecast please" })))
        .await;

    assert!(
        eventually(WAIT, || {
            recorded_events(&asker)
                .iter()
                .any(|e| e["name"] == "skill_result" && e["payload"]["ok"] == false)
        })
        .await
    );
    let events = recorded_events(&asker);
    let result = events.iter().find(|e| e["name"] == "skill_result").unwrap();
    assert!(result["payload"]["error"].as_str().unwrap().contains("weather"));

    host.shutdown().await;
}
