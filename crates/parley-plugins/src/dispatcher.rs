//! Event fan-out and action handling.
//!
//! Outbound, [`Dispatcher::dispatch_event`] writes a host event to every
//! running subscriber and synthesizes intent events for text payloads.
//! Inbound, [`Dispatcher::handle_response`] completes pending requests and
//! handles each action a plugin asks for: skill calls go to the bridge,
//! replies complete their waiting caller, and everything else passes the
//! permission gate before reaching the host's [`ActionSink`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bridge::{self, SkillBridge, SkillCall};
use crate::error::{PluginError, PluginResult};
use crate::instance::PluginInstance;
use crate::ipc::{
    Action, ActionKind, CALL_SKILL_EVENT, HEALTH_CHECK_EVENT, INTENT_EVENT_PREFIX, PluginEvent,
    SKILL_RESULT_EVENT,
};
use crate::pending::PendingRequests;
use crate::permission::PermissionGate;
use crate::registry::PluginRegistry;
use crate::router::IntentRouter;
use crate::supervisor::{InboundMessage, ProcessSupervisor};

/// Receives every permitted action that is not handled by the runtime
/// itself (chat messages, storage operations, webhooks...).
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// Deliver `action`, requested by `source`.
    async fn deliver(&self, source: &PluginInstance, action: &Action);
}

/// Sink that only logs what it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl ActionSink for LoggingSink {
    async fn deliver(&self, source: &PluginInstance, action: &Action) {
        info!(
            plugin_id = %source.id(),
            action = %action.kind,
            target = ?action.target,
            target_id = ?action.target_id,
            "Plugin action"
        );
    }
}

/// Outcome of one [`Dispatcher::dispatch_event`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Subscribers the event was written to.
    pub delivered: usize,
    /// Subscribers whose write failed.
    pub failed: usize,
    /// Intent events synthesized and delivered.
    pub intents: usize,
}

/// Routes events to plugins and actions out of them.
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    supervisor: ProcessSupervisor,
    router: IntentRouter,
    gate: PermissionGate,
    bridge: SkillBridge,
    pending: PendingRequests,
    sink: Arc<dyn ActionSink>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("gate", &self.gate)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Events the runtime produces itself. Their text never triggers intents.
fn is_runtime_event(name: &str) -> bool {
    name.starts_with(INTENT_EVENT_PREFIX)
        || name == CALL_SKILL_EVENT
        || name == SKILL_RESULT_EVENT
        || name == HEALTH_CHECK_EVENT
}

/// Whether a reply answers a skill call rather than a chat message: an
/// explicit `payload.correlation_id`, or a `skill_response`. A late one is
/// discarded; any other reply is forwarded like a regular action.
fn is_skill_reply(action: &Action) -> bool {
    action.kind() == ActionKind::SkillResponse
        || action.payload.get("correlation_id").is_some()
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        supervisor: ProcessSupervisor,
        gate: PermissionGate,
        bridge: SkillBridge,
        pending: PendingRequests,
        sink: Arc<dyn ActionSink>,
    ) -> Self {
        Self {
            router: IntentRouter::new(Arc::clone(&registry)),
            registry,
            supervisor,
            gate,
            bridge,
            pending,
            sink,
        }
    }

    /// Deliver `event` to every running instance subscribed to its name (or
    /// to `*`). If the payload carries a `text` string, also deliver an
    /// `intent_<name>` event to every running plugin with a matching
    /// intent. A failed write is logged and does not stop delivery to the
    /// others.
    pub async fn dispatch_event(&self, event: &PluginEvent) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        let subscribers = self
            .registry
            .running()
            .into_iter()
            .filter(|i| i.manifest().subscribes_to(&event.name));
        for instance in subscribers {
            match self.supervisor.send(&instance, event).await {
                Ok(()) => summary.delivered = summary.delivered.saturating_add(1),
                Err(e) => {
                    summary.failed = summary.failed.saturating_add(1);
                    warn!(
                        plugin_id = %instance.id(),
                        event = %event.name,
                        error = %e,
                        "Failed to deliver event"
                    );
                },
            }
        }

        if let Some(text) = event.text()
            && !is_runtime_event(&event.name)
        {
            for matched in self.router.match_intent(text) {
                let intent_event = matched.to_event(text, &event.id);
                let result = self
                    .dispatch_to_plugin(
                        matched.instance.id().as_str(),
                        Some(matched.instance.version()),
                        &intent_event,
                    )
                    .await;
                match result {
                    Ok(()) => summary.intents = summary.intents.saturating_add(1),
                    Err(e) => {
                        summary.failed = summary.failed.saturating_add(1);
                        warn!(
                            plugin_id = %matched.instance.id(),
                            intent = %matched.intent,
                            error = %e,
                            "Failed to deliver intent event"
                        );
                    },
                }
            }
        }

        debug!(
            event = %event.name,
            event_id = %event.id,
            delivered = summary.delivered,
            intents = summary.intents,
            failed = summary.failed,
            "Dispatched event"
        );
        summary
    }

    /// Deliver `event` to exactly one instance. `None` as version selects
    /// the latest.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if no such instance is registered,
    /// and any error from writing to it.
    pub async fn dispatch_to_plugin(
        &self,
        id: &str,
        version: Option<&str>,
        event: &PluginEvent,
    ) -> PluginResult<()> {
        let instance = self
            .registry
            .get(id, version)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        self.supervisor.send(&instance, event).await
    }

    /// Handle one response from a plugin: complete the request waiting on
    /// it, or act on each of its actions in order.
    pub async fn handle_response(&self, message: InboundMessage) {
        let InboundMessage { instance, response } = message;
        let Some(response) = self.pending.complete_response(response) else {
            return;
        };
        if !response.ok {
            debug!(
                plugin_id = %instance.id(),
                event_id = %response.id,
                "Plugin reported failure"
            );
        }
        for action in response.actions {
            self.handle_action(&instance, action).await;
        }
    }

    async fn handle_action(&self, instance: &Arc<PluginInstance>, action: Action) {
        match action.kind() {
            ActionKind::CallSkill => self.start_skill_call(instance, &action),
            ActionKind::Reply | ActionKind::SkillResponse => {
                if let Some(id) = action.correlation_id()
                    && self.pending.complete_reply(id, bridge::reply_value(&action))
                {
                    return;
                }
                if is_skill_reply(&action) {
                    debug!(
                        plugin_id = %instance.id(),
                        correlation_id = ?action.correlation_id(),
                        "Discarding reply with no waiting caller"
                    );
                    return;
                }
                self.forward(instance, &action).await;
            },
            ActionKind::SendMessage
            | ActionKind::StorageGet
            | ActionKind::StorageSet
            | ActionKind::StorageDelete
            | ActionKind::Other(_) => self.forward(instance, &action).await,
        }
    }

    async fn forward(&self, instance: &Arc<PluginInstance>, action: &Action) {
        if self.gate.is_action_allowed(instance.manifest(), &action.kind) {
            self.sink.deliver(instance, action).await;
        }
    }

    /// Run a skill call on its own task so the caller's responses keep
    /// flowing, then report the outcome back to the caller.
    fn start_skill_call(&self, caller: &Arc<PluginInstance>, action: &Action) {
        let call = match SkillCall::from_action(caller.id(), action) {
            Ok(call) => call,
            Err(e) => {
                warn!(plugin_id = %caller.id(), error = %e, "Ignoring malformed call_skill action");
                return;
            },
        };

        let bridge = self.bridge.clone();
        let supervisor = self.supervisor.clone();
        let caller = Arc::clone(caller);
        tokio::spawn(async move {
            let outcome = bridge.call(&call).await;
            if let Err(e) = &outcome {
                debug!(caller = %call.caller, error = %e, "Skill call failed");
            }
            let event = call.result_event(&outcome);
            if let Err(e) = supervisor.send(&caller, &event).await {
                warn!(plugin_id = %caller.id(), error = %e, "Failed to deliver skill result");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::{PermissionConfig, SupervisorConfig};
    use crate::ipc::PluginResponse;
    use crate::manifest::PluginManifest;

    #[derive(Default)]
    struct RecordingSink {
        actions: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ActionSink for RecordingSink {
        async fn deliver(&self, source: &PluginInstance, action: &Action) {
            self.actions
                .lock()
                .unwrap()
                .push((source.id().to_string(), action.kind.clone()));
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        pending: PendingRequests,
        sink: Arc<RecordingSink>,
        instance: Arc<PluginInstance>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(PluginRegistry::new());
        let json = json!({
            "id": "chat",
            "name": "Chat",
            "entry": "run",
            "permissions": ["send_message", "storage_set", "reply"],
            "run_on": ["worker"],
        });
        let manifest =
            PluginManifest::from_slice(json.to_string().as_bytes(), Path::new("plugin.json"))
                .unwrap();
        let instance = registry
            .register(PluginInstance::new(manifest, "/tmp"))
            .unwrap();

        let (supervisor, _rx) = ProcessSupervisor::new(SupervisorConfig::default());
        let pending = PendingRequests::new();
        let bridge = SkillBridge::new(
            Arc::clone(&registry),
            supervisor.clone(),
            pending.clone(),
            Duration::from_secs(1),
        );
        let sink = Arc::new(RecordingSink::default());
        let gate = PermissionGate::new(&PermissionConfig {
            center: vec!["send_message".into(), "storage_set".into()],
            worker: vec!["send_message".into(), "reply".into()],
        });
        let dispatcher = Dispatcher::new(
            registry,
            supervisor,
            gate,
            bridge,
            pending.clone(),
            Arc::clone(&sink) as Arc<dyn ActionSink>,
        );
        Fixture {
            dispatcher,
            pending,
            sink,
            instance,
        }
    }

    fn message(instance: &Arc<PluginInstance>, id: &str, actions: Vec<Action>) -> InboundMessage {
        InboundMessage {
            instance: Arc::clone(instance),
            response: PluginResponse {
                id: id.into(),
                ok: true,
                actions,
            },
        }
    }

    fn action(kind: &str) -> Action {
        Action {
            kind: kind.into(),
            ..Action::default()
        }
    }

    #[tokio::test]
    async fn test_permitted_actions_reach_sink() {
        let f = fixture();
        let actions = vec![action("send_message"), action("storage_set"), action("rm_rf")];
        f.dispatcher
            .handle_response(message(&f.instance, "e1", actions))
            .await;

        let delivered = f.sink.actions.lock().unwrap().clone();
        assert_eq!(delivered, vec![("chat".to_string(), "send_message".to_string())]);
    }

    #[tokio::test]
    async fn test_reply_completes_pending_call() {
        let f = fixture();
        let waiter = f.pending.expect_reply("corr-9");
        let mut reply = action("reply");
        reply.payload = json!({"correlation_id": "corr-9", "result": "sunny"});

        f.dispatcher
            .handle_response(message(&f.instance, "e2", vec![reply.clone()]))
            .await;
        assert_eq!(
            waiter.wait(Duration::from_secs(1)).await.unwrap(),
            json!("sunny")
        );

        // A second, late reply is discarded and never reaches the sink.
        f.dispatcher
            .handle_response(message(&f.instance, "e3", vec![reply]))
            .await;
        assert!(f.sink.actions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chat_reply_reaches_sink() {
        let f = fixture();
        let mut reply = action("reply");
        reply.text = Some("hi user".into());
        let mut answer = action("reply");
        answer.target_id = Some("chat-42".into());
        answer.text = Some("sunny today".into());

        f.dispatcher
            .handle_response(message(&f.instance, "e4", vec![reply, answer]))
            .await;

        let delivered = f.sink.actions.lock().unwrap().clone();
        assert_eq!(
            delivered,
            vec![
                ("chat".to_string(), "reply".to_string()),
                ("chat".to_string(), "reply".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_stray_skill_response_is_discarded() {
        let f = fixture();
        let mut stray = action("skill_response");
        stray.target_id = Some("nobody-waits".into());
        f.dispatcher
            .handle_response(message(&f.instance, "e5", vec![stray]))
            .await;
        assert!(f.sink.actions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_awaited_response_is_consumed() {
        let f = fixture();
        let waiter = f.pending.expect_response("health-1");
        f.dispatcher
            .handle_response(message(&f.instance, "health-1", vec![action("send_message")]))
            .await;

        assert!(waiter.wait(Duration::from_secs(1)).await.unwrap().ok);
        assert!(f.sink.actions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_without_running_plugins() {
        let f = fixture();
        let event = PluginEvent::new("on_message", json!({"text": "hi"}));
        let summary = f.dispatcher.dispatch_event(&event).await;
        assert_eq!(summary, DispatchSummary::default());

        assert!(matches!(
            f.dispatcher.dispatch_to_plugin("nope", None, &event).await,
            Err(PluginError::NotFound(_))
        ));
        assert!(matches!(
            f.dispatcher.dispatch_to_plugin("chat", None, &event).await,
            Err(PluginError::NotRunning(_))
        ));
    }

    #[test]
    fn test_runtime_events_do_not_trigger_intents() {
        assert!(is_runtime_event("intent_weather_query"));
        assert!(is_runtime_event("call_skill"));
        assert!(is_runtime_event("skill_result"));
        assert!(is_runtime_event("health-check"));
        assert!(!is_runtime_event("on_message"));
    }
}
