//! Cross-plugin skill calls.
//!
//! A plugin asks for another plugin's skill with a `call_skill` action. The
//! bridge sends the target a `call_skill` event whose id doubles as the
//! correlation id, then waits (bounded) for a `reply`/`skill_response`
//! action carrying that id. The outcome goes back to the caller as a
//! `skill_result` event.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::ipc::{Action, CALL_SKILL_EVENT, PluginEvent, SKILL_RESULT_EVENT};
use crate::pending::{PendingRequests, WaitError};
use crate::plugin::PluginId;
use crate::registry::PluginRegistry;
use crate::supervisor::ProcessSupervisor;

/// A skill call requested by one plugin of another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillCall {
    /// The calling plugin.
    pub caller: PluginId,
    /// The target plugin id.
    pub target: String,
    /// The requested skill.
    pub skill: String,
    /// Skill parameters.
    pub params: Value,
    /// The caller's own correlation id, echoed in the `skill_result` event.
    pub correlation_id: Option<String>,
}

impl SkillCall {
    /// Read a `call_skill` action. The target comes from `target` or
    /// `payload.target_plugin`; the skill from `payload.skill` or
    /// `payload.skill_name`; parameters from `payload.params` or
    /// `payload.payload`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SkillCallUnavailable`] if the action names no
    /// target or no skill.
    pub fn from_action(caller: &PluginId, action: &Action) -> PluginResult<Self> {
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|n| action.payload.get(*n).and_then(Value::as_str))
                .map(str::to_string)
        };

        let target = action
            .target
            .clone()
            .or_else(|| field(&["target_plugin", "target"]))
            .ok_or_else(|| PluginError::SkillCallUnavailable {
                target: String::new(),
                reason: "call_skill action names no target plugin".into(),
            })?;
        let skill = field(&["skill", "skill_name"]).ok_or_else(|| {
            PluginError::SkillCallUnavailable {
                target: target.clone(),
                reason: "call_skill action names no skill".into(),
            }
        })?;
        let params = ["params", "payload"]
            .iter()
            .find_map(|n| action.payload.get(*n))
            .cloned()
            .unwrap_or(Value::Null);

        Ok(Self {
            caller: caller.clone(),
            target,
            skill,
            params,
            correlation_id: field(&["correlation_id"]),
        })
    }

    /// The `skill_result` event reporting `outcome` back to the caller.
    #[must_use]
    pub fn result_event(&self, outcome: &PluginResult<Value>) -> PluginEvent {
        let mut payload = json!({
            "correlation_id": self.correlation_id,
            "target": self.target,
            "skill": self.skill,
            "ok": outcome.is_ok(),
        });
        match outcome {
            Ok(result) => payload["result"] = result.clone(),
            Err(e) => payload["error"] = Value::String(e.to_string()),
        }
        PluginEvent::new(SKILL_RESULT_EVENT, payload)
    }
}

/// Resolves skill call targets and correlates their replies.
#[derive(Debug, Clone)]
pub struct SkillBridge {
    registry: Arc<PluginRegistry>,
    supervisor: ProcessSupervisor,
    pending: PendingRequests,
    timeout: Duration,
}

impl SkillBridge {
    /// Create a bridge that waits `timeout` for each reply.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        supervisor: ProcessSupervisor,
        pending: PendingRequests,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor,
            pending,
            timeout,
        }
    }

    /// Reply timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform a skill call and wait for the target's reply.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SkillCallUnavailable`] at once, without sending
    /// anything, if the target is missing or not running (or the event
    /// cannot be written), and [`PluginError::SkillCallTimeout`] if no reply
    /// arrives within the timeout.
    pub async fn call(&self, call: &SkillCall) -> PluginResult<Value> {
        let Some(target) = self.registry.running_instance(&call.target) else {
            let reason = if self.registry.latest(&call.target).is_some() {
                "target plugin is not running"
            } else {
                "target plugin is not installed"
            };
            return Err(PluginError::SkillCallUnavailable {
                target: call.target.clone(),
                reason: reason.into(),
            });
        };

        let event_id = uuid::Uuid::new_v4().to_string();
        let pending = self.pending.expect_reply(event_id.clone());
        let event = PluginEvent::with_id(
            event_id.clone(),
            CALL_SKILL_EVENT,
            json!({
                "skill": call.skill,
                "params": call.params,
                "caller_id": call.caller,
                "correlation_id": event_id,
            }),
        );

        self.supervisor
            .send(&target, &event)
            .await
            .map_err(|e| PluginError::SkillCallUnavailable {
                target: call.target.clone(),
                reason: e.to_string(),
            })?;
        debug!(
            caller = %call.caller,
            target = %call.target,
            skill = %call.skill,
            correlation_id = %event_id,
            "Skill call sent"
        );

        match pending.wait(self.timeout).await {
            Ok(value) => Ok(value),
            Err(WaitError::TimedOut) => {
                warn!(
                    caller = %call.caller,
                    target = %call.target,
                    skill = %call.skill,
                    "Skill call timed out"
                );
                Err(PluginError::SkillCallTimeout {
                    target: call.target.clone(),
                    skill: call.skill.clone(),
                    timeout: self.timeout,
                })
            },
            Err(WaitError::Abandoned) => Err(PluginError::SkillCallUnavailable {
                target: call.target.clone(),
                reason: "reply channel closed".into(),
            }),
        }
    }
}

/// Value handed to a waiting skill caller for a reply action:
/// `payload.result` if present, else the action text, else the payload.
#[must_use]
pub fn reply_value(action: &Action) -> Value {
    if let Some(result) = action.payload.get("result") {
        return result.clone();
    }
    if let Some(text) = &action.text {
        return Value::String(text.clone());
    }
    action.payload.clone()
}
