//! Newline-delimited JSON protocol spoken over a plugin's stdio.
//!
//! The host writes one [`PluginEvent`] per line to the plugin's stdin. The
//! plugin writes one [`PluginResponse`] per line to stdout. Each response
//! carries the `id` of the event it answers and a list of [`Action`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// Event name sent to a target plugin for a cross-plugin skill call.
pub const CALL_SKILL_EVENT: &str = "call_skill";
/// Event name sent to the caller with the outcome of its skill call.
pub const SKILL_RESULT_EVENT: &str = "skill_result";
/// Event name used to probe a freshly started version.
pub const HEALTH_CHECK_EVENT: &str = "health-check";
/// Prefix of events produced by intent routing.
pub const INTENT_EVENT_PREFIX: &str = "intent_";

/// Host to plugin message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    /// Unique event id; responses echo it.
    pub id: String,
    /// Always `"event"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event name (e.g. `on_message`, `intent_weather_query`).
    pub name: String,
    /// Arbitrary event payload.
    #[serde(default)]
    pub payload: Value,
}

impl PluginEvent {
    /// Create an event with a fresh random id.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name, payload)
    }

    /// Create an event with a caller-chosen id.
    #[must_use]
    pub fn with_id(id: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: "event".to_string(),
            name: name.into(),
            payload,
        }
    }

    /// The `text` field of the payload, if it is a string.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }
}

/// Plugin to host message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Id of the event this answers.
    pub id: String,
    /// Whether the plugin handled the event successfully.
    #[serde(default)]
    pub ok: bool,
    /// Actions requested by the plugin.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

/// An action requested by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action type (e.g. `send_message`, `call_skill`, `reply`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Target plugin or channel, depending on the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Target identifier (chat id, correlation id for replies).
    #[serde(
        default,
        rename = "targetId",
        alias = "target_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_id: Option<String>,
    /// Message text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Action-specific payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// Well-known action types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// Invoke a skill on another plugin.
    CallSkill,
    /// Answer a pending skill call, or reply in chat.
    Reply,
    /// Alias of [`ActionKind::Reply`].
    SkillResponse,
    /// Send a chat message.
    SendMessage,
    /// Read from plugin storage.
    StorageGet,
    /// Write to plugin storage.
    StorageSet,
    /// Delete from plugin storage.
    StorageDelete,
    /// Any other action; forwarded to the action sink.
    Other(String),
}

impl Action {
    /// Classify the action type.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self.kind.as_str() {
            "call_skill" => ActionKind::CallSkill,
            "reply" => ActionKind::Reply,
            "skill_response" => ActionKind::SkillResponse,
            "send_message" => ActionKind::SendMessage,
            "storage_get" => ActionKind::StorageGet,
            "storage_set" => ActionKind::StorageSet,
            "storage_delete" => ActionKind::StorageDelete,
            other => ActionKind::Other(other.to_string()),
        }
    }

    /// Correlation id a reply answers: `payload.correlation_id`, falling
    /// back to `targetId`.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.payload
            .get("correlation_id")
            .and_then(Value::as_str)
            .or(self.target_id.as_deref())
    }
}

/// Serialize an event as one protocol line, including the trailing newline.
///
/// # Errors
///
/// Returns [`PluginError::IpcWrite`] if the event cannot be serialized.
pub fn encode_event(plugin_id: &PluginId, event: &PluginEvent) -> PluginResult<Vec<u8>> {
    let mut line = serde_json::to_vec(event).map_err(|e| PluginError::IpcWrite {
        plugin_id: plugin_id.clone(),
        message: e.to_string(),
    })?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one protocol line written by a plugin.
///
/// # Errors
///
/// Returns [`PluginError::IpcDecode`] if the line is not a valid response.
pub fn decode_response(plugin_id: &PluginId, line: &str) -> PluginResult<PluginResponse> {
    serde_json::from_str(line.trim()).map_err(|e| PluginError::IpcDecode {
        plugin_id: plugin_id.clone(),
        message: e.to_string(),
    })
}
