//! Intent routing.
//!
//! Free text from an event is matched against every running plugin's
//! declared intents. Each match becomes a synthesized `intent_<name>` event
//! for that plugin.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::instance::PluginInstance;
use crate::ipc::{INTENT_EVENT_PREFIX, PluginEvent};
use crate::registry::PluginRegistry;

/// One intent of one plugin that matched a piece of text.
#[derive(Debug, Clone)]
pub struct IntentMatch {
    /// The plugin whose intent matched.
    pub instance: Arc<PluginInstance>,
    /// The matched intent name.
    pub intent: String,
    /// The intent's routing priority.
    pub priority: i32,
}

impl IntentMatch {
    /// Name of the synthesized event (`intent_<name>`).
    #[must_use]
    pub fn event_name(&self) -> String {
        format!("{INTENT_EVENT_PREFIX}{}", self.intent)
    }

    /// Build the synthesized event carrying the matched text and a
    /// correlation id referencing the source event.
    #[must_use]
    pub fn to_event(&self, text: &str, source_event_id: &str) -> PluginEvent {
        PluginEvent::new(
            self.event_name(),
            json!({
                "text": text,
                "intent": self.intent,
                "correlation_id": source_event_id,
            }),
        )
    }
}

/// Matches text against the intents of running plugins.
#[derive(Debug, Clone)]
pub struct IntentRouter {
    registry: Arc<PluginRegistry>,
}

impl IntentRouter {
    /// Create a router over `registry`.
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    /// Every (plugin, intent) pair among running plugins whose intent
    /// matches `text`, highest priority first. Ties keep registry order.
    #[must_use]
    pub fn match_intent(&self, text: &str) -> Vec<IntentMatch> {
        match_intents(&self.registry.running(), text)
    }
}

/// Match `text` against the intents of `instances`, highest priority first.
#[must_use]
pub fn match_intents(instances: &[Arc<PluginInstance>], text: &str) -> Vec<IntentMatch> {
    let mut matches: Vec<IntentMatch> = instances
        .iter()
        .flat_map(|instance| {
            instance
                .manifest()
                .intents
                .iter()
                .filter(|intent| intent.matches(text))
                .map(|intent| IntentMatch {
                    instance: Arc::clone(instance),
                    intent: intent.name.clone(),
                    priority: intent.priority,
                })
        })
        .collect();
    matches.sort_by(|a, b| b.priority.cmp(&a.priority));

    if !matches.is_empty() {
        debug!(count = matches.len(), "Intents matched");
    }
    matches
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::manifest::PluginManifest;

    fn instance(id: &str, intents: serde_json::Value) -> Arc<PluginInstance> {
        let json = json!({"id": id, "name": id, "entry": "run", "intents": intents});
        let manifest =
            PluginManifest::from_slice(json.to_string().as_bytes(), Path::new("plugin.json"))
                .unwrap();
        Arc::new(PluginInstance::new(manifest, "/tmp"))
    }

    #[test]
    fn test_matches_across_plugins_by_priority() {
        let weather = instance(
            "weather",
            json!([{"name": "weather_query", "keywords": ["weather"], "priority": 1}]),
        );
        let chat = instance(
            "chat",
            json!([
                {"name": "smalltalk", "regex": "(?i)^what"},
                {"name": "jokes", "keywords": ["joke"]}
            ]),
        );

        let matches = match_intents(&[chat, weather], "What's the weather?");
        let names: Vec<&str> = matches.iter().map(|m| m.intent.as_str()).collect();
        assert_eq!(names, vec!["weather_query", "smalltalk"]);
        assert_eq!(matches[0].instance.id().as_str(), "weather");
    }

    #[test]
    fn test_no_match() {
        let weather = instance("weather", json!([{"name": "w", "keywords": ["weather"]}]));
        assert!(match_intents(&[weather], "hello").is_empty());
    }

    #[test]
    fn test_synthesized_event() {
        let weather = instance("weather", json!([{"name": "weather_query", "keywords": ["weather"]}]));
        let m = &match_intents(&[weather], "the weather")[0];
        let event = m.to_event("the weather", "evt-1");

        assert_eq!(event.name, "intent_weather_query");
        assert_eq!(event.payload["text"], "the weather");
        assert_eq!(event.payload["intent"], "weather_query");
        assert_eq!(event.payload["correlation_id"], "evt-1");
        assert_ne!(event.id, "evt-1");
    }

    #[test]
    fn test_router_ignores_stopped_plugins() {
        let registry = Arc::new(PluginRegistry::new());
        let json = json!({"id": "weather", "name": "W", "entry": "run",
            "intents": [{"name": "w", "keywords": ["weather"]}]});
        let manifest =
            PluginManifest::from_slice(json.to_string().as_bytes(), Path::new("plugin.json"))
                .unwrap();
        registry
            .register(PluginInstance::new(manifest, "/tmp"))
            .unwrap();

        let router = IntentRouter::new(registry);
        assert!(router.match_intent("weather").is_empty());
    }
}
