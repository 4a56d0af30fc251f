//! Process-based plugin runtime for the Parley chat-bot orchestrator.
//!
//! Plugins are ordinary programs that speak newline-delimited JSON over
//! their stdio. This crate installs, supervises and talks to them:
//!
//! - [`PluginManifest`]: a plugin's identity, entry command, permissions,
//!   subscribed events and intents (`plugin.json`)
//! - [`PluginRegistry`]: installed versions per plugin, latest last
//! - [`ProcessSupervisor`]: spawns plugins and restarts crashed ones within
//!   a bounded budget
//! - [`Dispatcher`]: fans host events out to subscribers and handles the
//!   actions plugins send back
//! - [`IntentRouter`] / [`SkillBridge`]: free-text intent routing and
//!   cross-plugin skill calls
//! - [`PermissionGate`]: manifest and host whitelist checks on actions
//! - [`HotUpdateController`]: health-checked blue/green version swaps
//! - [`PluginHost`]: all of the above wired together
//!
//! # Wire Protocol
//!
//! Host to plugin, one line per event:
//!
//! ```json
//! {"id":"8c1e...","type":"event","name":"on_message","payload":{"text":"hi"}}
//! ```
//!
//! Plugin to host, one line per handled event:
//!
//! ```json
//! {"id":"8c1e...","ok":true,"actions":[{"type":"send_message","targetId":"42","text":"hello"}]}
//! ```
//!
//! # Installed Layout
//!
//! Each version lives in its own directory, `<plugin_root>/<id>/<version>/`,
//! so an old and a new version never share files during a hot update.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod hot_update;
pub mod instance;
pub mod ipc;
pub mod manifest;
pub mod package;
pub mod pending;
pub mod permission;
pub mod plugin;
pub mod registry;
pub mod router;
pub mod signature;
pub mod supervisor;

pub use bridge::{SkillBridge, SkillCall};
pub use config::{IpcConfig, PermissionConfig, RuntimeConfig, SupervisorConfig};
pub use discovery::{DiscoveredPlugin, discover_installed};
pub use dispatcher::{ActionSink, DispatchSummary, Dispatcher, LoggingSink};
pub use error::{PluginError, PluginResult};
pub use host::PluginHost;
pub use hot_update::HotUpdateController;
pub use instance::{InstanceInfo, PluginInstance};
pub use ipc::{Action, ActionKind, PluginEvent, PluginResponse};
pub use manifest::{Intent, PluginManifest, RunOn};
pub use pending::PendingRequests;
pub use permission::PermissionGate;
pub use plugin::{PluginId, PluginState};
pub use registry::PluginRegistry;
pub use router::{IntentMatch, IntentRouter};
pub use signature::{Ed25519Verifier, ManifestVerifier, UnenforcedVerifier};
pub use supervisor::{InboundMessage, ProcessSupervisor};
