//! Table of in-flight requests awaiting an answer from a plugin.
//!
//! Two kinds of waiters share one table keyed by id: callers waiting for the
//! [`PluginResponse`] to a specific event (health checks), and skill callers
//! waiting for a `reply` action carrying their correlation id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::ipc::PluginResponse;

enum Slot {
    Response(oneshot::Sender<PluginResponse>),
    Reply(oneshot::Sender<Value>),
}

/// Shared pending-request table. Cheap to clone.
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.len())
            .finish()
    }
}

/// Why a pending wait ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The entry was dropped or replaced before an answer arrived.
    Abandoned,
}

/// A registered waiter. Dropping it removes the entry from the table.
pub struct Pending<T> {
    id: String,
    rx: oneshot::Receiver<T>,
    table: PendingRequests,
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the response to the event with id `event_id`.
    #[must_use]
    pub fn expect_response(&self, event_id: impl Into<String>) -> Pending<PluginResponse> {
        let (tx, rx) = oneshot::channel();
        let id = event_id.into();
        self.lock().insert(id.clone(), Slot::Response(tx));
        Pending {
            id,
            rx,
            table: self.clone(),
        }
    }

    /// Wait for a reply action carrying `correlation_id`.
    #[must_use]
    pub fn expect_reply(&self, correlation_id: impl Into<String>) -> Pending<Value> {
        let (tx, rx) = oneshot::channel();
        let id = correlation_id.into();
        self.lock().insert(id.clone(), Slot::Reply(tx));
        Pending {
            id,
            rx,
            table: self.clone(),
        }
    }

    /// Hand a response to its waiter. Returns the response back if nobody
    /// waits for it.
    pub fn complete_response(&self, response: PluginResponse) -> Option<PluginResponse> {
        let mut slots = self.lock();
        if !matches!(slots.get(&response.id), Some(Slot::Response(_))) {
            return Some(response);
        }
        let Some(Slot::Response(tx)) = slots.remove(&response.id) else {
            return Some(response);
        };
        drop(slots);
        tx.send(response).err()
    }

    /// Hand a reply payload to the skill caller waiting on `correlation_id`.
    /// Returns `false` if no such caller is waiting.
    pub fn complete_reply(&self, correlation_id: &str, payload: Value) -> bool {
        let mut slots = self.lock();
        if !matches!(slots.get(correlation_id), Some(Slot::Reply(_))) {
            return false;
        }
        let Some(Slot::Reply(tx)) = slots.remove(correlation_id) else {
            return false;
        };
        drop(slots);
        tx.send(payload).is_ok()
    }

    /// Number of in-flight waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no waiter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Pending<T> {
    /// The id this waiter is registered under.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait up to `timeout` for the answer.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] if nothing arrived in time and
    /// [`WaitError::Abandoned`] if the sender went away.
    pub async fn wait(mut self, timeout: Duration) -> Result<T, WaitError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(WaitError::Abandoned),
            Err(_) => Err(WaitError::TimedOut),
        }
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        self.rx.close();
        let mut slots = self.table.lock();
        // Only remove our own slot; an id may have been re-registered.
        let ours = match slots.get(&self.id) {
            Some(Slot::Response(tx)) => tx.is_closed(),
            Some(Slot::Reply(tx)) => tx.is_closed(),
            None => false,
        };
        if ours {
            slots.remove(&self.id);
        }
    }
}
