//! Realtime fan-out of patches and conflict outcomes.
//!
//! [`SyncHub`] keeps one `broadcast` channel per tree instance. Publishing
//! never waits on subscribers: each subscriber has a bounded queue and a
//! subscriber that falls behind loses the oldest messages and is told to
//! resync ([`SyncEvent::ResyncRequired`]). Order is preserved per subscriber.

mod conflict;

pub use conflict::{
    arbitrate, AppliedEntry, ConflictOutcome, ConflictResolution, ConflictStrategy, ConflictWindow, ManualScope,
    Resolution, Verdict,
};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::delta::TreeDelta;
use crate::model::PageDefinition;
use crate::optimistic::ExecutionId;

/// An applied change, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub tree_instance_id: String,
    /// Tree version after the change. Always the previous version + 1.
    pub version: u64,
    /// Version the action was submitted against.
    pub base_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    /// Submitting client, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub affected_section_ids: Vec<String>,
    pub delta: TreeDelta,
    /// The full tree at `version`.
    pub tree: Arc<PageDefinition>,
}

#[cfg(test)]
impl Patch {
    pub(crate) fn for_test(instance: &str, tree: Arc<PageDefinition>, execution_id: Option<ExecutionId>) -> Patch {
        Patch {
            tree_instance_id: instance.to_string(),
            version: tree.version,
            base_version: tree.version.saturating_sub(1),
            execution_id,
            origin: None,
            affected_section_ids: Vec::new(),
            delta: TreeDelta::new(),
            tree,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SyncMessage {
    Patch(Arc<Patch>),
    Conflict(Arc<ConflictOutcome>),
}

/// What a subscriber observes.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Message(SyncMessage),
    /// `missed` messages were dropped; fetch a fresh snapshot.
    ResyncRequired { missed: u64 },
    /// The instance was closed or disconnected.
    Closed,
}

#[derive(Debug)]
pub struct SyncHub {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<SyncMessage>>>,
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SyncHub {
    /// `capacity` is the per-subscriber queue length.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, instance: &str) -> broadcast::Sender<SyncMessage> {
        if let Some(tx) = self.channels.read().unwrap_or_else(|e| e.into_inner()).get(instance) {
            return tx.clone();
        }
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(instance.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Fan `message` out to the current subscribers of `instance`. Returns
    /// how many received it.
    pub fn publish(&self, instance: &str, message: SyncMessage) -> usize {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        match channels.get(instance) {
            Some(tx) => {
                let delivered = tx.send(message).unwrap_or(0);
                trace!(tree_instance_id = instance, delivered, "published");
                delivered
            }
            None => 0,
        }
    }

    pub fn subscribe(&self, instance: &str) -> Subscription {
        Subscription {
            tree_instance_id: instance.to_string(),
            rx: self.sender(instance).subscribe(),
        }
    }

    /// Call `listener` for every event on `instance` from a spawned task,
    /// until [`Unsubscribe::unsubscribe`] or the instance closes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_listener<F>(&self, instance: &str, mut listener: F) -> Unsubscribe
    where
        F: FnMut(SyncEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(instance);
        let handle = tokio::spawn(async move {
            loop {
                let event = subscription.recv().await;
                let closed = event == SyncEvent::Closed;
                listener(event);
                if closed {
                    break;
                }
            }
        });
        Unsubscribe { handle }
    }

    pub fn subscriber_count(&self, instance: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Drop the channel for `instance`; subscribers see [`SyncEvent::Closed`]
    /// once they drain what was already queued.
    pub fn disconnect(&self, instance: &str) {
        if self
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance)
            .is_some()
        {
            debug!(tree_instance_id = instance, "instance channel closed");
        }
    }
}

/// A subscriber's receiving end.
#[derive(Debug)]
pub struct Subscription {
    tree_instance_id: String,
    rx: broadcast::Receiver<SyncMessage>,
}

impl Subscription {
    pub fn tree_instance_id(&self) -> &str {
        &self.tree_instance_id
    }

    pub async fn recv(&mut self) -> SyncEvent {
        match self.rx.recv().await {
            Ok(message) => SyncEvent::Message(message),
            Err(RecvError::Lagged(missed)) => {
                debug!(tree_instance_id = %self.tree_instance_id, missed, "subscriber lagged");
                SyncEvent::ResyncRequired { missed }
            }
            Err(RecvError::Closed) => SyncEvent::Closed,
        }
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        match self.rx.try_recv() {
            Ok(message) => Some(SyncEvent::Message(message)),
            Err(TryRecvError::Lagged(missed)) => Some(SyncEvent::ResyncRequired { missed }),
            Err(TryRecvError::Closed) => Some(SyncEvent::Closed),
            Err(TryRecvError::Empty) => None,
        }
    }

    pub fn unsubscribe(self) {}
}

/// Handle returned by [`SyncHub::subscribe_listener`].
#[derive(Debug)]
pub struct Unsubscribe {
    handle: JoinHandle<()>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}
