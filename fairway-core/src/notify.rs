//! Change notification
//!
//! The document store announces every committed record change here.
//! Delivery is fire-and-forget: a slow or missing subscriber never holds
//! up a mutation, and lagging subscribers lose the oldest events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::aggregate::ChangeKind;

/// One record changed in one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub record_id: String,
    pub kind: ChangeKind,
}

/// Broadcast channel for committed changes.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn notify(&self, event: ChangeEvent) {
        tracing::trace!(
            "Change {:?} {}/{}",
            event.kind,
            event.collection,
            event.record_id
        );
        let _ = self.tx.send(event);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}
