//! The datastore event bus
//!
//! Subscribers receive events after the underlying transaction commits;
//! an event is never observable for state that could still roll back.
//! Delivery is synchronous on the posting thread, in subscription order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use url::Url;

use crate::revision::DocumentRevision;

/// Handle for removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Events posted by a datastore.
#[derive(Debug, Clone)]
pub enum DatastoreEvent {
    /// A revision was written. `winner` is the document's winning revision
    /// after the write (often the same revision). `source` is set when the
    /// write arrived through replication.
    DocumentUpdated {
        rev: DocumentRevision,
        winner: DocumentRevision,
        source: Option<Url>,
    },
    /// A bulk delete tombstoned these leaves.
    DocumentsDeleted { deleted_revs: Vec<DocumentRevision> },
    /// The datastore is closing; drop references and stop work against it.
    DatabaseClosing { name: String },
}

type Subscriber = Arc<dyn Fn(&DatastoreEvent) + Send + Sync>;

/// A subscriber list; explicitly shared between the manager, datastores
/// and replicators.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subscriber` and returns its removal handle.
    pub fn subscribe(
        &self,
        subscriber: impl Fn(&DatastoreEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, Arc::new(subscriber)));
        SubscriptionId(id)
    }

    /// Removes a subscription. Unknown handles are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(sid, _)| *sid != id.0);
    }

    /// Delivers `event` to every subscriber.
    pub fn post(&self, event: &DatastoreEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for subscriber in subscribers {
            subscriber(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}
