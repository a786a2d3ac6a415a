//! Public CRUD facade and change notifications
//!
//! The datastore is a thin coordination layer over the storage engine and
//! blob store: it validates incoming mutations, delegates each change to a
//! single engine transaction, and posts a notification on the event bus
//! after commit. It holds no autonomous state.
//!
//! The event bus is explicit: constructed by the caller (usually the
//! [`DatastoreManager`]) and passed in, never a process-wide singleton.

mod events;
mod facade;
mod manager;

pub use events::{DatastoreEvent, EventBus, SubscriptionId};
pub use facade::Datastore;
pub use manager::DatastoreManager;
