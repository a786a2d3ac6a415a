//! satchel - an embeddable JSON document store that syncs
//!
//! Satchel holds heterogeneous JSON documents, tracks their full revision
//! history as a tree (MVCC), stores binary attachments content-addressed by
//! SHA-1, and synchronizes with a remote CouchDB-compatible database via an
//! incremental pull protocol.
//!
//! # Architecture
//!
//! - [`revision`] - revision identity and document revision types
//! - [`blobstore`] - content-addressed attachment blob store
//! - [`storage`] - durable revision-tree engine over SQLite
//! - [`datastore`] - public CRUD facade and change notifications
//! - [`replication`] - change tracker, multipart reader, pull replicator

pub mod blobstore;
pub mod datastore;
pub mod replication;
pub mod revision;
pub mod storage;

pub use datastore::{Datastore, DatastoreManager};
pub use revision::{DocumentRevision, RevisionId};
