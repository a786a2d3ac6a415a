//! Pull replication over the CouchDB protocol
//!
//! The pipeline: the change tracker polls the remote `_changes` feed; the
//! puller filters out revisions the store already holds, fetches the rest
//! in batches (`_bulk_get`, bulk `_all_docs`, or single multipart GETs),
//! inserts them with full ancestry via `force_insert`, and records durable
//! checkpoints keyed by a stable replicator identity.
//!
//! Ordering: revisions may arrive and insert out of order across
//! documents; each insert carries its whole history, so ancestry is always
//! respected, and checkpoints only advance over the contiguous prefix of
//! completed changes.

mod batcher;
mod changes;
mod checkpoint;
mod client;
mod config;
mod errors;
mod interceptor;
mod multipart;
mod pending;
mod puller;
mod wire;

pub use changes::{ChangeBatch, ChangeEntry, ChangeTracker};
pub use checkpoint::{replicator_id, RemoteCheckpoint};
pub use client::RemoteClient;
pub use config::{PullConfig, DEFAULT_CHANGES_LIMIT, DEFAULT_HEARTBEAT_MS, MIN_HEARTBEAT_MS};
pub use errors::{ReplicationError, ReplicationResult};
pub use interceptor::{
    BasicAuthInterceptor, HttpInterceptor, InterceptOutcome, RequestContext, ResponseContext,
};
pub use multipart::{associate_attachments, FinishedPart, MultipartReader, ParsedMultipart};
pub use pending::PendingSequences;
pub use puller::{
    PullReplicator, PullSummary, ReplicatorState, StopHandle, CHANGE_QUEUE_THRESHOLD,
    MAX_OPEN_CONNECTIONS,
};
