//! The pull replicator
//!
//! Orchestrates an incremental pull from a CouchDB-compatible remote:
//! change tracking, missing-revision filtering, batched retrieval, forced
//! insertion with full ancestry, and durable checkpointing.
//!
//! Control flow is one explicit loop keyed on in-flight request counts
//! and queue depths, never nested completion handlers:
//!
//! `Idle -> Starting -> Running -> (Draining -> Stopped) | (Error -> Stopped)`
//!
//! Routing per missing revision: prefer `_bulk_get` when the remote
//! supports it; else first-generation, non-deleted, non-conflicted
//! revisions ride a bulk `_all_docs`, and everything else is fetched
//! singly (multipart when attachments follow). Up to 12 requests are in
//! flight at once; the change feed is not polled while the downloads
//! queue is above the backpressure threshold.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::blobstore::BlobStore;
use crate::datastore::Datastore;
use crate::revision::RevisionId;
use crate::storage::{StorageEngine, StorageError};

use super::batcher::Batcher;
use super::changes::{ChangeEntry, ChangeTracker};
use super::checkpoint::{replicator_id, RemoteCheckpoint};
use super::client::RemoteClient;
use super::config::PullConfig;
use super::errors::{ReplicationError, ReplicationResult};
use super::multipart::{FinishedPart, MultipartReader};
use super::pending::PendingSequences;
use super::wire::forced_revision_from_wire;

/// Concurrent HTTP request ceiling.
pub const MAX_OPEN_CONNECTIONS: usize = 12;

/// Change-feed polling pauses while the downloads queue is deeper than
/// this.
pub const CHANGE_QUEUE_THRESHOLD: usize = 500;

/// Revisions per `_bulk_get` request.
const BULK_GET_BATCH: usize = 50;
/// Keys per bulk `_all_docs` request.
const ALL_DOCS_BATCH: usize = 50;
/// Inbox and downloads batcher capacity.
const BATCH_CAPACITY: usize = 200;
/// Inbox and downloads batcher flush delay.
const BATCH_DELAY: Duration = Duration::from_secs(1);
/// `atts_since` candidates sent per revision.
const POSSIBLE_ANCESTORS_LIMIT: usize = 20;
/// Requeues per revision before it is dropped for the run.
const MAX_FETCH_RETRIES: u32 = 3;

/// Replicator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Idle,
    Starting,
    Running,
    Draining,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    BulkGet,
    AllDocs,
    Single,
    Deleted,
}

/// A revision reported by the change feed and not yet in the store.
#[derive(Debug, Clone)]
struct PulledRevision {
    doc_id: String,
    rev_id: RevisionId,
    deleted: bool,
    fake_seq: u64,
    kind: QueueKind,
    retries: u32,
    atts_since: Vec<String>,
}

/// A fetched wire document waiting for insertion, ordered by its fake
/// local sequence.
#[derive(Debug)]
struct Downloaded {
    fake_seq: u64,
    document: Map<String, Value>,
    parts: Vec<FinishedPart>,
}

/// Outcome of one dispatched request.
struct FetchResult {
    downloaded: Vec<Downloaded>,
    requeue: Vec<PulledRevision>,
    failures: u64,
}

#[derive(Default)]
struct Queues {
    bulk: VecDeque<PulledRevision>,
    all_docs: VecDeque<PulledRevision>,
    single: VecDeque<PulledRevision>,
    deleted: VecDeque<PulledRevision>,
}

impl Queues {
    fn push(&mut self, rev: PulledRevision) {
        match rev.kind {
            QueueKind::BulkGet => self.bulk.push_back(rev),
            QueueKind::AllDocs => self.all_docs.push_back(rev),
            QueueKind::Single => self.single.push_back(rev),
            QueueKind::Deleted => self.deleted.push_back(rev),
        }
    }

    fn is_empty(&self) -> bool {
        self.bulk.is_empty()
            && self.all_docs.is_empty()
            && self.single.is_empty()
            && self.deleted.is_empty()
    }
}

/// Counters reported when a run finishes.
#[derive(Debug, Clone, Default)]
pub struct PullSummary {
    pub revisions_inserted: u64,
    pub failures: u64,
    pub last_checkpoint: Option<Value>,
}

/// Cancels a running replicator from another task.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// One-shot pull replication run against a remote database.
pub struct PullReplicator {
    datastore: Arc<Datastore>,
    config: PullConfig,
    client: Arc<RemoteClient>,
    stopping: Arc<AtomicBool>,
    state: parking_lot::Mutex<ReplicatorState>,
    error: parking_lot::Mutex<Option<String>>,
}

impl PullReplicator {
    pub fn new(datastore: Arc<Datastore>, config: PullConfig) -> ReplicationResult<Self> {
        let client = Arc::new(RemoteClient::new(&config)?);
        Ok(Self {
            datastore,
            config,
            client,
            stopping: Arc::new(AtomicBool::new(false)),
            state: parking_lot::Mutex::new(ReplicatorState::Idle),
            error: parking_lot::Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplicatorState {
        *self.state.lock()
    }

    /// The terminal error message, if the run failed.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Handle for requesting a stop; retries are cancelled, no new
    /// requests are issued, and a final checkpoint is attempted.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stopping.clone())
    }

    fn set_state(&self, state: ReplicatorState) {
        debug!(?state, "replicator state");
        *self.state.lock() = state;
    }

    /// Runs the pull to completion (caught up and drained), stop, or
    /// error.
    pub async fn run(&mut self) -> ReplicationResult<PullSummary> {
        self.set_state(ReplicatorState::Starting);
        let result = self.run_inner().await;
        match &result {
            Ok(summary) => {
                info!(
                    inserted = summary.revisions_inserted,
                    failures = summary.failures,
                    "pull replication finished"
                );
                self.set_state(ReplicatorState::Stopped);
            }
            Err(ReplicationError::Stopped) => self.set_state(ReplicatorState::Stopped),
            Err(err) => {
                *self.error.lock() = Some(err.to_string());
                self.set_state(ReplicatorState::Error);
            }
        }
        result
    }

    async fn run_inner(&self) -> ReplicationResult<PullSummary> {
        let engine = self.datastore.engine().clone();
        let source = self.config.source_without_credentials();

        // 1. Capability probe.
        let bulk_get = probe_bulk_get(&self.client).await;
        info!(bulk_get, source = %source, "starting pull");

        // 2. Checkpoint identity and resume point.
        let checkpoint_id = replicator_id(&self.config, engine.name());
        let since = engine
            .checkpoint(&checkpoint_id, false)?
            .and_then(|doc| doc.get("seq").cloned())
            .unwrap_or(Value::Null);
        let mut remote_cp = RemoteCheckpoint::new(self.client.clone(), checkpoint_id.clone());
        if let Err(err) = remote_cp.load().await {
            warn!(%err, "could not read remote checkpoint");
        }

        // 3. Change tracker, batchers, pending map, dispatch machinery.
        let mut tracker = ChangeTracker::new(
            self.client.clone(),
            &self.config,
            since,
            self.stopping.clone(),
        );
        let mut pending = PendingSequences::new();
        let mut inbox: Batcher<ChangeEntry> = Batcher::new(BATCH_CAPACITY, BATCH_DELAY);
        let mut downloads: Batcher<Downloaded> = Batcher::new(BATCH_CAPACITY, BATCH_DELAY);
        let mut queues = Queues::default();
        let mut in_flight: JoinSet<ReplicationResult<FetchResult>> = JoinSet::new();
        let mut changes_done = false;
        let mut last_saved: Option<Value> = None;
        let mut summary = PullSummary::default();
        let mut fatal: Option<ReplicationError> = None;

        self.set_state(ReplicatorState::Running);

        'main: loop {
            if self.stopping.load(Ordering::SeqCst) {
                break 'main;
            }
            let mut progressed = false;

            // Reap finished requests without blocking.
            while let Some(joined) = in_flight.try_join_next() {
                progressed = true;
                if let Err(err) = handle_fetch_outcome(
                    joined,
                    &mut downloads,
                    &mut queues,
                    &mut summary,
                ) {
                    fatal = Some(err);
                    break 'main;
                }
            }

            // Poll the feed, paused under backpressure.
            if !changes_done && downloads.len() <= CHANGE_QUEUE_THRESHOLD {
                match tracker.poll().await {
                    Ok(batch) => {
                        progressed = true;
                        if batch.caught_up {
                            debug!("change feed caught up");
                            changes_done = true;
                        }
                        inbox.extend(batch.entries);
                    }
                    Err(ReplicationError::Stopped) => break 'main,
                    Err(err) => {
                        fatal = Some(err);
                        break 'main;
                    }
                }
            }

            // Flush the inbox through find_missing and route the rest.
            let ready = if changes_done {
                let all = inbox.take_all();
                (!all.is_empty()).then_some(all)
            } else {
                inbox.take_ready()
            };
            if let Some(entries) = ready {
                progressed = true;
                if let Err(err) =
                    route_changes(&engine, entries, &mut pending, &mut queues, bulk_get)
                {
                    fatal = Some(err);
                    break 'main;
                }
            }

            // Dispatch while connections are available.
            while in_flight.len() < MAX_OPEN_CONNECTIONS {
                let Some((kind, batch)) = next_batch(&mut queues, &engine) else {
                    break;
                };
                progressed = true;
                let client = self.client.clone();
                let store = engine.blob_store().clone();
                match kind {
                    QueueKind::BulkGet => {
                        in_flight.spawn(fetch_bulk_get(client, batch));
                    }
                    QueueKind::AllDocs => {
                        in_flight.spawn(fetch_all_docs(client, batch));
                    }
                    QueueKind::Single | QueueKind::Deleted => {
                        if let Some(rev) = batch.into_iter().next() {
                            in_flight.spawn(fetch_single(client, store, rev));
                        }
                    }
                }
            }

            // Flush completed downloads into the store. Once everything
            // upstream is quiet, flush regardless of batch thresholds.
            let quiet = changes_done && inbox.is_empty() && queues.is_empty() && in_flight.is_empty();
            let batch = if quiet {
                let all = downloads.take_all();
                (!all.is_empty()).then_some(all)
            } else {
                downloads.take_ready()
            };
            if let Some(batch) = batch {
                progressed = true;
                if let Err(err) = self
                    .insert_downloads(batch, &source, &mut pending, &mut summary)
                    .await
                {
                    fatal = Some(err);
                    break 'main;
                }
                if let Err(err) = save_checkpoint_if_advanced(
                    &engine,
                    &mut remote_cp,
                    &checkpoint_id,
                    &pending,
                    &mut last_saved,
                )
                .await
                {
                    fatal = Some(err);
                    break 'main;
                }
            }

            if quiet && downloads.is_empty() {
                break 'main;
            }

            if !progressed {
                if !in_flight.is_empty() {
                    if let Some(joined) = in_flight.join_next().await {
                        if let Err(err) = handle_fetch_outcome(
                            joined,
                            &mut downloads,
                            &mut queues,
                            &mut summary,
                        ) {
                            fatal = Some(err);
                            break 'main;
                        }
                    }
                } else {
                    // Waiting out a batcher delay.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        // Draining: no new requests; in-flight work is cancelled on stop,
        // awaited otherwise; whatever completed is inserted; a final
        // checkpoint is attempted.
        self.set_state(ReplicatorState::Draining);
        if self.stopping.load(Ordering::SeqCst) || fatal.is_some() {
            in_flight.abort_all();
        }
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Err(join_err) if join_err.is_cancelled() => {}
                other => {
                    if let Err(err) =
                        handle_fetch_outcome(other, &mut downloads, &mut queues, &mut summary)
                    {
                        if fatal.is_none() {
                            fatal = Some(err);
                        }
                    }
                }
            }
        }
        if fatal.is_none() {
            let rest = downloads.take_all();
            if !rest.is_empty() {
                if let Err(err) = self
                    .insert_downloads(rest, &source, &mut pending, &mut summary)
                    .await
                {
                    fatal = Some(err);
                }
            }
        }
        if let Err(err) = save_checkpoint_if_advanced(
            &engine,
            &mut remote_cp,
            &checkpoint_id,
            &pending,
            &mut last_saved,
        )
        .await
        {
            warn!(%err, "final checkpoint failed");
        }
        summary.last_checkpoint = pending.checkpointed_value().cloned();

        match fatal {
            Some(err) => Err(err),
            None if self.stopping.load(Ordering::SeqCst) => Err(ReplicationError::Stopped),
            None => Ok(summary),
        }
    }

    /// Inserts a sorted download batch via `force_insert`. A `Forbidden`
    /// verdict skips the revision; any other storage failure is fatal.
    async fn insert_downloads(
        &self,
        mut batch: Vec<Downloaded>,
        source: &Url,
        pending: &mut PendingSequences,
        summary: &mut PullSummary,
    ) -> ReplicationResult<()> {
        batch.sort_by_key(|d| d.fake_seq);
        for item in batch {
            let (rev, history) = forced_revision_from_wire(item.document, item.parts)?;
            match self.datastore.force_insert(rev, &history, Some(source)) {
                Ok(revision) => {
                    debug!(doc_id = revision.doc_id(), rev = %revision.rev_id(), "pulled");
                    summary.revisions_inserted += 1;
                    pending.remove(item.fake_seq);
                }
                Err(StorageError::Forbidden(reason)) => {
                    warn!(%reason, "remote revision rejected by validation");
                    pending.remove(item.fake_seq);
                }
                Err(err) => {
                    summary.failures += 1;
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// POST an empty doc list at `_bulk_get`: `405` proves the endpoint
/// exists (wrong method); anything else disables the fast path.
async fn probe_bulk_get(client: &RemoteClient) -> bool {
    let Ok(url) = client.url(&["_bulk_get"]) else {
        return false;
    };
    let body = serde_json::json!({ "docs": [] });
    match client
        .send_json(
            Method::POST,
            url,
            Some(&body),
            "application/json",
            "_bulk_get probe",
        )
        .await
    {
        Ok(response) => response.status() == StatusCode::METHOD_NOT_ALLOWED,
        Err(_) => false,
    }
}

/// Expands change entries into per-revision work items, drops the ones the
/// store already holds, assigns fake sequences and routes the remainder.
fn route_changes(
    engine: &Arc<StorageEngine>,
    entries: Vec<ChangeEntry>,
    pending: &mut PendingSequences,
    queues: &mut Queues,
    bulk_get: bool,
) -> ReplicationResult<()> {
    let mut expanded = Vec::new();
    for entry in entries {
        let ChangeEntry {
            seq,
            doc_id,
            revs,
            deleted,
        } = entry;
        let conflicted = revs.len() > 1;
        for rev_id in revs {
            expanded.push((doc_id.clone(), rev_id, deleted, seq.clone(), conflicted));
        }
    }

    let candidates: Vec<(String, RevisionId)> = expanded
        .iter()
        .map(|(doc_id, rev_id, ..)| (doc_id.clone(), rev_id.clone()))
        .collect();
    let missing: HashSet<(String, String)> = engine
        .find_missing(candidates)?
        .into_iter()
        .map(|(doc_id, rev_id)| (doc_id, rev_id.to_string()))
        .collect();

    for (doc_id, rev_id, deleted, seq, conflicted) in expanded {
        if !missing.contains(&(doc_id.clone(), rev_id.to_string())) {
            continue;
        }
        let fake_seq = pending.add(seq);
        let kind = if bulk_get {
            QueueKind::BulkGet
        } else if rev_id.generation() == 1 && !deleted && !conflicted {
            QueueKind::AllDocs
        } else if deleted {
            QueueKind::Deleted
        } else {
            QueueKind::Single
        };
        queues.push(PulledRevision {
            doc_id,
            rev_id,
            deleted,
            fake_seq,
            kind,
            retries: 0,
            atts_since: Vec::new(),
        });
    }
    Ok(())
}

/// Picks the next request to dispatch: bulk-get first, then bulk
/// `_all_docs`, then singles, then tombstones.
fn next_batch(
    queues: &mut Queues,
    engine: &Arc<StorageEngine>,
) -> Option<(QueueKind, Vec<PulledRevision>)> {
    let (kind, queue, batch_size) = if !queues.bulk.is_empty() {
        (QueueKind::BulkGet, &mut queues.bulk, BULK_GET_BATCH)
    } else if !queues.all_docs.is_empty() {
        (QueueKind::AllDocs, &mut queues.all_docs, ALL_DOCS_BATCH)
    } else if !queues.single.is_empty() {
        (QueueKind::Single, &mut queues.single, 1)
    } else if !queues.deleted.is_empty() {
        (QueueKind::Deleted, &mut queues.deleted, 1)
    } else {
        return None;
    };

    let take = batch_size.min(queue.len());
    let mut batch: Vec<PulledRevision> = queue.drain(..take).collect();
    if matches!(kind, QueueKind::BulkGet | QueueKind::Single) {
        for rev in &mut batch {
            rev.atts_since = engine
                .possible_ancestors(&rev.doc_id, &rev.rev_id, POSSIBLE_ANCESTORS_LIMIT)
                .map(|ancestors| ancestors.iter().map(|a| a.to_string()).collect())
                .unwrap_or_default();
        }
    }
    Some((kind, batch))
}

/// Applies one reaped task outcome: queue downloads, requeue retryables,
/// propagate terminal errors.
fn handle_fetch_outcome(
    joined: Result<ReplicationResult<FetchResult>, tokio::task::JoinError>,
    downloads: &mut Batcher<Downloaded>,
    queues: &mut Queues,
    summary: &mut PullSummary,
) -> ReplicationResult<()> {
    let result = match joined {
        Err(join_err) if join_err.is_cancelled() => return Ok(()),
        Err(join_err) => {
            return Err(ReplicationError::Upstream(format!(
                "fetch task failed: {join_err}"
            )))
        }
        Ok(result) => result?,
    };

    summary.failures += result.failures;
    downloads.extend(result.downloaded);
    for mut rev in result.requeue {
        rev.retries += 1;
        if rev.retries > MAX_FETCH_RETRIES {
            warn!(doc_id = %rev.doc_id, rev = %rev.rev_id, "revision dropped after repeated fetch failures");
            summary.failures += 1;
        } else {
            queues.push(rev);
        }
    }
    Ok(())
}

async fn save_checkpoint_if_advanced(
    engine: &Arc<StorageEngine>,
    remote: &mut RemoteCheckpoint,
    checkpoint_id: &str,
    pending: &PendingSequences,
    last_saved: &mut Option<Value>,
) -> ReplicationResult<()> {
    let Some(value) = pending.checkpointed_value() else {
        return Ok(());
    };
    if last_saved.as_ref() == Some(value) {
        return Ok(());
    }
    engine.set_checkpoint(checkpoint_id, false, value)?;
    if let Err(err) = remote.save(value).await {
        // The local checkpoint is authoritative; a failed remote write
        // costs a re-fetch at worst.
        warn!(%err, "remote checkpoint write failed");
    }
    *last_saved = Some(value.clone());
    Ok(())
}

fn transient_requeue(batch: Vec<PulledRevision>, err: ReplicationError) -> FetchResult {
    warn!(%err, count = batch.len(), "transient fetch failure, requeueing");
    FetchResult {
        downloaded: Vec::new(),
        requeue: batch,
        failures: 1,
    }
}

/// `POST _bulk_get?latest=true&revs=true&attachments=true` for up to 50
/// revisions; attachments arrive inline in the JSON results.
async fn fetch_bulk_get(
    client: Arc<RemoteClient>,
    batch: Vec<PulledRevision>,
) -> ReplicationResult<FetchResult> {
    let mut url = client.url(&["_bulk_get"])?;
    url.query_pairs_mut()
        .append_pair("latest", "true")
        .append_pair("revs", "true")
        .append_pair("attachments", "true");
    let docs: Vec<Value> = batch
        .iter()
        .map(|rev| {
            serde_json::json!({
                "id": rev.doc_id,
                "rev": rev.rev_id.to_string(),
                "atts_since": rev.atts_since,
            })
        })
        .collect();
    let body = serde_json::json!({ "docs": docs });

    let response = match client
        .send_json(Method::POST, url, Some(&body), "application/json", "_bulk_get")
        .await
    {
        Ok(response) => response,
        Err(err) if err.is_transient() => return Ok(transient_requeue(batch, err)),
        Err(err) => return Err(err),
    };
    let status = response.status();
    if !status.is_success() {
        let err = RemoteClient::status_error(status, "_bulk_get");
        if err.is_transient() {
            return Ok(transient_requeue(batch, err));
        }
        return Err(err);
    }
    let payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(err) => return Ok(transient_requeue(batch, err.into())),
    };

    // Match response docs back to the queued revisions; `latest=true` can
    // substitute a newer leaf, so fall back to matching by document ID.
    let mut by_id_rev: HashMap<(String, String), PulledRevision> = HashMap::new();
    let mut by_id: HashMap<String, Vec<u64>> = HashMap::new();
    for rev in batch {
        by_id.entry(rev.doc_id.clone()).or_default().push(rev.fake_seq);
        by_id_rev.insert((rev.doc_id.clone(), rev.rev_id.to_string()), rev);
    }

    let mut out = FetchResult {
        downloaded: Vec::new(),
        requeue: Vec::new(),
        failures: 0,
    };
    let results = payload
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplicationError::Upstream("_bulk_get body has no results".into()))?;
    for result in results {
        let docs = result.get("docs").and_then(Value::as_array);
        for entry in docs.into_iter().flatten() {
            if let Some(ok) = entry.get("ok").and_then(Value::as_object) {
                let doc_id = ok.get("_id").and_then(Value::as_str).unwrap_or_default();
                let rev_str = ok.get("_rev").and_then(Value::as_str).unwrap_or_default();
                let matched = by_id_rev
                    .remove(&(doc_id.to_string(), rev_str.to_string()))
                    .map(|rev| rev.fake_seq)
                    .or_else(|| by_id.get_mut(doc_id).and_then(|seqs| seqs.pop()));
                match matched {
                    Some(fake_seq) => out.downloaded.push(Downloaded {
                        fake_seq,
                        document: ok.clone(),
                        parts: Vec::new(),
                    }),
                    None => {
                        warn!(doc_id, rev = rev_str, "_bulk_get returned unrequested doc");
                    }
                }
            } else if let Some(error) = entry.get("error") {
                warn!(%error, "_bulk_get reported an error entry");
                out.failures += 1;
            }
        }
    }
    Ok(out)
}

/// `POST _all_docs?include_docs=true` for first-generation revisions.
/// Rows whose returned `_rev` differs from the expected one or that carry
/// inline `_attachments` fall back to single fetches.
async fn fetch_all_docs(
    client: Arc<RemoteClient>,
    batch: Vec<PulledRevision>,
) -> ReplicationResult<FetchResult> {
    let mut url = client.url(&["_all_docs"])?;
    url.query_pairs_mut().append_pair("include_docs", "true");
    let keys: Vec<Value> = batch
        .iter()
        .map(|rev| Value::String(rev.doc_id.clone()))
        .collect();
    let body = serde_json::json!({ "keys": keys });

    let response = match client
        .send_json(Method::POST, url, Some(&body), "application/json", "_all_docs")
        .await
    {
        Ok(response) => response,
        Err(err) if err.is_transient() => return Ok(transient_requeue(batch, err)),
        Err(err) => return Err(err),
    };
    let status = response.status();
    if !status.is_success() {
        let err = RemoteClient::status_error(status, "_all_docs");
        if err.is_transient() {
            return Ok(transient_requeue(batch, err));
        }
        return Err(err);
    }
    let payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(err) => return Ok(transient_requeue(batch, err.into())),
    };

    let mut queued: HashMap<String, PulledRevision> = batch
        .into_iter()
        .map(|rev| (rev.doc_id.clone(), rev))
        .collect();
    let mut out = FetchResult {
        downloaded: Vec::new(),
        requeue: Vec::new(),
        failures: 0,
    };

    let rows = payload
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplicationError::Upstream("_all_docs body has no rows".into()))?;
    for row in rows {
        let Some(id) = row.get("id").and_then(Value::as_str) else {
            continue;
        };
        let Some(rev) = queued.remove(id) else {
            continue;
        };
        let accepted = row
            .get("doc")
            .and_then(Value::as_object)
            .filter(|doc| {
                doc.get("_rev").and_then(Value::as_str) == Some(rev.rev_id.to_string().as_str())
                    && !doc.contains_key("_attachments")
            })
            .cloned();
        match accepted {
            Some(document) => out.downloaded.push(Downloaded {
                fake_seq: rev.fake_seq,
                document,
                parts: Vec::new(),
            }),
            None => {
                let mut rev = rev;
                rev.kind = QueueKind::Single;
                out.requeue.push(rev);
            }
        }
    }
    // Anything the response skipped gets fetched singly too.
    for (_, mut rev) in queued {
        rev.kind = QueueKind::Single;
        out.requeue.push(rev);
    }
    Ok(out)
}

/// Single-revision GET; multipart when attachments follow.
async fn fetch_single(
    client: Arc<RemoteClient>,
    store: BlobStore,
    rev: PulledRevision,
) -> ReplicationResult<FetchResult> {
    let mut url = client.url(&[&rev.doc_id])?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("rev", &rev.rev_id.to_string());
        query.append_pair("latest", "true");
        query.append_pair("revs", "true");
        // Tombstones carry no attachments; skip the attachment params.
        if !rev.deleted {
            query.append_pair("attachments", "true");
            if !rev.atts_since.is_empty() {
                let atts_since = serde_json::to_string(&rev.atts_since)
                    .unwrap_or_else(|_| "[]".to_string());
                query.append_pair("atts_since", &atts_since);
            }
        }
    }

    let context = format!("GET {}", rev.doc_id);
    let mut response = match client
        .send_json(
            Method::GET,
            url,
            None,
            "multipart/related, application/json",
            &context,
        )
        .await
    {
        Ok(response) => response,
        Err(err) if err.is_transient() => return Ok(transient_requeue(vec![rev], err)),
        Err(err) => return Err(err),
    };
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        // The revision vanished remotely (purge or compaction); it cannot
        // be fetched, so it is dropped and the checkpoint stays behind it.
        warn!(doc_id = %rev.doc_id, rev = %rev.rev_id, "remote revision not found");
        return Ok(FetchResult {
            downloaded: Vec::new(),
            requeue: Vec::new(),
            failures: 1,
        });
    }
    if !status.is_success() {
        let err = RemoteClient::status_error(status, &context);
        if err.is_transient() {
            return Ok(transient_requeue(vec![rev], err));
        }
        return Err(err);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    if content_type.starts_with("multipart/") {
        let mut reader = MultipartReader::new(&content_type, store)?;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => reader.feed(&chunk)?,
                Ok(None) => break,
                Err(err) => return Ok(transient_requeue(vec![rev], err.into())),
            }
        }
        let parsed = reader.finish()?;
        Ok(FetchResult {
            downloaded: vec![Downloaded {
                fake_seq: rev.fake_seq,
                document: parsed.document,
                parts: parsed.parts,
            }],
            requeue: Vec::new(),
            failures: 0,
        })
    } else {
        let document: Map<String, Value> = match response.json().await {
            Ok(document) => document,
            Err(err) => return Ok(transient_requeue(vec![rev], err.into())),
        };
        Ok(FetchResult {
            downloaded: vec![Downloaded {
                fake_seq: rev.fake_seq,
                document,
                parts: Vec::new(),
            }],
            requeue: Vec::new(),
            failures: 0,
        })
    }
}
