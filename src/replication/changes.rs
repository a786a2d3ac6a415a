//! The change tracker
//!
//! A one-shot consumer of the remote `_changes` feed: each `poll()` issues
//! one `feed=normal` GET and parses the result batch. Transient failures
//! (network errors, 5xx, a connection dropped mid-body) retry with
//! exponential backoff starting at 200 ms and doubling to a 300 s cap, up
//! to 6 attempts; terminal statuses stop the tracker. Sequence IDs are
//! opaque: strings travel as-is on the URL, anything else is JSON-encoded
//! first.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::revision::RevisionId;

use super::client::RemoteClient;
use super::config::PullConfig;
use super::errors::{ReplicationError, ReplicationResult};

/// First backoff delay.
const BACKOFF_FLOOR: Duration = Duration::from_millis(200);
/// Backoff ceiling.
const BACKOFF_CEILING: Duration = Duration::from_secs(300);
/// Attempts per poll before giving up.
const MAX_ATTEMPTS: u32 = 6;

/// One row of the feed.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    /// Opaque remote sequence at this change.
    pub seq: Value,
    pub doc_id: String,
    /// Leaf revisions reported for the document; more than one means the
    /// remote holds conflicts.
    pub revs: Vec<RevisionId>,
    pub deleted: bool,
}

/// One parsed `_changes` response.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub entries: Vec<ChangeEntry>,
    pub last_seq: Value,
    /// True when the remote returned fewer rows than the requested limit.
    pub caught_up: bool,
}

/// Incremental `_changes` poller.
pub struct ChangeTracker {
    client: Arc<RemoteClient>,
    heartbeat_ms: u64,
    limit: usize,
    filter_name: Option<String>,
    filter_parameters: BTreeMap<String, String>,
    doc_ids: Option<Vec<String>>,
    stopping: Arc<AtomicBool>,
    last_sequence: Value,
}

impl ChangeTracker {
    /// Creates a tracker starting from `since` (the checkpointed opaque
    /// sequence, or `0` for a fresh pull). `stopping` cancels retries.
    pub fn new(
        client: Arc<RemoteClient>,
        config: &PullConfig,
        since: Value,
        stopping: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client,
            heartbeat_ms: config.effective_heartbeat_ms(),
            limit: config.changes_limit,
            filter_name: config.filter_name.clone(),
            filter_parameters: config.filter_parameters.clone(),
            doc_ids: config.doc_ids.clone(),
            stopping,
            last_sequence: since,
        }
    }

    /// The sequence of the last successfully consumed change.
    pub fn last_sequence(&self) -> &Value {
        &self.last_sequence
    }

    /// Issues one poll against the feed.
    pub async fn poll(&mut self) -> ReplicationResult<ChangeBatch> {
        let url = self.changes_url()?;
        let mut delay = BACKOFF_FLOOR;
        let mut last_err = ReplicationError::TransientNetwork("no attempt made".into());

        for attempt in 0..MAX_ATTEMPTS {
            if self.stopping.load(Ordering::SeqCst) {
                return Err(ReplicationError::Stopped);
            }
            if attempt > 0 {
                debug!(?delay, attempt, "change tracker backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BACKOFF_CEILING);
                if self.stopping.load(Ordering::SeqCst) {
                    return Err(ReplicationError::Stopped);
                }
            }

            match self.attempt(url.clone()).await {
                Ok(batch) => {
                    self.last_sequence = batch.last_seq.clone();
                    return Ok(batch);
                }
                Err(err) if err.is_transient() => {
                    warn!(%err, attempt, "change tracker transient failure");
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn attempt(&self, url: url::Url) -> ReplicationResult<ChangeBatch> {
        let response = self
            .client
            .send_json(Method::GET, url, None, "application/json", "_changes")
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteClient::status_error(status, "_changes"));
        }

        // A connection closed after the response prefix but before the
        // JSON completes parses as truncated JSON: lost connection,
        // transient.
        let bytes = response.bytes().await?;
        let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
            ReplicationError::TransientNetwork(format!("truncated _changes response: {e}"))
        })?;

        parse_batch(body, self.limit)
    }

    fn changes_url(&self) -> ReplicationResult<url::Url> {
        let mut url = self.client.url(&["_changes"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("feed", "normal");
            query.append_pair("heartbeat", &self.heartbeat_ms.to_string());
            query.append_pair("since", &encode_sequence(&self.last_sequence));
            query.append_pair("limit", &self.limit.to_string());
            query.append_pair("style", "all_docs");
            if let Some(filter) = &self.filter_name {
                query.append_pair("filter", filter);
                for (name, value) in &self.filter_parameters {
                    query.append_pair(name, value);
                }
            }
            if let Some(doc_ids) = &self.doc_ids {
                let encoded = serde_json::to_string(doc_ids)
                    .map_err(|e| ReplicationError::Configuration(e.to_string()))?;
                query.append_pair("doc_ids", &encoded);
            }
        }
        Ok(url)
    }
}

/// Sequence IDs may be strings, numbers, arrays or objects. Strings go on
/// the URL as-is; everything else is JSON-encoded (the URL layer percent-
/// escapes).
fn encode_sequence(seq: &Value) -> String {
    match seq {
        Value::Null => "0".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Wire shape of a `_changes` response.
#[derive(Debug, Deserialize)]
struct WireChanges {
    results: Vec<WireChange>,
    last_seq: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireChange {
    #[serde(default)]
    seq: Value,
    id: String,
    changes: Vec<WireRev>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct WireRev {
    rev: String,
}

fn parse_batch(body: Value, limit: usize) -> ReplicationResult<ChangeBatch> {
    let wire: WireChanges = serde_json::from_value(body)
        .map_err(|e| ReplicationError::Upstream(format!("malformed _changes body: {e}")))?;

    let mut entries = Vec::with_capacity(wire.results.len());
    for row in wire.results {
        let mut revs = Vec::with_capacity(row.changes.len());
        for change in &row.changes {
            let rev = RevisionId::from_str(&change.rev).map_err(|_| {
                ReplicationError::Upstream(format!("bad rev id {:?}", change.rev))
            })?;
            revs.push(rev);
        }
        if revs.is_empty() {
            return Err(ReplicationError::Upstream(format!(
                "change for {} has no revs",
                row.id
            )));
        }
        entries.push(ChangeEntry {
            seq: row.seq,
            doc_id: row.id,
            revs,
            deleted: row.deleted,
        });
    }

    let last_seq = match wire.last_seq {
        Some(seq) => seq,
        None => entries
            .last()
            .map(|e| e.seq.clone())
            .unwrap_or(Value::Null),
    };
    let caught_up = entries.len() < limit;
    debug!(count = entries.len(), caught_up, "parsed change batch");
    Ok(ChangeBatch {
        entries,
        last_seq,
        caught_up,
    })
}
