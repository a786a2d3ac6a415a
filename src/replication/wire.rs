//! Wire-document decoding
//!
//! A pulled document arrives as CouchDB JSON: reserved `_`-prefixed fields
//! carry identity (`_id`, `_rev`), the ancestry (`_revisions`) and the
//! attachment manifest (`_attachments`); everything else is the body.

use std::str::FromStr;

use serde_json::{Map, Value};

use crate::revision::{Body, RevisionId};
use crate::storage::ForcedRevision;

use super::errors::{ReplicationError, ReplicationResult};
use super::multipart::{associate_attachments, FinishedPart};

/// Splits a wire document into a forced revision plus its history,
/// binding any multipart `parts` to the attachment manifest.
pub(crate) fn forced_revision_from_wire(
    document: Map<String, Value>,
    parts: Vec<FinishedPart>,
) -> ReplicationResult<(ForcedRevision, Vec<RevisionId>)> {
    let doc_id = document
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ReplicationError::Upstream("document without _id".into()))?
        .to_string();
    let rev_str = document
        .get("_rev")
        .and_then(Value::as_str)
        .ok_or_else(|| ReplicationError::Upstream(format!("document {doc_id} without _rev")))?;
    let rev_id = RevisionId::from_str(rev_str)
        .map_err(|_| ReplicationError::Upstream(format!("bad _rev {rev_str:?}")))?;
    let deleted = document
        .get("_deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let history = match document.get("_revisions") {
        Some(revisions) => history_from_revisions(&doc_id, revisions)?,
        None => vec![rev_id.clone()],
    };
    if history.first() != Some(&rev_id) {
        return Err(ReplicationError::Upstream(format!(
            "_revisions of {doc_id} does not start at {rev_id}"
        )));
    }

    let attachments = associate_attachments(&document, parts)?;

    let mut body = Body::new();
    for (key, value) in document {
        if !key.starts_with('_') {
            body.insert(key, value);
        }
    }

    Ok((
        ForcedRevision {
            doc_id,
            rev_id,
            deleted,
            body,
            attachments,
        },
        history,
    ))
}

/// Expands `{"start": N, "ids": [...]}` into full revision IDs, newest
/// first.
fn history_from_revisions(doc_id: &str, revisions: &Value) -> ReplicationResult<Vec<RevisionId>> {
    let object = revisions
        .as_object()
        .ok_or_else(|| ReplicationError::Upstream(format!("_revisions of {doc_id} malformed")))?;
    let start = object
        .get("start")
        .and_then(Value::as_u64)
        .ok_or_else(|| ReplicationError::Upstream(format!("_revisions of {doc_id} lacks start")))?;
    let ids = object
        .get("ids")
        .and_then(Value::as_array)
        .ok_or_else(|| ReplicationError::Upstream(format!("_revisions of {doc_id} lacks ids")))?;
    if ids.is_empty() || start < ids.len() as u64 {
        return Err(ReplicationError::Upstream(format!(
            "_revisions of {doc_id} inconsistent"
        )));
    }

    let mut history = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let suffix = id.as_str().ok_or_else(|| {
            ReplicationError::Upstream(format!("_revisions of {doc_id} has non-string id"))
        })?;
        let generation = start - i as u64;
        let rev = RevisionId::new(generation, suffix)
            .map_err(|_| ReplicationError::Upstream(format!("bad revision {generation}-{suffix}")))?;
        history.push(rev);
    }
    Ok(history)
}
