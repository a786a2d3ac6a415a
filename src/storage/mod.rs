//! Durable revision-tree storage over SQLite
//!
//! The engine owns the persistent schema: documents and their revision
//! forest, attachment rows, local documents, replication checkpoints, and
//! the store's identity UUIDs. It is synchronous and single-writer; all
//! mutation happens inside transactions that either commit whole or leave
//! the store untouched.
//!
//! # Invariants enforced
//!
//! - The set of `current = 1` revisions equals the set of tree leaves.
//! - Exactly one current revision per document is the winner: the
//!   non-deleted leaf with the highest revision ID, or the highest
//!   tombstone when every leaf is deleted.
//! - Sequence numbers are unique and monotonically increasing store-wide,
//!   never reused.
//! - A revision's generation is its parent's generation + 1 (1 at roots).

mod attachments;
mod collation;
mod engine;
mod errors;
mod force_insert;
mod key_provider;
mod localdocs;
mod queries;
mod schema;

pub use attachments::{AttachmentInput, PulledAttachment, PulledAttachmentContent};
pub use collation::{collate_json, register_collations};
pub use engine::{EngineState, PutOutcome, StorageEngine, ValidationFn, WriteHooks};
pub use errors::{StorageError, StorageResult};
pub use force_insert::ForcedRevision;
pub use key_provider::{key_fingerprint, FixedKey, KeyProvider, NoEncryption};
pub use localdocs::LocalDocument;
pub use queries::{AllDocsOptions, AllDocsRow, Change, ChangesOptions};
pub use schema::SCHEMA_VERSION;

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use tempfile::TempDir;

    use crate::revision::{Body, RevisionId};

    use super::*;

    fn body(json: &str) -> Body {
        serde_json::from_str(json).unwrap()
    }

    fn open_engine() -> (TempDir, StorageEngine) {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), "test", None).unwrap();
        (dir, engine)
    }

    fn forced(doc_id: &str, rev: &str, body_json: &str) -> ForcedRevision {
        ForcedRevision {
            doc_id: doc_id.into(),
            rev_id: rev.parse().unwrap(),
            deleted: false,
            body: body(body_json),
            attachments: Vec::new(),
        }
    }

    fn history(revs: &[&str]) -> Vec<RevisionId> {
        revs.iter().map(|r| r.parse().unwrap()).collect()
    }

    // =====================================================================
    // Create / update / delete
    // =====================================================================

    #[test]
    fn test_create_update_delete_cycle() {
        let (_dir, engine) = open_engine();

        let r1 = engine
            .put("d1", body(r#"{"a":1}"#), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        assert_eq!(r1.rev_id().generation(), 1);

        let r2 = engine
            .put(
                "d1",
                body(r#"{"a":2}"#),
                Vec::new(),
                Some(r1.rev_id()),
                false,
                false,
            )
            .unwrap()
            .revision;
        assert_eq!(r2.rev_id().generation(), 2);

        // r1 is interior now.
        let leaves = engine.open_revisions("d1").unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].rev_id(), r2.rev_id());

        let r3 = engine.delete("d1", r2.rev_id()).unwrap().revision;
        assert!(r3.is_deleted());
        assert!(r3.body().is_none());

        let winner = engine.get("d1", None).unwrap();
        assert_eq!(winner.rev_id(), r3.rev_id());
        assert!(winner.is_deleted());
    }

    #[test]
    fn test_round_trip_body() {
        let (_dir, engine) = open_engine();
        let b = body(r#"{"k":"v","n":[1,2,{"x":null}]}"#);
        let rev = engine
            .put("doc", b.clone(), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        let read = engine.get("doc", Some(rev.rev_id())).unwrap();
        assert_eq!(read.body().unwrap(), &b);
    }

    #[test]
    fn test_empty_body_put_succeeds() {
        let (_dir, engine) = open_engine();
        assert!(engine
            .put("doc", Body::new(), Vec::new(), None, false, false)
            .is_ok());
    }

    #[test]
    fn test_reserved_key_rejected() {
        let (_dir, engine) = open_engine();
        let err = engine
            .put("doc", body(r#"{"_id":"x"}"#), Vec::new(), None, false, false)
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn test_put_against_non_leaf_conflicts() {
        let (_dir, engine) = open_engine();
        let r1 = engine
            .put("d", body(r#"{"v":1}"#), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        engine
            .put("d", body(r#"{"v":2}"#), Vec::new(), Some(r1.rev_id()), false, false)
            .unwrap();

        let err = engine
            .put("d", body(r#"{"v":3}"#), Vec::new(), Some(r1.rev_id()), false, false)
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // allow_conflict branches the tree instead.
        engine
            .put("d", body(r#"{"v":3}"#), Vec::new(), Some(r1.rev_id()), true, false)
            .unwrap();
        assert_eq!(engine.open_revisions("d").unwrap().len(), 2);
    }

    #[test]
    fn test_create_over_live_doc_conflicts() {
        let (_dir, engine) = open_engine();
        engine
            .put("d", body(r#"{"v":1}"#), Vec::new(), None, false, false)
            .unwrap();
        let err = engine
            .put("d", body(r#"{"v":2}"#), Vec::new(), None, false, false)
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn test_delete_deleted_leaf_conflicts() {
        let (_dir, engine) = open_engine();
        let r1 = engine
            .put("d", body("{}"), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        let r2 = engine.delete("d", r1.rev_id()).unwrap().revision;
        let err = engine.delete("d", r2.rev_id()).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn test_delete_by_id_tombstones_every_live_leaf() {
        let (_dir, engine) = open_engine();
        let r1 = engine
            .put("d", body(r#"{"v":1}"#), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        engine
            .put("d", body(r#"{"v":2}"#), Vec::new(), Some(r1.rev_id()), false, false)
            .unwrap();
        engine
            .put("d", body(r#"{"v":3}"#), Vec::new(), Some(r1.rev_id()), true, false)
            .unwrap();

        let tombstones = engine.delete_by_id("d").unwrap();
        assert_eq!(tombstones.len(), 2);
        assert!(tombstones.iter().all(|t| t.is_deleted()));
        assert!(engine.get("d", None).unwrap().is_deleted());
    }

    // =====================================================================
    // Sequences and counters
    // =====================================================================

    #[test]
    fn test_sequences_monotonic() {
        let (_dir, engine) = open_engine();
        let a = engine
            .put("a", body("{}"), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        let b = engine
            .put("b", body("{}"), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        assert!(a.sequence() < b.sequence());
        assert_eq!(engine.last_sequence().unwrap(), b.sequence());
    }

    #[test]
    fn test_document_count_skips_deleted() {
        let (_dir, engine) = open_engine();
        let r = engine
            .put("a", body("{}"), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        engine
            .put("b", body("{}"), Vec::new(), None, false, false)
            .unwrap();
        assert_eq!(engine.document_count().unwrap(), 2);
        engine.delete("a", r.rev_id()).unwrap();
        assert_eq!(engine.document_count().unwrap(), 1);
    }

    #[test]
    fn test_uuids_are_stable() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), "db", None).unwrap();
        let public = engine.public_uuid().unwrap();
        let private = engine.private_uuid().unwrap();
        engine.close();
        let engine = StorageEngine::open(dir.path(), "db", None).unwrap();
        assert_eq!(engine.public_uuid().unwrap(), public);
        assert_eq!(engine.private_uuid().unwrap(), private);
    }

    #[test]
    fn test_write_hooks_bracket_transactions() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        #[derive(Default)]
        struct Counting {
            before: AtomicUsize,
            after: AtomicUsize,
        }
        impl WriteHooks for Counting {
            fn before_write(&self) {
                self.before.fetch_add(1, Ordering::SeqCst);
            }
            fn after_write(&self) {
                self.after.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_dir, engine) = open_engine();
        let hooks = Arc::new(Counting::default());
        engine.set_write_hooks(Some(hooks.clone()));

        engine
            .put("d", body("{}"), Vec::new(), None, false, false)
            .unwrap();
        assert_eq!(hooks.before.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.after.load(Ordering::SeqCst), 1);

        // Hooks fire on failing writes too.
        let _ = engine.put("d", body("{}"), Vec::new(), None, false, false);
        assert_eq!(hooks.before.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.after.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closed_engine_rejects_operations() {
        let (_dir, engine) = open_engine();
        engine.close();
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(matches!(
            engine.get("d", None),
            Err(StorageError::Closed)
        ));
    }

    // =====================================================================
    // Forced inserts
    // =====================================================================

    #[test]
    fn test_force_insert_creates_conflict_branch() {
        let (_dir, engine) = open_engine();
        let r1 = engine
            .put("d1", body(r#"{"v":"local"}"#), Vec::new(), None, false, false)
            .unwrap()
            .revision;

        let outcome = engine
            .force_insert(
                forced("d1", "2-xyz", r#"{"v":"remote"}"#),
                &history(&["2-xyz", "1-foreign"]),
                None,
            )
            .unwrap();

        let leaves = engine.open_revisions("d1").unwrap();
        assert_eq!(leaves.len(), 2);
        let rev_ids: Vec<String> = leaves.iter().map(|l| l.rev_id().to_string()).collect();
        assert!(rev_ids.contains(&r1.rev_id().to_string()));
        assert!(rev_ids.contains(&"2-xyz".to_string()));

        // The higher generation wins.
        assert_eq!(outcome.winner.rev_id().to_string(), "2-xyz");
        assert_eq!(engine.get("d1", None).unwrap().rev_id().to_string(), "2-xyz");
    }

    #[test]
    fn test_force_insert_is_idempotent() {
        let (_dir, engine) = open_engine();
        let h = history(&["2-b", "1-a"]);
        engine
            .force_insert(forced("d", "2-b", r#"{"n":1}"#), &h, None)
            .unwrap();
        let seq_after_first = engine.last_sequence().unwrap();

        engine
            .force_insert(forced("d", "2-b", r#"{"n":1}"#), &h, None)
            .unwrap();
        assert_eq!(engine.last_sequence().unwrap(), seq_after_first);
        assert_eq!(engine.open_revisions("d").unwrap().len(), 1);
    }

    #[test]
    fn test_force_insert_stores_ancestors_as_stubs() {
        let (_dir, engine) = open_engine();
        engine
            .force_insert(
                forced("d", "3-c", r#"{"n":3}"#),
                &history(&["3-c", "2-b", "1-a"]),
                None,
            )
            .unwrap();

        let chain = engine
            .revision_history("d", &"3-c".parse().unwrap())
            .unwrap();
        assert_eq!(chain.len(), 3);
        assert!(chain[0].body().is_some());
        assert!(chain[1].is_missing());
        assert!(chain[2].is_missing());
    }

    #[test]
    fn test_force_insert_fills_stub_later() {
        let (_dir, engine) = open_engine();
        engine
            .force_insert(
                forced("d", "2-b", r#"{"n":2}"#),
                &history(&["2-b", "1-a"]),
                None,
            )
            .unwrap();
        // The body for the stub ancestor arrives afterwards.
        engine
            .force_insert(forced("d", "1-a", r#"{"n":1}"#), &history(&["1-a"]), None)
            .unwrap();

        let chain = engine
            .revision_history("d", &"2-b".parse().unwrap())
            .unwrap();
        assert!(chain[1].body().is_some());
        // Filling a stub must not resurrect its current flag.
        assert_eq!(engine.open_revisions("d").unwrap().len(), 1);
    }

    #[test]
    fn test_force_insert_validation_rejects() {
        let (_dir, engine) = open_engine();
        engine.set_validation(Some(std::sync::Arc::new(|rev: &ForcedRevision| {
            if rev.doc_id.starts_with("blocked") {
                Err("blocked by policy".to_string())
            } else {
                Ok(())
            }
        })));

        let err = engine
            .force_insert(forced("blocked-1", "1-a", "{}"), &history(&["1-a"]), None)
            .unwrap_err();
        assert!(matches!(err, StorageError::Forbidden(_)));

        engine
            .force_insert(forced("ok-1", "1-a", "{}"), &history(&["1-a"]), None)
            .unwrap();
    }

    #[test]
    fn test_force_insert_rejects_gapped_history() {
        let (_dir, engine) = open_engine();
        let err = engine
            .force_insert(
                forced("d", "3-c", "{}"),
                &history(&["3-c", "1-a"]),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn test_find_missing_filters_present_revisions() {
        let (_dir, engine) = open_engine();
        engine
            .force_insert(forced("d", "1-a", "{}"), &history(&["1-a"]), None)
            .unwrap();

        let missing = engine
            .find_missing(vec![
                ("d".to_string(), "1-a".parse().unwrap()),
                ("d".to_string(), "2-b".parse().unwrap()),
                ("other".to_string(), "1-z".parse().unwrap()),
            ])
            .unwrap();
        let missing: Vec<String> = missing
            .into_iter()
            .map(|(d, r)| format!("{d}@{r}"))
            .collect();
        assert_eq!(missing, vec!["d@2-b".to_string(), "other@1-z".to_string()]);
    }

    // =====================================================================
    // Queries
    // =====================================================================

    #[test]
    fn test_changes_since_orders_by_sequence() {
        let (_dir, engine) = open_engine();
        engine
            .put("a", body("{}"), Vec::new(), None, false, false)
            .unwrap();
        let b = engine
            .put("b", body("{}"), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        engine
            .put("b", body(r#"{"v":2}"#), Vec::new(), Some(b.rev_id()), false, false)
            .unwrap();

        let changes = engine
            .changes_since(0, &ChangesOptions::default(), None)
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].revision.sequence() < changes[1].revision.sequence());

        let since = changes[0].revision.sequence();
        let later = engine
            .changes_since(since, &ChangesOptions::default(), None)
            .unwrap();
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn test_changes_since_conflict_flag() {
        let (_dir, engine) = open_engine();
        engine
            .force_insert(forced("d", "1-a", "{}"), &history(&["1-a"]), None)
            .unwrap();
        engine
            .force_insert(forced("d", "1-b", "{}"), &history(&["1-b"]), None)
            .unwrap();

        let winners = engine
            .changes_since(0, &ChangesOptions::default(), None)
            .unwrap();
        assert_eq!(winners.len(), 1);
        assert!(winners[0].conflicted);

        let all = engine
            .changes_since(
                0,
                &ChangesOptions {
                    include_conflicts: true,
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_all_docs_listing_and_keys() {
        let (_dir, engine) = open_engine();
        for id in ["a", "b", "c"] {
            engine
                .put(id, body("{}"), Vec::new(), None, false, false)
                .unwrap();
        }

        let rows = engine.all_docs(&AllDocsOptions::default()).unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let rows = engine
            .all_docs(&AllDocsOptions {
                descending: true,
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);

        let rows = engine
            .all_docs(&AllDocsOptions {
                keys: Some(vec!["b".into(), "nope".into()]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].revision.is_some());
        assert_eq!(rows[1].error, Some("not_found"));
    }

    #[test]
    fn test_possible_ancestors() {
        let (_dir, engine) = open_engine();
        let r1 = engine
            .put("d", body(r#"{"v":1}"#), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        let r2 = engine
            .put("d", body(r#"{"v":2}"#), Vec::new(), Some(r1.rev_id()), false, false)
            .unwrap()
            .revision;

        let target = RevisionId::from_str("3-zzzz").unwrap();
        let ancestors = engine.possible_ancestors("d", &target, 10).unwrap();
        assert_eq!(ancestors.len(), 2);
        assert_eq!(&ancestors[0], r2.rev_id());
        assert_eq!(&ancestors[1], r1.rev_id());
    }

    // =====================================================================
    // Compaction
    // =====================================================================

    #[test]
    fn test_compact_prunes_interior_bodies_only() {
        let (_dir, engine) = open_engine();
        let r1 = engine
            .put("d", body(r#"{"v":1}"#), Vec::new(), None, false, false)
            .unwrap()
            .revision;
        let r2 = engine
            .put("d", body(r#"{"v":2}"#), Vec::new(), Some(r1.rev_id()), false, false)
            .unwrap()
            .revision;

        engine.compact().unwrap();

        let old = engine.get("d", Some(r1.rev_id())).unwrap();
        assert!(old.is_missing());
        let tip = engine.get("d", Some(r2.rev_id())).unwrap();
        assert_eq!(tip.body().unwrap(), &body(r#"{"v":2}"#));
    }

    // =====================================================================
    // Local documents and checkpoints
    // =====================================================================

    #[test]
    fn test_local_docs_crud() {
        let (_dir, engine) = open_engine();
        let rev1 = engine.put_local("_local/cp", body(r#"{"seq":"1"}"#)).unwrap();
        assert_eq!(rev1, "1-local");
        let rev2 = engine.put_local("_local/cp", body(r#"{"seq":"2"}"#)).unwrap();
        assert_eq!(rev2, "2-local");

        let doc = engine.get_local("_local/cp").unwrap();
        assert_eq!(doc.rev_id, "2-local");
        assert_eq!(doc.body, body(r#"{"seq":"2"}"#));

        engine.delete_local("_local/cp").unwrap();
        assert!(matches!(
            engine.get_local("_local/cp"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let (_dir, engine) = open_engine();
        assert!(engine.checkpoint("rep-1", false).unwrap().is_none());

        engine
            .set_checkpoint("rep-1", false, &serde_json::json!("42-abc"))
            .unwrap();
        let cp = engine.checkpoint("rep-1", false).unwrap().unwrap();
        assert_eq!(cp, serde_json::json!({"seq": "42-abc"}));

        // Opaque non-string sequences survive too.
        engine
            .set_checkpoint("rep-1", false, &serde_json::json!([2, "x"]))
            .unwrap();
        let cp = engine.checkpoint("rep-1", false).unwrap().unwrap();
        assert_eq!(cp, serde_json::json!({"seq": [2, "x"]}));
    }
}
