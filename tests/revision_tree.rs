//! Revision-tree invariant tests
//!
//! End-to-end CRUD and forced-insert behavior through the datastore
//! facade:
//! - exactly one winner per document, chosen by the ordering rule
//! - the set of current revisions equals the set of tree leaves
//! - sequences grow monotonically and are never reused
//! - forced inserts are idempotent and preserve every branch

use std::sync::Arc;

use satchel::revision::Body;
use satchel::storage::{ChangesOptions, ForcedRevision, NoEncryption, StorageError};
use satchel::{Datastore, DatastoreManager};
use tempfile::TempDir;

fn body(json: &str) -> Body {
    serde_json::from_str(json).unwrap()
}

fn open_datastore() -> (TempDir, Arc<Datastore>) {
    let dir = TempDir::new().unwrap();
    let manager = DatastoreManager::new(dir.path()).unwrap();
    let ds = manager.open_datastore("db", &NoEncryption).unwrap();
    (dir, ds)
}

fn forced(doc_id: &str, rev: &str, body_json: &str, deleted: bool) -> ForcedRevision {
    ForcedRevision {
        doc_id: doc_id.into(),
        rev_id: rev.parse().unwrap(),
        deleted,
        body: body(body_json),
        attachments: Vec::new(),
    }
}

/// Scenario: create, update, delete.
#[test]
fn test_create_update_delete() {
    let (_dir, ds) = open_datastore();

    let r1 = ds
        .create_document(Some("d1".into()), body(r#"{"a":1}"#), Vec::new())
        .unwrap();
    assert_eq!(r1.rev_id().generation(), 1);

    let r2 = ds.update_document(&r1, body(r#"{"a":2}"#), Vec::new()).unwrap();
    assert_eq!(r2.rev_id().generation(), 2);
    assert!(r1.sequence() < r2.sequence());

    // r1 flipped to interior, r2 is the only leaf.
    let leaves = ds.engine().open_revisions("d1").unwrap();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].rev_id(), r2.rev_id());

    let r3 = ds.delete_document(&r2).unwrap();
    assert!(r3.is_deleted());
    assert!(r3.body().is_none());

    // The winner is now the tombstone; the facade reports Deleted.
    let winner = ds.engine().get("d1", None).unwrap();
    assert_eq!(winner.rev_id(), r3.rev_id());
    assert!(winner.is_deleted());
    assert!(matches!(
        ds.get_document("d1"),
        Err(StorageError::Deleted { .. })
    ));
}

/// Scenario: a forced insert creates a conflict branch and the higher
/// generation wins.
#[test]
fn test_force_insert_conflict_and_winner() {
    let (_dir, ds) = open_datastore();

    let local = ds
        .create_document(Some("d1".into()), body(r#"{"v":"local"}"#), Vec::new())
        .unwrap();

    let history: Vec<_> = ["2-xyz", "1-foreign"]
        .iter()
        .map(|r| r.parse().unwrap())
        .collect();
    ds.force_insert(forced("d1", "2-xyz", r#"{"v":"remote"}"#, false), &history, None)
        .unwrap();

    let leaves = ds.engine().open_revisions("d1").unwrap();
    assert_eq!(leaves.len(), 2, "both branches must survive");
    let ids: Vec<String> = leaves.iter().map(|l| l.rev_id().to_string()).collect();
    assert!(ids.contains(&local.rev_id().to_string()));
    assert!(ids.contains(&"2-xyz".to_string()));

    let winner = ds.get_document("d1").unwrap();
    assert_eq!(winner.rev_id().to_string(), "2-xyz");
}

/// Winner rule on equal generations: lexicographically higher suffix.
#[test]
fn test_winner_on_generation_tie() {
    let (_dir, ds) = open_datastore();

    ds.force_insert(
        forced("d", "1-aaa", r#"{"from":"a"}"#, false),
        &["1-aaa".parse().unwrap()],
        None,
    )
    .unwrap();
    ds.force_insert(
        forced("d", "1-bbb", r#"{"from":"b"}"#, false),
        &["1-bbb".parse().unwrap()],
        None,
    )
    .unwrap();

    let winner = ds.get_document("d").unwrap();
    assert_eq!(winner.rev_id().to_string(), "1-bbb");
}

/// A deleted branch loses to a live one regardless of revision ordering.
#[test]
fn test_deleted_branch_does_not_win() {
    let (_dir, ds) = open_datastore();

    // Live branch at generation 1, deleted branch at generation 3.
    ds.force_insert(
        forced("d", "1-aaa", r#"{"alive":true}"#, false),
        &["1-aaa".parse().unwrap()],
        None,
    )
    .unwrap();
    let history: Vec<_> = ["3-ddd", "2-ccc", "1-bbb"]
        .iter()
        .map(|r| r.parse().unwrap())
        .collect();
    ds.force_insert(forced("d", "3-ddd", "{}", true), &history, None)
        .unwrap();

    let winner = ds.get_document("d").unwrap();
    assert_eq!(winner.rev_id().to_string(), "1-aaa");
    assert!(!winner.is_deleted());
}

/// Idempotence: applying the same forced insert twice changes nothing.
#[test]
fn test_force_insert_idempotent() {
    let (_dir, ds) = open_datastore();

    let history: Vec<_> = ["2-bb", "1-aa"].iter().map(|r| r.parse().unwrap()).collect();
    ds.force_insert(forced("d", "2-bb", r#"{"n":1}"#, false), &history, None)
        .unwrap();

    let seq_before = ds.engine().last_sequence().unwrap();
    let changes_before = ds
        .engine()
        .changes_since(0, &ChangesOptions::default(), None)
        .unwrap()
        .len();

    ds.force_insert(forced("d", "2-bb", r#"{"n":1}"#, false), &history, None)
        .unwrap();

    assert_eq!(ds.engine().last_sequence().unwrap(), seq_before);
    assert_eq!(
        ds.engine()
            .changes_since(0, &ChangesOptions::default(), None)
            .unwrap()
            .len(),
        changes_before
    );
}

/// Sequence monotonicity across documents and operations.
#[test]
fn test_sequences_never_reused() {
    let (_dir, ds) = open_datastore();

    let mut last = 0;
    for i in 0..10 {
        let rev = ds
            .create_document(Some(format!("doc-{i}")), body("{}"), Vec::new())
            .unwrap();
        assert!(rev.sequence() > last);
        last = rev.sequence();
    }

    let tombstones = ds.delete_document_by_id("doc-3").unwrap();
    assert_eq!(tombstones.len(), 1);
    assert!(tombstones[0].sequence() > last);
}

/// Changes feed: winners only by default, conflict leaves on request.
#[test]
fn test_changes_feed_views() {
    let (_dir, ds) = open_datastore();

    ds.force_insert(
        forced("d", "1-aaa", "{}", false),
        &["1-aaa".parse().unwrap()],
        None,
    )
    .unwrap();
    ds.force_insert(
        forced("d", "1-bbb", "{}", false),
        &["1-bbb".parse().unwrap()],
        None,
    )
    .unwrap();

    let winners = ds
        .engine()
        .changes_since(0, &ChangesOptions::default(), None)
        .unwrap();
    assert_eq!(winners.len(), 1);
    assert!(winners[0].conflicted);

    let with_conflicts = ds
        .engine()
        .changes_since(
            0,
            &ChangesOptions {
                include_conflicts: true,
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert_eq!(with_conflicts.len(), 2);
}

/// Revision history walks to the root even when ancestors are stubs.
#[test]
fn test_revision_history_via_facade() {
    let (_dir, ds) = open_datastore();

    let history: Vec<_> = ["3-cc", "2-bb", "1-aa"]
        .iter()
        .map(|r| r.parse().unwrap())
        .collect();
    let rev = ds
        .force_insert(forced("d", "3-cc", r#"{"n":3}"#, false), &history, None)
        .unwrap();

    let chain = ds.get_revision_history(&rev).unwrap();
    let ids: Vec<String> = chain.iter().map(|r| r.rev_id().to_string()).collect();
    assert_eq!(ids, vec!["3-cc", "2-bb", "1-aa"]);
    assert!(chain[0].body().is_some());
    assert!(chain[1].is_missing());
}
