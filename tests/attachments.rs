//! Attachment and blob-store integration tests
//!
//! Attachment bytes live in the content-addressed blob store; the
//! attachments table links (revision sequence, name) to a blob key.
//! Compaction prunes old revision bodies but never a blob referenced by a
//! surviving attachment row.

use std::io::Read;
use std::sync::Arc;

use satchel::blobstore::BlobKey;
use satchel::revision::Body;
use satchel::storage::{AttachmentInput, NoEncryption};
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

/// A megabyte of not-quite-uniform bytes.
fn big_payload() -> Vec<u8> {
    (0..1024 * 1024).map(|i| (i * 31 % 251) as u8).collect()
}

/// Scenario: attachment round-trip through put, read and compact.
#[test]
fn test_attachment_round_trip_and_compaction() {
    let (_dir, ds) = open_datastore();
    let payload = big_payload();

    let rev = ds
        .create_document(
            Some("d".into()),
            body(r#"{"kind":"image"}"#),
            vec![AttachmentInput::New {
                name: "pic".into(),
                content_type: Some("image/png".into()),
                data: payload.clone(),
            }],
        )
        .unwrap();

    let att = rev.attachment("pic").expect("attachment saved");
    assert_eq!(att.length, payload.len() as u64);
    assert_eq!(att.revpos, 1);
    assert_eq!(att.key, BlobKey::for_content(&payload));

    // Stream the bytes back and compare.
    let mut reader = ds.engine().attachment_reader(att).unwrap();
    assert_eq!(reader.length(), payload.len() as u64);
    let mut read_back = Vec::new();
    reader.read_to_end(&mut read_back).unwrap();
    assert_eq!(read_back, payload);

    // Compacting while the revision is a leaf must leave the blob alone.
    ds.compact().unwrap();
    let rev = ds.get_document("d").unwrap();
    let att = rev.attachment("pic").unwrap();
    let data = ds
        .engine()
        .attachment_reader(att)
        .unwrap()
        .read_all()
        .unwrap();
    assert_eq!(data, payload);
}

/// Stub inputs carry the parent's attachment forward unchanged.
#[test]
fn test_stub_attachment_carried_across_updates() {
    let (_dir, ds) = open_datastore();

    let r1 = ds
        .create_document(
            Some("d".into()),
            body(r#"{"v":1}"#),
            vec![AttachmentInput::New {
                name: "note.txt".into(),
                content_type: Some("text/plain".into()),
                data: b"hello".to_vec(),
            }],
        )
        .unwrap();

    let r2 = ds
        .update_document(
            &r1,
            body(r#"{"v":2}"#),
            vec![AttachmentInput::Stub {
                name: "note.txt".into(),
            }],
        )
        .unwrap();

    let att1 = r1.attachment("note.txt").unwrap();
    let att2 = r2.attachment("note.txt").unwrap();
    assert_eq!(att1.key, att2.key, "stub shares the parent's blob");
    assert_eq!(att2.revpos, 1, "revpos stays at the introducing generation");

    // An update that does not name the attachment drops it.
    let r3 = ds.update_document(&r2, body(r#"{"v":3}"#), Vec::new()).unwrap();
    assert!(r3.attachment("note.txt").is_none());
}

/// Identical content across attachments shares one blob.
#[test]
fn test_blob_deduplication() {
    let (_dir, ds) = open_datastore();
    let engine = ds.engine();

    let make = |id: &str| {
        ds.create_document(
            Some(id.into()),
            body("{}"),
            vec![AttachmentInput::New {
                name: "same.bin".into(),
                content_type: None,
                data: b"shared bytes".to_vec(),
            }],
        )
        .unwrap()
    };
    let a = make("a");
    let b = make("b");

    assert_eq!(
        a.attachment("same.bin").unwrap().key,
        b.attachment("same.bin").unwrap().key
    );
    // One blob on disk, two attachment rows.
    let blob_dir = engine.blob_store().root();
    let files: Vec<_> = std::fs::read_dir(blob_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    assert_eq!(files.len(), 1);
}

/// Tombstones carry no attachments.
#[test]
fn test_tombstone_has_no_attachments() {
    let (_dir, ds) = open_datastore();
    let r1 = ds
        .create_document(
            Some("d".into()),
            body("{}"),
            vec![AttachmentInput::New {
                name: "x".into(),
                content_type: None,
                data: b"data".to_vec(),
            }],
        )
        .unwrap();
    let tombstone = ds.delete_document(&r1).unwrap();
    assert!(tombstone.attachments().is_empty());
}
