//! Content-addressed attachment blob store
//!
//! Blobs are arbitrary-size byte sequences addressed by the SHA-1 of their
//! content. On disk each blob is a file with an opaque random name; the
//! key-to-filename mapping lives in the `blob_filenames` table of the owning
//! database, which is the authoritative index. Orphan files on disk are
//! tolerated and removed by [`BlobStore::gc`].
//!
//! Large blobs arriving from the network are staged through a
//! [`BlobWriter`]: append chunks, `finish()` to seal the digests, then
//! `install()` inside a database transaction to make the blob visible.
//! A writer that is dropped without installing releases its temp file.

mod errors;
mod key;
mod reader;
mod store;
mod writer;

pub use errors::{BlobStoreError, BlobStoreResult};
pub use key::BlobKey;
pub use reader::BlobReader;
pub use store::BlobStore;
pub use writer::BlobWriter;
