//! Blob keys
//!
//! A key identifying a data blob. This happens to be a SHA-1 digest.

use std::fmt;

use sha1::{Digest, Sha1};

use super::errors::{BlobStoreError, BlobStoreResult};

/// Length of a blob key in bytes.
pub const KEY_LENGTH: usize = 20;

/// SHA-1 digest addressing one blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey([u8; KEY_LENGTH]);

impl BlobKey {
    /// Computes the key for `data`.
    pub fn for_content(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        Self(digest.into())
    }

    /// Wraps raw digest bytes, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> BlobStoreResult<Self> {
        let arr: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| BlobStoreError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Parses a lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> BlobStoreResult<Self> {
        let bytes = hex::decode(s).map_err(|_| BlobStoreError::InvalidKeyLength(s.len()))?;
        Self::from_bytes(&bytes)
    }

    /// The raw digest bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// CouchDB-style digest string, `sha1-<base64>`.
    pub fn digest_string(&self) -> String {
        format!("sha1-{}", data_encoding::BASE64.encode(&self.0))
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({})", self.to_hex())
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
