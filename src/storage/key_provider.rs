//! At-rest encryption key seam
//!
//! The engine never handles cipher machinery itself; a platform adapter
//! supplies the key through this trait. The engine keeps only a
//! fingerprint of the key, used to reject re-opening a live store under a
//! different key. Key material is never persisted.

use sha2::{Digest, Sha256};

/// Supplies the key that protects blobs and the database at rest.
///
/// Returning `None` leaves the store in plaintext.
pub trait KeyProvider: Send + Sync {
    fn encryption_key(&self) -> Option<[u8; 32]>;
}

/// The plaintext provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl KeyProvider for NoEncryption {
    fn encryption_key(&self) -> Option<[u8; 32]> {
        None
    }
}

/// A fixed in-memory key, for callers that manage key storage themselves.
#[derive(Clone)]
pub struct FixedKey(pub [u8; 32]);

impl KeyProvider for FixedKey {
    fn encryption_key(&self) -> Option<[u8; 32]> {
        Some(self.0)
    }
}

/// Identity of a provider's key: a SHA-256 over the key bytes, or `None`
/// for plaintext. Safe to hold in memory and compare; useless to an
/// attacker.
pub fn key_fingerprint(provider: &dyn KeyProvider) -> Option<[u8; 32]> {
    provider
        .encryption_key()
        .map(|key| Sha256::digest(key).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_has_no_fingerprint() {
        assert_eq!(key_fingerprint(&NoEncryption), None);
    }

    #[test]
    fn test_fingerprint_identifies_key() {
        let a = key_fingerprint(&FixedKey([1; 32]));
        let b = key_fingerprint(&FixedKey([1; 32]));
        let c = key_fingerprint(&FixedKey([2; 32]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_some());
        // The fingerprint is not the key itself.
        assert_ne!(a.unwrap(), [1; 32]);
    }
}
