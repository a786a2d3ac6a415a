//! Revision identifiers
//!
//! A revision ID is a string `<generation>-<suffix>`. The generation is a
//! positive integer; the suffix is an opaque token, typically a digest of
//! the parent suffix and the revision body so that peers generating the same
//! edit arrive at the same ID.
//!
//! Ordering: higher generation wins; on equal generations the suffixes are
//! compared lexicographically. The winner of a set of sibling revisions is
//! the maximum under this ordering.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};

use super::document::Body;
use super::errors::{RevisionError, RevisionResult};

/// A parsed revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    generation: u64,
    suffix: String,
}

impl RevisionId {
    /// Creates a revision ID from its parts.
    ///
    /// The generation must be positive and the suffix non-empty.
    pub fn new(generation: u64, suffix: impl Into<String>) -> RevisionResult<Self> {
        let suffix = suffix.into();
        if generation == 0 || suffix.is_empty() {
            return Err(RevisionError::InvalidRevisionId(format!(
                "{}-{}",
                generation, suffix
            )));
        }
        Ok(Self { generation, suffix })
    }

    /// Returns the generation component.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the suffix component.
    #[inline]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Computes the ID of a first-generation revision for `body`.
    pub fn first(deleted: bool, body: &Body) -> Self {
        Self {
            generation: 1,
            suffix: digest_suffix(None, deleted, body),
        }
    }

    /// Computes the ID of a child of `self` carrying `body`.
    ///
    /// The suffix is an MD5 digest over the parent suffix, the deletion
    /// marker and the canonical body serialization, so two peers making the
    /// same edit on the same parent produce the same revision ID.
    pub fn child(&self, deleted: bool, body: &Body) -> Self {
        Self {
            generation: self.generation + 1,
            suffix: digest_suffix(Some(self), deleted, body),
        }
    }
}

fn digest_suffix(parent: Option<&RevisionId>, deleted: bool, body: &Body) -> String {
    let mut hasher = Md5::new();
    if let Some(parent) = parent {
        hasher.update(parent.suffix.as_bytes());
    }
    hasher.update(if deleted { b"1" } else { b"0" });
    // serde_json maps serialize with sorted keys, so this is canonical.
    if let Ok(bytes) = serde_json::to_vec(body) {
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize())
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.suffix)
    }
}

impl FromStr for RevisionId {
    type Err = RevisionError;

    /// Splits on the first `-`. Everything after it is the opaque suffix.
    fn from_str(s: &str) -> RevisionResult<Self> {
        let (gen_str, suffix) = s
            .split_once('-')
            .ok_or_else(|| RevisionError::InvalidRevisionId(s.to_string()))?;
        let generation: u64 = gen_str
            .parse()
            .map_err(|_| RevisionError::InvalidRevisionId(s.to_string()))?;
        if generation == 0 || suffix.is_empty() {
            return Err(RevisionError::InvalidRevisionId(s.to_string()));
        }
        Ok(Self {
            generation,
            suffix: suffix.to_string(),
        })
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.suffix.cmp(&other.suffix))
    }
}

/// Total ordering over raw revision ID strings.
///
/// Used as a SQLite collation, so it must accept any string. Strings that do
/// not parse as revision IDs sort before ones that do, falling back to plain
/// string comparison among themselves.
pub fn collate_rev_ids(a: &str, b: &str) -> Ordering {
    match (RevisionId::from_str(a), RevisionId::from_str(b)) {
        (Ok(ra), Ok(rb)) => ra.cmp(&rb),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: &str) -> Body {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_roundtrip() {
        let rev: RevisionId = "3-deadbeef".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.suffix(), "deadbeef");
        assert_eq!(rev.to_string(), "3-deadbeef");
    }

    #[test]
    fn test_parse_splits_on_first_dash() {
        let rev: RevisionId = "2-abc-def".parse().unwrap();
        assert_eq!(rev.generation(), 2);
        assert_eq!(rev.suffix(), "abc-def");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<RevisionId>().is_err());
        assert!("abc".parse::<RevisionId>().is_err());
        assert!("0-abc".parse::<RevisionId>().is_err());
        assert!("1-".parse::<RevisionId>().is_err());
        assert!("-abc".parse::<RevisionId>().is_err());
        assert!("x-abc".parse::<RevisionId>().is_err());
    }

    #[test]
    fn test_generation_dominates_ordering() {
        let r2: RevisionId = "2-aaa".parse().unwrap();
        let r10: RevisionId = "10-aaa".parse().unwrap();
        assert!(r10 > r2);
    }

    #[test]
    fn test_suffix_breaks_ties() {
        let a: RevisionId = "1-abc".parse().unwrap();
        let b: RevisionId = "1-abd".parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_child_increments_generation() {
        let parent = RevisionId::first(false, &body(r#"{"a":1}"#));
        assert_eq!(parent.generation(), 1);
        let child = parent.child(false, &body(r#"{"a":2}"#));
        assert_eq!(child.generation(), 2);
    }

    #[test]
    fn test_suffix_is_deterministic() {
        let b = body(r#"{"a":1,"b":[1,2,3]}"#);
        let r1 = RevisionId::first(false, &b);
        let r2 = RevisionId::first(false, &b);
        assert_eq!(r1, r2);

        let c1 = r1.child(false, &body(r#"{"a":2}"#));
        let c2 = r2.child(false, &body(r#"{"a":2}"#));
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_suffix_depends_on_deletion() {
        let b = body(r#"{"a":1}"#);
        assert_ne!(RevisionId::first(false, &b), RevisionId::first(true, &b));
    }

    #[test]
    fn test_collation_total_over_garbage() {
        assert_eq!(collate_rev_ids("1-a", "1-a"), Ordering::Equal);
        assert_eq!(collate_rev_ids("2-a", "10-a"), Ordering::Less);
        assert_eq!(collate_rev_ids("not-a-rev", "1-a"), Ordering::Less);
        assert_eq!(collate_rev_ids("1-a", "bogus"), Ordering::Greater);
    }
}
