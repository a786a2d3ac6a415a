//! Pending-sequences map
//!
//! Remote sequence IDs are opaque and revisions complete out of order, so
//! checkpointing needs a local total order. Each accepted change is given
//! a fake local sequence from a monotonic counter; the checkpointable
//! value is the remote sequence of the highest *contiguous* prefix of
//! completed fake sequences.
//!
//! Invariant: `checkpointed_value()` never moves backwards during a run.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

/// Tracks which pulled revisions have been durably inserted.
#[derive(Debug, Default)]
pub struct PendingSequences {
    next: u64,
    outstanding: BTreeSet<u64>,
    remote: BTreeMap<u64, Value>,
    completed_through: u64,
    checkpoint: Option<Value>,
}

impl PendingSequences {
    pub fn new() -> Self {
        Self {
            next: 1,
            ..Default::default()
        }
    }

    /// Registers a change at `remote_seq`, returning its fake local
    /// sequence.
    pub fn add(&mut self, remote_seq: Value) -> u64 {
        let fake = self.next;
        self.next += 1;
        self.outstanding.insert(fake);
        self.remote.insert(fake, remote_seq);
        fake
    }

    /// Marks a fake sequence complete, advancing the contiguous prefix as
    /// far as possible.
    pub fn remove(&mut self, fake: u64) {
        self.outstanding.remove(&fake);
        loop {
            let candidate = self.completed_through + 1;
            if candidate >= self.next || self.outstanding.contains(&candidate) {
                break;
            }
            self.completed_through = candidate;
            if let Some(seq) = self.remote.remove(&candidate) {
                self.checkpoint = Some(seq);
            }
        }
    }

    /// Number of sequences handed out but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// The remote sequence safe to checkpoint, if any prefix completed.
    pub fn checkpointed_value(&self) -> Option<&Value> {
        self.checkpoint.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(s: &str) -> Value {
        Value::String(s.to_string())
    }

    #[test]
    fn test_in_order_completion() {
        let mut pending = PendingSequences::new();
        let a = pending.add(seq("s1"));
        let b = pending.add(seq("s2"));

        pending.remove(a);
        assert_eq!(pending.checkpointed_value(), Some(&seq("s1")));
        pending.remove(b);
        assert_eq!(pending.checkpointed_value(), Some(&seq("s2")));
        assert_eq!(pending.outstanding(), 0);
    }

    #[test]
    fn test_out_of_order_completion_waits_for_prefix() {
        let mut pending = PendingSequences::new();
        let a = pending.add(seq("s1"));
        let b = pending.add(seq("s2"));
        let c = pending.add(seq("s3"));

        // s2 and s3 finish first; nothing checkpointable yet.
        pending.remove(b);
        pending.remove(c);
        assert_eq!(pending.checkpointed_value(), None);

        // The prefix closes and jumps straight to s3.
        pending.remove(a);
        assert_eq!(pending.checkpointed_value(), Some(&seq("s3")));
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let mut pending = PendingSequences::new();
        let fakes: Vec<u64> = (0..10).map(|i| pending.add(seq(&format!("s{i}")))).collect();

        let mut last: Option<String> = None;
        // Complete in a scrambled order; observed checkpoints only grow.
        for &fake in &[fakes[1], fakes[0], fakes[4], fakes[2], fakes[3], fakes[9]] {
            pending.remove(fake);
            if let Some(Value::String(cp)) = pending.checkpointed_value().cloned() {
                if let Some(prev) = &last {
                    assert!(cp.as_str() >= prev.as_str());
                }
                last = Some(cp);
            }
        }
        assert_eq!(last.as_deref(), Some("s4"));
    }

    #[test]
    fn test_opaque_sequence_shapes() {
        let mut pending = PendingSequences::new();
        let a = pending.add(serde_json::json!([5, "x"]));
        pending.remove(a);
        assert_eq!(
            pending.checkpointed_value(),
            Some(&serde_json::json!([5, "x"]))
        );
    }
}
