//! Per-peer version vectors.
//!
//! Every tracked object carries a map of peer identification to a counter.
//! Missing keys count as zero everywhere, so `{A: 1}` and `{A: 1, B: 0}`
//! compare equal under `includes` in both directions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    counters: BTreeMap<String, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &str) -> u64 {
        self.counters.get(peer).copied().unwrap_or(0)
    }

    pub fn set(&mut self, peer: &str, value: u64) {
        self.counters.insert(peer.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counters.iter()
    }

    /// Greatest counter over all entries, 0 for the empty vector.
    pub fn max_value(&self) -> u64 {
        self.counters.values().copied().max().unwrap_or(0)
    }

    /// Record a local edit: `v[self] = max(v) + 1`.
    ///
    /// The successor is computed with a checked add; running a counter past
    /// its range is fatal for the object and surfaces as an error.
    pub fn increase(&mut self, self_id: &str) -> Result<()> {
        let next = self
            .max_value()
            .checked_add(1)
            .ok_or_else(|| Error::VersionOverflow(self_id.to_string()))?;
        self.counters.insert(self_id.to_string(), next);
        Ok(())
    }

    /// True iff `self[k] >= other[k]` for every key of `other`.
    pub fn includes(&self, other: &VersionVector) -> bool {
        other
            .counters
            .iter()
            .all(|(peer, value)| self.get(peer) >= *value)
    }

    /// Decide whether this (remote) vector may replace `local`.
    ///
    /// The remote wins iff its maximum is at least the local maximum and it
    /// has seen every edit the local peer made (`local[self] == remote[self]`).
    /// On success the returned winner is the remote vector itself, replacing
    /// the local one wholesale.
    pub fn valid(&self, local: &VersionVector, self_id: &str) -> (VersionVector, bool) {
        let ok = self.max_value() >= local.max_value() && local.get(self_id) == self.get(self_id);
        (self.clone(), ok)
    }

    /// Component-wise maximum. Used when rewriting vectors after conflict
    /// resolution, never during normal apply.
    pub fn merge(&mut self, other: &VersionVector) {
        for (peer, value) in &other.counters {
            let entry = self.counters.entry(peer.clone()).or_insert(0);
            *entry = (*entry).max(*value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(entries: &[(&str, u64)]) -> VersionVector {
        let mut v = VersionVector::new();
        for (peer, value) in entries {
            v.set(peer, *value);
        }
        v
    }

    #[test]
    fn empty_vector_max_is_zero() {
        assert_eq!(VersionVector::new().max_value(), 0);
    }

    #[test]
    fn increase_sets_max_plus_one() {
        let mut v = vector(&[("a", 1), ("b", 4)]);
        v.increase("a").unwrap();
        assert_eq!(v.get("a"), 5);
        assert_eq!(v.max_value(), 5);
    }

    #[test]
    fn increase_from_empty() {
        let mut v = VersionVector::new();
        v.increase("a").unwrap();
        assert_eq!(v.get("a"), 1);
    }

    #[test]
    fn increase_overflow_is_error() {
        let mut v = vector(&[("a", u64::MAX)]);
        assert!(matches!(v.increase("a"), Err(Error::VersionOverflow(_))));
    }

    #[test]
    fn includes_is_reflexive() {
        let v = vector(&[("a", 2), ("b", 1)]);
        assert!(v.includes(&v));
    }

    #[test]
    fn includes_treats_missing_keys_as_zero() {
        let v = vector(&[("a", 1)]);
        let w = vector(&[("a", 1), ("b", 0)]);
        assert!(v.includes(&w));
        assert!(w.includes(&v));
    }

    #[test]
    fn mutual_inclusion_of_equal_counters() {
        let v = vector(&[("a", 2), ("b", 1)]);
        let w = vector(&[("b", 1), ("a", 2)]);
        assert!(v.includes(&w) && w.includes(&v));
        assert_eq!(v, w);
    }

    #[test]
    fn concurrent_vectors_include_neither_way() {
        // The two-peer concurrent-modify shape: {A:2} vs {A:1, B:1}.
        let a = vector(&[("a", 2)]);
        let b = vector(&[("a", 1), ("b", 1)]);
        assert!(!a.includes(&b));
        assert!(!b.includes(&a));
    }

    #[test]
    fn valid_accepts_dominating_remote() {
        let local = vector(&[("a", 1)]);
        let remote = vector(&[("a", 1), ("b", 2)]);
        let (winner, ok) = remote.valid(&local, "a");
        assert!(ok);
        assert_eq!(winner, remote);
    }

    #[test]
    fn valid_rejects_remote_missing_local_edits() {
        // Local peer "b" made an edit the remote has not seen.
        let local = vector(&[("a", 1), ("b", 2)]);
        let remote = vector(&[("a", 2)]);
        let (_, ok) = remote.valid(&local, "b");
        assert!(!ok);
    }

    #[test]
    fn valid_rejects_lower_maximum() {
        let local = vector(&[("a", 3)]);
        let remote = vector(&[("b", 1)]);
        let (_, ok) = remote.valid(&local, "c");
        assert!(!ok);
    }

    #[test]
    fn merge_takes_component_maximum() {
        let mut v = vector(&[("a", 2), ("b", 1)]);
        v.merge(&vector(&[("a", 1), ("b", 3), ("c", 1)]));
        assert_eq!(v, vector(&[("a", 2), ("b", 3), ("c", 1)]));
    }

    #[test]
    fn serde_round_trip() {
        let v = vector(&[("aabb", 3), ("ccdd", 1)]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"aabb":3,"ccdd":1}"#);
        let back: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
