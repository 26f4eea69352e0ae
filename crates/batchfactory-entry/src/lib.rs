//! The unit record that flows through a batchfactory graph: a stable identity,
//! a monotonic revision, and an open-keyed JSON payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single record flowing between nodes.
///
/// `idx` is a stable identity assigned by the op that creates the entry
/// (typically a content hash or a monotonic counter). `rev` must be
/// non-decreasing for a given `idx` along any path through the graph —
/// the edge buffer enforces this by rejecting lower-or-equal-rev
/// re-emissions (see [`Entry::supersedes`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub idx: String,
    pub rev: u64,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Entry {
    pub fn new(idx: impl Into<String>, rev: u64) -> Self {
        Self {
            idx: idx.into(),
            rev,
            data: Map::new(),
        }
    }

    pub fn with_data(idx: impl Into<String>, rev: u64, data: Map<String, Value>) -> Self {
        Self {
            idx: idx.into(),
            rev,
            data,
        }
    }

    /// Returns `true` if `self` should replace `incumbent` in an edge buffer:
    /// strictly higher rev always wins; equal rev overwrites in emission
    /// order (last writer wins).
    pub fn supersedes(&self, incumbent: &Entry) -> bool {
        debug_assert_eq!(self.idx, incumbent.idx, "supersedes compares same idx only");
        self.rev >= incumbent.rev
    }

    /// Returns a copy with `data` replaced and `rev` bumped by one.
    /// Convenience for user transforms that produce "a new generation" of a
    /// record (loop iterations, retries).
    pub fn next_rev(&self, data: Map<String, Value>) -> Self {
        Self {
            idx: self.idx.clone(),
            rev: self.rev + 1,
            data,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_rev_supersedes() {
        let a = Entry::new("x", 0);
        let b = Entry::new("x", 1);
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
    }

    #[test]
    fn equal_rev_overwrites_in_emission_order() {
        let a = Entry::new("x", 3);
        let b = Entry::new("x", 3);
        assert!(b.supersedes(&a));
    }

    #[test]
    fn next_rev_bumps_revision_and_keeps_idx() {
        let a = Entry::new("x", 0);
        let mut data = Map::new();
        data.insert("n".into(), Value::from(2));
        let b = a.next_rev(data);
        assert_eq!(b.idx, "x");
        assert_eq!(b.rev, 1);
        assert_eq!(b.get("n"), Some(&Value::from(2)));
    }
}
