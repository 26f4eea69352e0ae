//! The per-edge record buffer sitting between a source `(node, port)` and
//! every downstream reader of it. Deduplicates by `idx`, enforces revision
//! monotonicity via a high-water mark that survives consumption, and
//! supports source-side deletion when a consumer declares an `idx` consumed.

use std::collections::{BTreeMap, HashMap};

use batchfactory_entry::Entry;

/// Holds currently-pending entries for one `(source_node, source_port)` plus
/// the highest `rev` ever accepted per `idx`, even after that entry has been
/// consumed. The high-water mark is what turns replayed work after a resume
/// into a no-op: a node re-emitting the same-or-lower generation of a record
/// it already pushed downstream is rejected here, not upstream.
#[derive(Debug, Default)]
pub struct EdgeBuffer {
    entries: BTreeMap<String, Entry>,
    high_water: HashMap<String, u64>,
}

impl EdgeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to write `entry`. Returns `true` if the write was accepted
    /// (either inserted fresh or overwrote an entry at an equal-or-lower
    /// rev), `false` if rejected as stale.
    ///
    /// - `rev` below the high-water mark: always rejected (a replay of work
    ///   that already made it downstream, or a regression).
    /// - `rev` equal to the high-water mark: accepted only while the idx is
    ///   still pending (equal-rev arrivals overwrite in emission order);
    ///   rejected if it was already consumed at that rev.
    /// - `rev` above the high-water mark: always accepted.
    pub fn update(&mut self, entry: Entry) -> bool {
        let hw = self.high_water.get(&entry.idx).copied();
        match hw {
            Some(h) if entry.rev < h => return false,
            Some(h) if entry.rev == h && !self.entries.contains_key(&entry.idx) => return false,
            _ => {}
        }
        self.high_water.insert(entry.idx.clone(), entry.rev.max(hw.unwrap_or(0)));
        self.entries.insert(entry.idx.clone(), entry);
        true
    }

    /// Source-side deletion: drop `idx` once a downstream consumer has
    /// declared it consumed. The high-water mark is left untouched so a
    /// later stale re-emission for the same idx is still rejected.
    pub fn consume(&mut self, idx: &str) {
        self.entries.remove(idx);
    }

    pub fn snapshot(&self) -> BTreeMap<String, Entry> {
        self.entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
