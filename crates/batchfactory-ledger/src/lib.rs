//! An append-only, resumable `idx -> Entry` store.
//!
//! Physically a line-oriented JSON record log (one [`Entry`] per line) plus
//! an optional compaction pass that rewrites the log to exactly the current
//! live set. A ledger is owned by exactly one node; concurrent writers to the
//! same path are unsupported (advisory only, not file-locked).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use batchfactory_entry::Entry;

const LEDGER_VERSION: u64 = 1;
const VERSION_KEY: &str = "batchfactory_ledger_version";

/// A resumable, append-only key-value store keyed by [`Entry::idx`].
pub struct Ledger {
    path: PathBuf,
    /// Keep every `(idx, rev)` pair around, not just the latest per idx.
    /// Broker ledgers run with this off; callers that need full history
    /// (e.g. auditing every retry) turn it on.
    keep_all_rev: bool,
    latest: HashMap<String, Entry>,
    all_revs: HashMap<(String, u64), Entry>,
}

impl Ledger {
    /// Create or load the ledger at `path`. Scans the log and discards any
    /// trailing partial record left by a crash mid-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, false)
    }

    pub fn open_with(path: impl AsRef<Path>, keep_all_rev: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create_dir_all {}", parent.display()))?;
            }
        }

        let mut ledger = Self {
            path: path.clone(),
            keep_all_rev,
            latest: HashMap::new(),
            all_revs: HashMap::new(),
        };

        if path.exists() {
            ledger.reload()?;
        } else {
            File::create(&path).with_context(|| format!("create ledger {}", path.display()))?;
        }

        Ok(ledger)
    }

    /// Reconstruct in-memory state by replaying the log from scratch,
    /// truncating any trailing partial record.
    fn reload(&mut self) -> Result<()> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("read ledger {}", self.path.display()))?;

        self.latest.clear();
        self.all_revs.clear();

        let mut valid_bytes = 0usize;
        let mut offset = 0usize;
        for raw_line in content.split_inclusive('\n') {
            let trimmed = raw_line.trim_end_matches(['\n', '\r']);
            offset += raw_line.len();
            if trimmed.is_empty() {
                valid_bytes = offset;
                continue;
            }

            let value: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        "discarding trailing partial ledger record"
                    );
                    break;
                }
            };

            if value.get(VERSION_KEY).is_some() {
                valid_bytes = offset;
                continue;
            }

            let entry: Entry = match serde_json::from_value(value) {
                Ok(e) => e,
                Err(_) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        "discarding trailing partial ledger record"
                    );
                    break;
                }
            };

            self.absorb(entry);
            valid_bytes = offset;
        }

        if valid_bytes < content.len() {
            let file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .with_context(|| format!("truncate ledger {}", self.path.display()))?;
            file.set_len(valid_bytes as u64)
                .with_context(|| format!("truncate ledger {}", self.path.display()))?;
        }

        Ok(())
    }

    /// Merge one record into in-memory state: last-writer-by-rev wins.
    fn absorb(&mut self, entry: Entry) {
        if self.keep_all_rev {
            self.all_revs
                .insert((entry.idx.clone(), entry.rev), entry.clone());
        }
        match self.latest.get(&entry.idx) {
            Some(incumbent) if !entry.supersedes(incumbent) => {}
            _ => {
                self.latest.insert(entry.idx.clone(), entry);
            }
        }
    }

    pub fn contains(&self, idx: &str, rev: Option<u64>) -> bool {
        match rev {
            None => self.latest.contains_key(idx),
            Some(r) if self.keep_all_rev => self.all_revs.contains_key(&(idx.to_string(), r)),
            Some(r) => self.latest.get(idx).map(|e| e.rev == r).unwrap_or(false),
        }
    }

    pub fn get(&self, idx: &str, rev: Option<u64>) -> Option<Entry> {
        match rev {
            None => self.latest.get(idx).cloned(),
            Some(r) if self.keep_all_rev => self.all_revs.get(&(idx.to_string(), r)).cloned(),
            Some(r) => self.latest.get(idx).filter(|e| e.rev == r).cloned(),
        }
    }

    /// Append new records. The in-memory map is updated last-writer-wins by
    /// `(idx, rev)`; already-written lines from a failed batch remain valid
    /// on reopen, since failure aborts before writing the rest.
    pub fn append(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;

        for entry in entries {
            let line = serde_json::to_string(entry).context("serialize ledger entry")?;
            file.write_all(line.as_bytes())
                .context("write ledger record")?;
            file.write_all(b"\n").context("write ledger newline")?;
            self.absorb(entry.clone());
        }

        Ok(())
    }

    /// Semantic replace: append the new generation of each record, then
    /// optionally trigger compaction.
    pub fn update(&mut self, entries: &[Entry], compact: bool) -> Result<()> {
        self.append(entries)?;
        if compact {
            self.compact()?;
        }
        Ok(())
    }

    /// All current records passing `predicate`, ordered by `idx` for a
    /// deterministic snapshot.
    pub fn filter(&self, predicate: impl Fn(&Entry) -> bool) -> Vec<Entry> {
        let mut out: Vec<Entry> = self.latest.values().filter(|e| predicate(e)).cloned().collect();
        out.sort_by(|a, b| a.idx.cmp(&b.idx));
        out
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Rewrite the log to contain exactly the current live set. Writes to a
    /// sidecar file and atomically renames over the original path, so a
    /// crash mid-compaction leaves the original log untouched.
    pub fn compact(&mut self) -> Result<()> {
        let sidecar = sidecar_path(&self.path);

        {
            let mut file = File::create(&sidecar)
                .with_context(|| format!("create compaction sidecar {}", sidecar.display()))?;
            writeln!(file, "{{\"{VERSION_KEY}\":{LEDGER_VERSION}}}")
                .context("write ledger version header")?;

            let mut entries: Vec<&Entry> = if self.keep_all_rev {
                self.all_revs.values().collect()
            } else {
                self.latest.values().collect()
            };
            entries.sort_by(|a, b| (a.idx.as_str(), a.rev).cmp(&(b.idx.as_str(), b.rev)));

            for entry in entries {
                let line = serde_json::to_string(entry).context("serialize ledger entry")?;
                file.write_all(line.as_bytes())
                    .context("write compacted record")?;
                file.write_all(b"\n").context("write compacted newline")?;
            }
            file.flush().context("flush compaction sidecar")?;
        }

        fs::rename(&sidecar, &self.path).with_context(|| {
            format!(
                "rename compaction sidecar {} -> {}",
                sidecar.display(),
                self.path.display()
            )
        })?;

        tracing::debug!(path = %self.path.display(), live = self.latest.len(), "ledger compacted");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconstruct in-memory state from disk, discarding any trailing
    /// partial record. Used after reopening a ledger whose file may have
    /// changed since it was first opened (e.g. a fresh `Broker::resume`).
    pub fn resume(&mut self) -> Result<()> {
        self.reload()
    }

    /// Remove records by `idx` from the live set and persist the removal by
    /// immediately compacting. Used by the broker to drop a job from its
    /// request ledger once the owning op has consumed its terminal response.
    pub fn remove(&mut self, idxs: &[String]) -> Result<()> {
        let mut removed_any = false;
        for idx in idxs {
            if self.latest.remove(idx).is_some() {
                removed_any = true;
            }
            if self.keep_all_rev {
                self.all_revs.retain(|(i, _), _| i != idx);
            }
        }
        if removed_any {
            self.compact()?;
        }
        Ok(())
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".compact.tmp");
    PathBuf::from(os)
}

/// Count complete (non-header) lines in a ledger file without opening it as
/// a [`Ledger`]. Used by tests that want to assert on raw on-disk shape.
pub fn count_lines(path: impl AsRef<Path>) -> Result<usize> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("open {}", path.as_ref().display()))?;
    let reader = BufReader::new(file);
    let mut n = 0;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)?;
        if value.get(VERSION_KEY).is_some() {
            continue;
        }
        n += 1;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(idx: &str, rev: u64, n: i64) -> Entry {
        let mut e = Entry::new(idx, rev);
        e.set("n", n);
        e
    }

    #[test]
    fn round_trip_append_then_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&[entry("a", 0, 1)]).unwrap();
        drop(ledger);

        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.get("a", None), Some(entry("a", 0, 1)));
    }

    #[test]
    fn higher_rev_overwrites_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();

        ledger.append(&[entry("a", 0, 1)]).unwrap();
        ledger.append(&[entry("a", 1, 2)]).unwrap();

        assert_eq!(ledger.get("a", None).unwrap().rev, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn stale_rev_append_does_not_regress_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();

        ledger.append(&[entry("a", 5, 1)]).unwrap();
        ledger.append(&[entry("a", 2, 99)]).unwrap();

        assert_eq!(ledger.get("a", None).unwrap().rev, 5);
    }

    #[test]
    fn crash_safety_discards_trailing_partial_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        {
            let mut ledger = Ledger::open(&path).unwrap();
            ledger.append(&[entry("a", 0, 1)]).unwrap();
        }

        // Simulate a crash mid-write: append a truncated JSON line with no newline.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"idx\":\"b\",\"rev\":0,\"da").unwrap();
        drop(file);

        let reopened = Ledger::open(&path).unwrap();
        assert!(reopened.contains("a", None));
        assert!(!reopened.contains("b", None));

        // The next append must not be corrupted by leftover partial bytes.
        let mut reopened = reopened;
        reopened.append(&[entry("b", 0, 2)]).unwrap();
        drop(reopened);
        let again = Ledger::open(&path).unwrap();
        assert_eq!(again.get("b", None).unwrap().get("n"), Some(&Value::from(2)));
    }

    #[test]
    fn compact_rewrites_log_to_live_set_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();

        ledger.append(&[entry("a", 0, 1)]).unwrap();
        ledger.append(&[entry("a", 1, 2)]).unwrap();
        ledger.append(&[entry("b", 0, 3)]).unwrap();
        assert_eq!(count_lines(&path).unwrap(), 3);

        ledger.compact().unwrap();
        assert_eq!(count_lines(&path).unwrap(), 2);

        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.get("a", None).unwrap().rev, 1);
        assert_eq!(reopened.get("b", None).unwrap().rev, 0);
    }

    #[test]
    fn filter_returns_matching_records_sorted_by_idx() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();
        ledger
            .append(&[entry("b", 0, 10), entry("a", 0, 20), entry("c", 0, 5)])
            .unwrap();

        let matches = ledger.filter(|e| e.get("n").and_then(|v| v.as_i64()).unwrap_or(0) >= 10);
        let idxs: Vec<&str> = matches.iter().map(|e| e.idx.as_str()).collect();
        assert_eq!(idxs, vec!["a", "b"]);
    }

    #[test]
    fn remove_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&[entry("a", 0, 1), entry("b", 0, 2)]).unwrap();

        ledger.remove(&["a".to_string()]).unwrap();
        assert!(!ledger.contains("a", None));
        assert!(ledger.contains("b", None));

        let reopened = Ledger::open(&path).unwrap();
        assert!(!reopened.contains("a", None));
        assert!(reopened.contains("b", None));
    }

    #[test]
    fn keep_all_rev_preserves_every_revision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = Ledger::open_with(&path, true).unwrap();

        ledger.append(&[entry("a", 0, 1)]).unwrap();
        ledger.append(&[entry("a", 1, 2)]).unwrap();

        assert_eq!(ledger.get("a", Some(0)).unwrap().get("n"), Some(&Value::from(1)));
        assert_eq!(ledger.get("a", Some(1)).unwrap().get("n"), Some(&Value::from(2)));
        assert_eq!(ledger.get("a", None).unwrap().rev, 1);
    }
}
