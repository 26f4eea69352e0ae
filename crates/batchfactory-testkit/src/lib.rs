//! Shared fixtures for the `scenario_*.rs` integration tests: a disposable
//! on-disk cache directory and `EngineOptions` pointed at it, so a scenario
//! test gets a ready-wired cache and broker instead of reassembling one
//! engine's worth of plumbing itself.

use std::path::{Path, PathBuf};

use anyhow::Result;
use batchfactory_broker::Broker;
use batchfactory_config::EngineOptions;
use tempfile::TempDir;

/// A disposable directory backing one or more ledgers/brokers for a test,
/// plus `EngineOptions` already pointed at it. Dropping this removes the
/// directory and everything under it.
pub struct TestCache {
    dir: TempDir,
}

impl TestCache {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn subpath(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Open (or resume) a [`Broker`] rooted at `{cache}/{name}/`.
    pub fn broker(&self, name: &str) -> Result<Broker> {
        Broker::open(self.subpath(name))
    }

    /// `EngineOptions` with `cache_root` pointed at this directory and every
    /// other field left at its default (dispatch brokers, not mocked,
    /// reload inputs on the first pump).
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            cache_root: self.dir.path().to_path_buf(),
            ..Default::default()
        }
    }
}

/// A tiny deterministic PRNG (xorshift64*) for test fixtures that need a
/// seeded, reproducible shuffle without pulling in an external `rand`
/// dependency the engine itself has no other use for.
pub struct SeededRng(u64);

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Fisher-Yates shuffle, in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = (self.next_u64() as usize) % (i + 1);
            items.swap(i, j);
        }
    }
}
