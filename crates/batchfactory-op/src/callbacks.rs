//! User-supplied callbacks, one small named trait per node kind. These are
//! trait objects (`Box<dyn Transform>`, etc.), not closures, so a pipeline's
//! building blocks can be named, composed, and unit-tested on their own —
//! the same posture as a strategy registered with a host rather than passed
//! as an anonymous function.

use anyhow::Result;
use batchfactory_broker::BrokerJob;
use batchfactory_entry::Entry;
use serde_json::Value;
use std::collections::BTreeMap;

/// `AtomicOp`: one entry in, at most one entry out.
pub trait Transform: Send + Sync {
    fn transform(&self, entry: &Entry) -> Result<Option<Entry>>;
}

/// `FilterOp`: keep or reject an entry.
pub trait Predicate: Send + Sync {
    fn test(&self, entry: &Entry) -> Result<bool>;
}

/// `BatchOp`: sees the whole port-0 batch at once. Returns the entries to
/// emit; which *inputs* get consumed is governed separately by
/// `BatchOp::consume_all_batch`.
pub trait BatchTransform: Send + Sync {
    fn transform_batch(&self, entries: &[Entry]) -> Result<Vec<Entry>>;
}

/// `MergeOp`: combine one entry per port (absent ports are `None`) into a
/// single combined entry, or drop the group.
pub trait Merge: Send + Sync {
    fn merge(&self, inputs: &[Option<Entry>]) -> Result<Option<Entry>>;
}

/// `SplitOp`: route one entry to a sparse set of output ports.
pub trait Route: Send + Sync {
    fn route(&self, entry: &Entry, n_out_ports: usize) -> Result<BTreeMap<usize, Entry>>;
}

/// `OutputOp`: observe a batch for a side effect (print, persist); entries
/// pass through unmodified.
pub trait SideEffect: Send + Sync {
    fn run(&self, entries: &[Entry]) -> Result<()>;
}

/// `BrokerOp`, stage one: build the opaque request payload for a fresh
/// entry about to be enqueued.
pub trait PrepareRequest: Send + Sync {
    fn prepare_request(&self, entry: &Entry) -> Result<Value>;
}

/// `BrokerOp`, stage two: decide whether a broker job (of any status) is
/// ready to be turned back into output. The default the engine uses is
/// "status is Done", but a node may want to wait on additional conditions.
pub trait IsReadyForOutput: Send + Sync {
    fn is_ready_for_output(&self, job: &BrokerJob) -> bool {
        job.status == batchfactory_broker::JobStatus::Done
    }
}

/// `BrokerOp`, stage three: combine the original entry with a terminal job
/// into the entry to emit, or drop it.
pub trait FinishJob: Send + Sync {
    fn finish_job(&self, entry: &Entry, job: &BrokerJob) -> Result<Option<Entry>>;
}

/// External collaborator: yields the seed set for an `InputOp`. Out of
/// scope for this crate beyond the seam — concrete sources (file readers,
/// DB cursors, upstream pipeline outputs) are the caller's concern.
pub trait InputSource: Send + Sync {
    fn load(&self) -> Result<Vec<Entry>>;
}

/// External collaborator: receives an `OutputOp`'s batch each call and must
/// be idempotent under replay (the same batch may be observed again after a
/// resume). Concrete sinks (the on-disk JSONL record-file writer named in
/// the purpose/scope out-of-scope list) are not implemented in this crate.
pub trait OutputSink: Send + Sync {
    fn write(&mut self, batch: &[Entry]) -> Result<()>;
}

/// What a `BrokerOp` does with an entry whose job came back `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBehavior {
    /// Leave the job in the request ledger as-is; never emitted.
    Stay,
    /// Re-enqueue the request under a fresh revision.
    Retry,
    /// Emit the entry anyway, carrying the failure in its data.
    Emit,
}
