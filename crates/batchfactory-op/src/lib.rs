//! The node taxonomy: six-plus-one op kinds reduced to one uniform `pump`
//! contract. A [`Node`] is a closed, tagged enum over the kinds below,
//! dispatched through a single `match` in [`Op::pump`] — no inheritance
//! hierarchy, no trait objects for the node kinds themselves (only for the
//! small user-supplied callbacks each kind wraps).

mod callbacks;
mod nodes;

pub use callbacks::{
    BatchTransform, FailureBehavior, FinishJob, InputSource, IsReadyForOutput, Merge,
    OutputSink, PrepareRequest, Predicate, Route, SideEffect, Transform,
};
pub use nodes::{
    AtomicOp, BatchOp, BrokerOp, FilterOp, InputOp, MergeOp, Node, OutputOp, SinkSideEffect,
    SplitOp,
};

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use batchfactory_entry::Entry;

/// Engine-facing knobs threaded down into every `pump` call, unchanged
/// across one `Scheduler::execute` run except for `reload_inputs`, which the
/// scheduler clears after the first iteration.
pub type PumpOptions = batchfactory_config::EngineOptions;

/// Per-port snapshots of the entries waiting on a node's input edges, deep
/// cloned by the scheduler so node callbacks cannot observe or mutate the
/// shared edge buffers directly.
pub type PumpInputs = Vec<BTreeMap<String, Entry>>;

/// What one `pump` call produced: per-port emissions, per-port consumption
/// (by `idx`, into the *input* buffers this node just read from), and
/// whether anything was emitted at all this call.
#[derive(Debug, Default)]
pub struct PumpOutput {
    pub outputs: Vec<BTreeMap<String, Entry>>,
    pub consumed: Vec<BTreeSet<String>>,
    pub did_emit: bool,
}

impl PumpOutput {
    pub fn empty(n_out_ports: usize, n_in_ports: usize) -> Self {
        Self {
            outputs: vec![BTreeMap::new(); n_out_ports],
            consumed: vec![BTreeSet::new(); n_in_ports],
            did_emit: false,
        }
    }
}

/// The uniform contract every node kind satisfies. `barrier_level` is fixed
/// for the lifetime of a node; the scheduler groups nodes by it and drains
/// lower levels to quiescence before a higher one may run (see
/// `batchfactory-runtime`).
pub trait Op {
    fn n_in_ports(&self) -> usize;
    fn n_out_ports(&self) -> usize;
    fn barrier_level(&self) -> u32;
    fn pump(&mut self, inputs: PumpInputs, opts: &PumpOptions) -> Result<PumpOutput>;
}
