use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use batchfactory_broker::{Broker, BrokerJob, EnqueueRequest, JobProcessor, JobStatus};
use batchfactory_entry::Entry;

use crate::callbacks::{
    BatchTransform, FailureBehavior, FinishJob, IsReadyForOutput, Merge, OutputSink,
    PrepareRequest, Predicate, Route, SideEffect, Transform,
};
use crate::{Op, PumpInputs, PumpOptions, PumpOutput};

/// Seeds a graph run. Emits its full seed set to port 0 exactly once per
/// `reload_inputs=true` pump (which the scheduler passes only on the first
/// iteration of a run); every other pump is a no-op.
pub struct InputOp {
    seeds: Vec<Entry>,
    fired: bool,
}

impl InputOp {
    pub fn new(seeds: Vec<Entry>) -> Self {
        Self {
            seeds,
            fired: false,
        }
    }

    /// Build an `InputOp` whose seed set comes from an external
    /// [`crate::InputSource`] collaborator rather than a fixed `Vec<Entry>`.
    pub fn from_source(source: &dyn crate::InputSource) -> Result<Self> {
        Ok(Self::new(source.load()?))
    }
}

impl Op for InputOp {
    fn n_in_ports(&self) -> usize {
        0
    }

    fn n_out_ports(&self) -> usize {
        1
    }

    fn barrier_level(&self) -> u32 {
        0
    }

    fn pump(&mut self, _inputs: PumpInputs, opts: &PumpOptions) -> Result<PumpOutput> {
        let mut out = PumpOutput::empty(1, 0);
        if opts.reload_inputs || !self.fired {
            for entry in &self.seeds {
                out.outputs[0].insert(entry.idx.clone(), entry.clone());
            }
            out.did_emit = !self.seeds.is_empty();
            self.fired = true;
        }
        Ok(out)
    }
}

/// One entry in, at most one entry out, driven by a [`Transform`].
pub struct AtomicOp {
    transform: Box<dyn Transform>,
}

impl AtomicOp {
    pub fn new(transform: Box<dyn Transform>) -> Self {
        Self { transform }
    }
}

impl Op for AtomicOp {
    fn n_in_ports(&self) -> usize {
        1
    }

    fn n_out_ports(&self) -> usize {
        1
    }

    fn barrier_level(&self) -> u32 {
        0
    }

    fn pump(&mut self, mut inputs: PumpInputs, _opts: &PumpOptions) -> Result<PumpOutput> {
        let mut out = PumpOutput::empty(1, 1);
        for (idx, entry) in inputs.remove(0) {
            if let Some(produced) = self.transform.transform(&entry)? {
                out.outputs[0].insert(produced.idx.clone(), produced);
                out.did_emit = true;
            }
            out.consumed[0].insert(idx);
        }
        Ok(out)
    }
}

/// Keeps or rejects entries via a [`Predicate`]. Rejected entries are either
/// dropped (`consume_rejected=true`) or routed to a diversion port 1.
pub struct FilterOp {
    predicate: Box<dyn Predicate>,
    consume_rejected: bool,
}

impl FilterOp {
    pub fn new(predicate: Box<dyn Predicate>, consume_rejected: bool) -> Self {
        Self {
            predicate,
            consume_rejected,
        }
    }
}

impl Op for FilterOp {
    fn n_in_ports(&self) -> usize {
        1
    }

    fn n_out_ports(&self) -> usize {
        if self.consume_rejected {
            1
        } else {
            2
        }
    }

    fn barrier_level(&self) -> u32 {
        0
    }

    fn pump(&mut self, mut inputs: PumpInputs, _opts: &PumpOptions) -> Result<PumpOutput> {
        let mut out = PumpOutput::empty(self.n_out_ports(), 1);
        for (idx, entry) in inputs.remove(0) {
            if self.predicate.test(&entry)? {
                out.outputs[0].insert(entry.idx.clone(), entry);
                out.did_emit = true;
            } else if !self.consume_rejected {
                out.outputs[1].insert(entry.idx.clone(), entry);
                out.did_emit = true;
            }
            out.consumed[0].insert(idx);
        }
        Ok(out)
    }
}

/// Sees the whole port-0 batch at once, driven by a [`BatchTransform`].
/// `consume_all_batch` decides whether inputs not present in the returned
/// batch are dropped (`true`, e.g. shuffle/take-first-N) or left for a later
/// pump (`false`, only emitted entries are consumed).
pub struct BatchOp {
    transform: Box<dyn BatchTransform>,
    consume_all_batch: bool,
}

impl BatchOp {
    pub fn new(transform: Box<dyn BatchTransform>, consume_all_batch: bool) -> Self {
        Self {
            transform,
            consume_all_batch,
        }
    }
}

impl Op for BatchOp {
    fn n_in_ports(&self) -> usize {
        1
    }

    fn n_out_ports(&self) -> usize {
        1
    }

    fn barrier_level(&self) -> u32 {
        1
    }

    fn pump(&mut self, mut inputs: PumpInputs, _opts: &PumpOptions) -> Result<PumpOutput> {
        let mut out = PumpOutput::empty(1, 1);
        let batch = inputs.remove(0);
        if batch.is_empty() {
            return Ok(out);
        }

        let entries: Vec<Entry> = batch.values().cloned().collect();
        let emitted = self.transform.transform_batch(&entries)?;
        let emitted_idxs: std::collections::BTreeSet<String> =
            emitted.iter().map(|e| e.idx.clone()).collect();

        for entry in emitted {
            out.outputs[0].insert(entry.idx.clone(), entry);
        }
        out.did_emit = !out.outputs[0].is_empty();

        if self.consume_all_batch {
            out.consumed[0] = batch.keys().cloned().collect();
        } else {
            out.consumed[0] = emitted_idxs;
        }

        Ok(out)
    }
}

/// Groups records across `n_in_ports` by `idx`, driven by a [`Merge`]
/// callback. `allow_missing=false` skips any `idx` not present on every port
/// this cycle.
pub struct MergeOp {
    merge: Box<dyn Merge>,
    n_in_ports: usize,
    allow_missing: bool,
}

impl MergeOp {
    pub fn new(merge: Box<dyn Merge>, n_in_ports: usize, allow_missing: bool) -> Self {
        Self {
            merge,
            n_in_ports,
            allow_missing,
        }
    }
}

impl Op for MergeOp {
    fn n_in_ports(&self) -> usize {
        self.n_in_ports
    }

    fn n_out_ports(&self) -> usize {
        1
    }

    fn barrier_level(&self) -> u32 {
        0
    }

    fn pump(&mut self, inputs: PumpInputs, _opts: &PumpOptions) -> Result<PumpOutput> {
        let mut out = PumpOutput::empty(1, self.n_in_ports);

        let mut candidate_idxs: std::collections::BTreeSet<String> = Default::default();
        for port in &inputs {
            candidate_idxs.extend(port.keys().cloned());
        }

        for idx in candidate_idxs {
            let per_port: Vec<Option<Entry>> =
                inputs.iter().map(|port| port.get(&idx).cloned()).collect();

            if !self.allow_missing && per_port.iter().any(Option::is_none) {
                continue;
            }

            if let Some(combined) = self.merge.merge(&per_port)? {
                out.outputs[0].insert(combined.idx.clone(), combined);
                out.did_emit = true;
                for (port_idx, present) in per_port.iter().enumerate() {
                    if present.is_some() {
                        out.consumed[port_idx].insert(idx.clone());
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Routes each port-0 entry to a sparse set of output ports via a [`Route`]
/// callback. The only node kind allowed more than one outgoing edge per
/// source port (see the fanout rule in `batchfactory-runtime`).
pub struct SplitOp {
    route: Box<dyn Route>,
    n_out_ports: usize,
}

impl SplitOp {
    pub fn new(route: Box<dyn Route>, n_out_ports: usize) -> Self {
        Self { route, n_out_ports }
    }
}

impl Op for SplitOp {
    fn n_in_ports(&self) -> usize {
        1
    }

    fn n_out_ports(&self) -> usize {
        self.n_out_ports
    }

    fn barrier_level(&self) -> u32 {
        0
    }

    fn pump(&mut self, mut inputs: PumpInputs, _opts: &PumpOptions) -> Result<PumpOutput> {
        let mut out = PumpOutput::empty(self.n_out_ports, 1);
        for (idx, entry) in inputs.remove(0) {
            let routed = self.route.route(&entry, self.n_out_ports)?;
            if !routed.is_empty() {
                out.did_emit = true;
                out.consumed[0].insert(idx);
            }
            for (port, routed_entry) in routed {
                out.outputs[port].insert(routed_entry.idx.clone(), routed_entry);
            }
        }
        Ok(out)
    }
}

/// Passes port-0 entries through unmodified while invoking a [`SideEffect`]
/// over the batch (print, persist). Always consumes.
pub struct OutputOp {
    side_effect: Box<dyn SideEffect>,
}

impl OutputOp {
    pub fn new(side_effect: Box<dyn SideEffect>) -> Self {
        Self { side_effect }
    }
}

impl Op for OutputOp {
    fn n_in_ports(&self) -> usize {
        1
    }

    fn n_out_ports(&self) -> usize {
        1
    }

    fn barrier_level(&self) -> u32 {
        0
    }

    fn pump(&mut self, mut inputs: PumpInputs, _opts: &PumpOptions) -> Result<PumpOutput> {
        let mut out = PumpOutput::empty(1, 1);
        let batch = inputs.remove(0);
        if batch.is_empty() {
            return Ok(out);
        }

        let entries: Vec<Entry> = batch.values().cloned().collect();
        self.side_effect.run(&entries)?;

        for (idx, entry) in batch {
            out.outputs[0].insert(idx.clone(), entry);
            out.consumed[0].insert(idx);
        }
        out.did_emit = true;
        Ok(out)
    }
}

/// Adapts an external [`crate::OutputSink`] collaborator (which needs `&mut
/// self` to write) into the immutable [`SideEffect`] callback an `OutputOp`
/// expects, via a mutex — the same interior-mutability posture the broker's
/// `CountingProcessor` test double uses for its call tally.
pub struct SinkSideEffect<S: OutputSink> {
    sink: std::sync::Mutex<S>,
}

impl<S: OutputSink> SinkSideEffect<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: std::sync::Mutex::new(sink),
        }
    }
}

impl<S: OutputSink> SideEffect for SinkSideEffect<S> {
    fn run(&self, entries: &[Entry]) -> Result<()> {
        self.sink
            .lock()
            .map_err(|_| anyhow::anyhow!("output sink mutex poisoned"))?
            .write(entries)
    }
}

/// Dispatches entries through a [`Broker`], bridging the scheduler's
/// synchronous `pump` call into the broker's async `process_jobs` via
/// `block_in_place` + `Handle::block_on` — the one suspension point in an
/// otherwise cooperative, single-threaded graph.
pub struct BrokerOp {
    broker: Broker,
    processor: Box<dyn JobProcessor>,
    prepare: Box<dyn PrepareRequest>,
    ready: Box<dyn IsReadyForOutput>,
    finish: Box<dyn FinishJob>,
    failure_behavior: FailureBehavior,
    process_opts: batchfactory_broker::ProcessJobsOptions,
    /// Original entries awaiting a terminal job, keyed by `job_idx` (the
    /// content hash of their prepared request) rather than by entry `idx`.
    /// Two entries that prepare identical requests land in the same bucket,
    /// so a single cached response resolves all of them — including an
    /// entry whose request was never itself the one that got enqueued,
    /// because another entry with the same content already had a terminal
    /// answer in the response ledger. Consumed from the edge buffer on
    /// arrival (stage a), but each entry must survive until `finish_job` can
    /// see it (stage c).
    pending: HashMap<String, Vec<Entry>>,
}

const ENTRY_IDX_META: &str = "entry_idx";
const ENTRY_REV_META: &str = "entry_rev";

impl BrokerOp {
    pub fn new(
        broker: Broker,
        processor: Box<dyn JobProcessor>,
        prepare: Box<dyn PrepareRequest>,
        ready: Box<dyn IsReadyForOutput>,
        finish: Box<dyn FinishJob>,
        failure_behavior: FailureBehavior,
        process_opts: batchfactory_broker::ProcessJobsOptions,
    ) -> Self {
        Self {
            broker,
            processor,
            prepare,
            ready,
            finish,
            failure_behavior,
            process_opts,
            pending: HashMap::new(),
        }
    }

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
    }
}

impl Op for BrokerOp {
    fn n_in_ports(&self) -> usize {
        1
    }

    fn n_out_ports(&self) -> usize {
        1
    }

    fn barrier_level(&self) -> u32 {
        2
    }

    fn pump(&mut self, mut inputs: PumpInputs, opts: &PumpOptions) -> Result<PumpOutput> {
        let mut out = PumpOutput::empty(1, 1);

        // Stage (a): enqueue fresh entries, then consume them from the edge
        // buffer. Each entry is kept alive in `pending`, bucketed by the
        // content hash of its own request, so stage (c) can still reach it
        // once a job with that hash is terminal — whether or not this
        // entry's own enqueue call was the one that actually created it.
        let mut fresh = Vec::new();
        for (idx, entry) in inputs.remove(0) {
            let request = self.prepare.prepare_request(&entry)?;
            let job_idx = batchfactory_config::content_hash(&request);
            let already_pending = self
                .pending
                .get(&job_idx)
                .map(|bucket| bucket.iter().any(|e| e.idx == entry.idx))
                .unwrap_or(false);
            if !already_pending {
                let mut meta = serde_json::Map::new();
                meta.insert(ENTRY_IDX_META.to_string(), entry.idx.clone().into());
                meta.insert(ENTRY_REV_META.to_string(), entry.rev.into());
                fresh.push(EnqueueRequest::with_meta(request, meta));
                self.pending.entry(job_idx).or_default().push(entry);
            }
            out.consumed[0].insert(idx);
        }
        if !fresh.is_empty() {
            self.broker.enqueue(fresh)?;
        }

        // Stage (b): dispatch, honored only when the scheduler has allowed
        // broker dispatch at this barrier level.
        if opts.dispatch_brokers {
            let allowed = match self.failure_behavior {
                FailureBehavior::Retry => {
                    let failed = self.broker.get_job_requests(&[JobStatus::Failed])?;
                    if !failed.is_empty() {
                        tracing::debug!(count = failed.len(), "retrying failed broker jobs");
                    }
                    for job in &failed {
                        self.broker.retry(&job.job_idx)?;
                    }
                    vec![JobStatus::Queued]
                }
                _ => vec![JobStatus::Queued],
            };
            let pending = self.broker.get_job_requests(&allowed)?;
            if !pending.is_empty() {
                let opts = self.process_opts.clone();
                let processor = self.processor.as_ref();
                let broker = &mut self.broker;
                Self::block_on(broker.process_jobs(pending, processor, &opts))?;
            }
        }

        // Stage (c): collect terminal jobs ready for output. Every entry
        // bucketed under a job's `job_idx` resolves together, so a cache hit
        // spanning entries from different pump calls (or different `BrokerOp`
        // instances sharing a cache directory) still reaches every waiter.
        let responses = self.broker.get_job_responses()?;
        let mut finished_job_idxs = Vec::new();
        for job in responses {
            if job.status == JobStatus::Failed && self.failure_behavior == FailureBehavior::Stay {
                continue;
            }
            if !self.ready.is_ready_for_output(&job) {
                continue;
            }
            let Some(bucket) = self.pending.get_mut(&job.job_idx) else {
                continue;
            };
            if bucket.is_empty() {
                continue;
            }

            let mut remaining = Vec::new();
            let mut resolved_any = false;
            for original in bucket.drain(..) {
                if let Some(emitted) = self.finish.finish_job(&original, &job)? {
                    out.outputs[0].insert(emitted.idx.clone(), emitted);
                    out.did_emit = true;
                    resolved_any = true;
                } else {
                    remaining.push(original);
                }
            }
            *bucket = remaining;
            if bucket.is_empty() {
                self.pending.remove(&job.job_idx);
            }
            if resolved_any {
                finished_job_idxs.push(job.job_idx.clone());
            }
        }
        if !finished_job_idxs.is_empty() {
            self.broker.dequeue(&finished_job_idxs)?;
        }

        Ok(out)
    }
}

/// Closed, tagged dispatch over every node kind. `batchfactory-runtime`'s
/// `Graph` stores a `Vec<Node>`; the scheduler never matches on anything
/// finer than this.
pub enum Node {
    Input(InputOp),
    Atomic(AtomicOp),
    Filter(FilterOp),
    Batch(BatchOp),
    Merge(MergeOp),
    Split(SplitOp),
    Output(OutputOp),
    Broker(BrokerOp),
}

impl Op for Node {
    fn n_in_ports(&self) -> usize {
        match self {
            Node::Input(n) => n.n_in_ports(),
            Node::Atomic(n) => n.n_in_ports(),
            Node::Filter(n) => n.n_in_ports(),
            Node::Batch(n) => n.n_in_ports(),
            Node::Merge(n) => n.n_in_ports(),
            Node::Split(n) => n.n_in_ports(),
            Node::Output(n) => n.n_in_ports(),
            Node::Broker(n) => n.n_in_ports(),
        }
    }

    fn n_out_ports(&self) -> usize {
        match self {
            Node::Input(n) => n.n_out_ports(),
            Node::Atomic(n) => n.n_out_ports(),
            Node::Filter(n) => n.n_out_ports(),
            Node::Batch(n) => n.n_out_ports(),
            Node::Merge(n) => n.n_out_ports(),
            Node::Split(n) => n.n_out_ports(),
            Node::Output(n) => n.n_out_ports(),
            Node::Broker(n) => n.n_out_ports(),
        }
    }

    fn barrier_level(&self) -> u32 {
        match self {
            Node::Input(n) => n.barrier_level(),
            Node::Atomic(n) => n.barrier_level(),
            Node::Filter(n) => n.barrier_level(),
            Node::Batch(n) => n.barrier_level(),
            Node::Merge(n) => n.barrier_level(),
            Node::Split(n) => n.barrier_level(),
            Node::Output(n) => n.barrier_level(),
            Node::Broker(n) => n.barrier_level(),
        }
    }

    fn pump(&mut self, inputs: PumpInputs, opts: &PumpOptions) -> Result<PumpOutput> {
        match self {
            Node::Input(n) => n.pump(inputs, opts),
            Node::Atomic(n) => n.pump(inputs, opts),
            Node::Filter(n) => n.pump(inputs, opts),
            Node::Batch(n) => n.pump(inputs, opts),
            Node::Merge(n) => n.pump(inputs, opts),
            Node::Split(n) => n.pump(inputs, opts),
            Node::Output(n) => n.pump(inputs, opts),
            Node::Broker(n) => n.pump(inputs, opts),
        }
    }
}
