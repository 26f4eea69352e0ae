//! A cache-backed asynchronous job queue: the thing a `BrokerOp` dispatches
//! expensive external work (LLM calls, search queries, human labeling)
//! through. Two ledgers back it — one for in-flight requests, one for
//! terminal responses — so that two entries whose request content hashes to
//! the same `job_idx` share a single underlying call.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use batchfactory_config::content_hash;
use batchfactory_entry::Entry;
use batchfactory_ledger::Ledger;

/// Where a job sits in its lifecycle. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// A request/response pair tracked by a [`Broker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerJob {
    pub job_idx: String,
    pub rev: u64,
    pub status: JobStatus,
    pub request: Value,
    pub response: Option<Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl BrokerJob {
    fn to_entry(&self) -> Entry {
        let mut data = Map::new();
        data.insert(
            "status".to_string(),
            serde_json::to_value(self.status).expect("JobStatus always serializes"),
        );
        data.insert("request".to_string(), self.request.clone());
        if let Some(resp) = &self.response {
            data.insert("response".to_string(), resp.clone());
        }
        data.insert("meta".to_string(), Value::Object(self.meta.clone()));
        Entry::with_data(self.job_idx.clone(), self.rev, data)
    }

    fn from_entry(entry: &Entry) -> Result<Self> {
        let status: JobStatus = entry
            .get("status")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("parse job status")?
            .context("broker ledger record missing status")?;
        let request = entry
            .get("request")
            .cloned()
            .context("broker ledger record missing request")?;
        let response = entry.get("response").cloned();
        let meta = entry
            .get("meta")
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        Ok(Self {
            job_idx: entry.idx.clone(),
            rev: entry.rev,
            status,
            request,
            response,
            meta,
        })
    }
}

/// A request about to be enqueued, with the caller-supplied metadata the
/// owning op needs to map a terminal response back to an `Entry`
/// (conventionally `entry_idx` / `entry_rev`).
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub request: Value,
    pub meta: Map<String, Value>,
}

impl EnqueueRequest {
    pub fn new(request: Value) -> Self {
        Self {
            request,
            meta: Map::new(),
        }
    }

    pub fn with_meta(request: Value, meta: Map<String, Value>) -> Self {
        Self { request, meta }
    }
}

/// Runs a single job's request to completion (or failure). Implementations
/// are the external collaborator this engine dispatches through — a real
/// LLM/search/labeling client is out of scope for this crate; only a
/// deterministic mock and a trivial echo implementation ship here.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, request: &Value) -> Result<Value>;
}

/// Deterministic stub processor for tests and `mock=true` dispatch.
///
/// Returns `{"mock": true, "request": <request>}` unless the request object
/// carries `"force_fail": true`, in which case it returns an error — this is
/// how scenario tests drive a job to `Failed` without any real I/O or
/// randomness.
#[derive(Debug, Clone, Default)]
pub struct MockProcessor;

#[async_trait]
impl JobProcessor for MockProcessor {
    async fn process(&self, request: &Value) -> Result<Value> {
        if request.get("force_fail").and_then(Value::as_bool) == Some(true) {
            anyhow::bail!("mocked failure");
        }
        Ok(serde_json::json!({"mock": true, "request": request}))
    }
}

/// Processor that returns the request unchanged as the response. Useful as a
/// template for a real processor and in tests that only care about plumbing.
#[derive(Debug, Clone, Default)]
pub struct EchoProcessor;

#[async_trait]
impl JobProcessor for EchoProcessor {
    async fn process(&self, request: &Value) -> Result<Value> {
        Ok(request.clone())
    }
}

/// `max_calls` dispatches per `per`, enforced by even spacing between calls
/// (a simple sliding interval rather than a full token bucket — sufficient
/// for the cooperative, single-batch dispatch this engine performs).
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max_calls: usize,
    pub per: Duration,
}

impl RateLimit {
    pub fn per_second(max_calls: usize) -> Self {
        Self {
            max_calls,
            per: Duration::from_secs(1),
        }
    }

    fn min_interval(&self) -> Duration {
        if self.max_calls == 0 {
            Duration::ZERO
        } else {
            self.per / self.max_calls as u32
        }
    }
}

struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(limit: Option<RateLimit>) -> Self {
        Self {
            min_interval: limit.map(|l| l.min_interval()).unwrap_or(Duration::ZERO),
            last: Mutex::new(None),
        }
    }

    async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        let now = Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.saturating_duration_since(prev);
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct ProcessJobsOptions {
    pub concurrency_limit: usize,
    pub rate_limit: Option<RateLimit>,
    pub max_number_per_batch: Option<usize>,
    pub mock: bool,
    /// Per-request deadline. A job whose processor call doesn't complete in
    /// time is marked `Failed` with a timeout response, same as any other
    /// processor error — the owning op's `FailureBehavior` decides what
    /// happens next.
    pub request_timeout: Option<Duration>,
}

impl Default for ProcessJobsOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 8,
            rate_limit: None,
            max_number_per_batch: None,
            mock: false,
            request_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessJobsReport {
    pub dispatched: usize,
    pub done: usize,
    pub failed: usize,
}

/// Cache-backed asynchronous job queue. Owns a request ledger and a response
/// ledger under `{cache_path}/requests.jsonl` and `{cache_path}/responses.jsonl`.
pub struct Broker {
    requests: Ledger,
    responses: Ledger,
}

impl Broker {
    pub fn open(cache_path: impl AsRef<Path>) -> Result<Self> {
        let cache_path = cache_path.as_ref();
        let requests = Ledger::open_with(cache_path.join("requests.jsonl"), false)
            .context("open broker request ledger")?;
        let responses = Ledger::open_with(cache_path.join("responses.jsonl"), false)
            .context("open broker response ledger")?;
        Ok(Self {
            requests,
            responses,
        })
    }

    /// Reconstruct state from both ledgers. Ledgers already reload on
    /// `open`; this is for re-synchronizing after an external change to the
    /// on-disk files (tests, or a process restarting against a shared cache).
    pub fn resume(&mut self) -> Result<()> {
        self.requests.resume()?;
        self.responses.resume()?;
        Ok(())
    }

    fn next_rev(&self, job_idx: &str) -> u64 {
        let in_requests = self.requests.get(job_idx, None).map(|e| e.rev);
        let in_responses = self.responses.get(job_idx, None).map(|e| e.rev);
        in_requests
            .into_iter()
            .chain(in_responses)
            .max()
            .map(|r| r + 1)
            .unwrap_or(0)
    }

    /// Add requests to the request ledger with status `Queued`, skipping any
    /// whose `job_idx` is already terminal in the response ledger (the cache
    /// hit path). Returns the jobs actually enqueued (omits cache hits).
    pub fn enqueue(&mut self, requests: Vec<EnqueueRequest>) -> Result<Vec<BrokerJob>> {
        let mut enqueued = Vec::new();
        let mut entries = Vec::new();

        for req in requests {
            let job_idx = content_hash(&req.request);
            if self
                .responses
                .get(&job_idx, None)
                .map(|e| {
                    BrokerJob::from_entry(&e)
                        .map(|j| j.status.is_terminal())
                        .unwrap_or(false)
                })
                .unwrap_or(false)
            {
                continue; // cache hit: already have a terminal response for this request
            }
            if self
                .requests
                .get(&job_idx, None)
                .map(|e| BrokerJob::from_entry(&e).map(|j| !j.status.is_terminal()).unwrap_or(false))
                .unwrap_or(false)
            {
                continue; // already queued/running
            }

            let job = BrokerJob {
                job_idx: job_idx.clone(),
                rev: self.next_rev(&job_idx),
                status: JobStatus::Queued,
                request: req.request,
                response: None,
                meta: req.meta,
            };
            entries.push(job.to_entry());
            enqueued.push(job);
        }

        self.requests.append(&entries)?;
        Ok(enqueued)
    }

    /// Drop jobs from the request ledger once the owning op has consumed
    /// their terminal response.
    pub fn dequeue(&mut self, job_idxs: &[String]) -> Result<()> {
        self.requests.remove(job_idxs)
    }

    /// Snapshot of request-ledger jobs whose status is in `allowed_statuses`,
    /// ordered by `job_idx`. The owning op uses this to decide what to
    /// (re)dispatch, e.g. `[Queued]`, or `[Queued, Failed]` under a `Retry`
    /// failure policy.
    pub fn get_job_requests(&self, allowed_statuses: &[JobStatus]) -> Result<Vec<BrokerJob>> {
        let jobs = self
            .requests
            .filter(|_| true)
            .iter()
            .map(BrokerJob::from_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok(jobs
            .into_iter()
            .filter(|j| allowed_statuses.contains(&j.status))
            .collect())
    }

    /// Snapshot of every response-ledger job, terminal or not (in practice
    /// only terminal jobs are ever written here).
    pub fn get_job_responses(&self) -> Result<Vec<BrokerJob>> {
        self.responses.filter(|_| true).iter().map(BrokerJob::from_entry).collect()
    }

    /// Cooperative driver: dispatch up to `concurrency_limit` jobs at once,
    /// spaced by `rate_limit`, optionally capped at `max_number_per_batch`.
    /// Each completion is written into the response ledger as soon as it
    /// lands, so a crash mid-batch loses at most the in-flight jobs.
    pub async fn process_jobs(
        &mut self,
        requests: Vec<BrokerJob>,
        processor: &dyn JobProcessor,
        opts: &ProcessJobsOptions,
    ) -> Result<ProcessJobsReport> {
        let batch: Vec<BrokerJob> = match opts.max_number_per_batch {
            Some(max) => requests.into_iter().take(max).collect(),
            None => requests,
        };
        if batch.is_empty() {
            return Ok(ProcessJobsReport::default());
        }

        // Mark Running before dispatch so a concurrent observer sees the
        // in-flight state, matching the Queued -> Running transition.
        let running: Vec<Entry> = batch
            .iter()
            .map(|job| {
                let mut j = job.clone();
                j.rev = self.next_rev(&j.job_idx).max(j.rev + 1);
                j.status = JobStatus::Running;
                j.to_entry()
            })
            .collect();
        self.requests.append(&running)?;

        let limiter = Arc::new(RateLimiter::new(opts.rate_limit));
        let mock = opts.mock;
        let timeout = opts.request_timeout;

        let results: Vec<(BrokerJob, Result<Value>)> = stream::iter(batch.into_iter())
            .map(|job| {
                let limiter = Arc::clone(&limiter);
                async move {
                    limiter.acquire().await;
                    let call = async {
                        if mock {
                            MockProcessor.process(&job.request).await
                        } else {
                            processor.process(&job.request).await
                        }
                    };
                    let outcome = match timeout {
                        Some(d) => match tokio::time::timeout(d, call).await {
                            Ok(result) => result,
                            Err(_) => Err(anyhow::anyhow!("broker job timed out after {d:?}")),
                        },
                        None => call.await,
                    };
                    (job, outcome)
                }
            })
            .buffer_unordered(opts.concurrency_limit.max(1))
            .collect()
            .await;

        let mut report = ProcessJobsReport::default();
        let mut response_entries = Vec::new();

        for (job, outcome) in results {
            report.dispatched += 1;
            let rev = self.next_rev(&job.job_idx).max(job.rev + 1);
            let terminal = match outcome {
                Ok(response) => {
                    report.done += 1;
                    BrokerJob {
                        job_idx: job.job_idx,
                        rev,
                        status: JobStatus::Done,
                        request: job.request,
                        response: Some(response),
                        meta: job.meta,
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(job_idx = %job.job_idx, error = %err, "broker job failed");
                    BrokerJob {
                        job_idx: job.job_idx,
                        rev,
                        status: JobStatus::Failed,
                        request: job.request,
                        response: Some(serde_json::json!({"error": err.to_string()})),
                        meta: job.meta,
                    }
                }
            };
            response_entries.push(terminal.to_entry());
        }

        // Mirror the terminal status into the request ledger too, so
        // `get_job_requests` reflects Done/Failed and an owning op's
        // `FailureBehavior::Retry` can find failed jobs to retry.
        self.requests.append(&response_entries)?;
        self.responses.append(&response_entries)?;
        Ok(report)
    }

    /// Re-queue a job that last completed `Failed`, under a fresh revision,
    /// bypassing the response ledger's cache-hit check (an explicit retry is
    /// not a fresh enqueue of identical content).
    pub fn retry(&mut self, job_idx: &str) -> Result<()> {
        let Some(entry) = self.requests.get(job_idx, None) else {
            return Ok(());
        };
        let job = BrokerJob::from_entry(&entry)?;
        if job.status != JobStatus::Failed {
            return Ok(());
        }
        let retried = BrokerJob {
            job_idx: job.job_idx,
            rev: job.rev + 1,
            status: JobStatus::Queued,
            request: job.request,
            response: None,
            meta: job.meta,
        };
        self.requests.append(&[retried.to_entry()])
    }
}

/// In-memory tally used by tests that want to assert on how many times a
/// processor was actually invoked (e.g. to verify a cache hit happened).
#[derive(Default)]
pub struct CountingProcessor {
    inner: MockProcessor,
    calls: Mutex<HashMap<String, usize>>,
}

#[async_trait]
impl JobProcessor for CountingProcessor {
    async fn process(&self, request: &Value) -> Result<Value> {
        let key = content_hash(request);
        *self.calls.lock().await.entry(key).or_insert(0) += 1;
        self.inner.process(request).await
    }
}

impl CountingProcessor {
    pub async fn call_count(&self, request: &Value) -> usize {
        let key = content_hash(request);
        *self.calls.lock().await.get(&key).unwrap_or(&0)
    }

    pub async fn total_calls(&self) -> usize {
        self.calls.lock().await.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn enqueue_skips_cache_hit_for_identical_request() {
        let dir = tempdir().unwrap();
        let mut broker = Broker::open(dir.path()).unwrap();

        let req = EnqueueRequest::new(serde_json::json!({"prompt": "hi"}));
        let jobs = broker.enqueue(vec![req.clone()]).unwrap();
        assert_eq!(jobs.len(), 1);

        let processor = CountingProcessor::default();
        let pending = broker.get_job_requests(&[JobStatus::Queued]).unwrap();
        broker
            .process_jobs(pending, &processor, &ProcessJobsOptions::default())
            .await
            .unwrap();

        // Second enqueue of the same content must be a cache hit: no new
        // Queued job appears in the request ledger.
        let jobs2 = broker.enqueue(vec![req]).unwrap();
        assert!(jobs2.is_empty());
        assert_eq!(processor.total_calls().await, 1);
    }

    #[tokio::test]
    async fn process_jobs_writes_terminal_response_and_dequeue_drops_request() {
        let dir = tempdir().unwrap();
        let mut broker = Broker::open(dir.path()).unwrap();

        let req = EnqueueRequest::new(serde_json::json!({"prompt": "hi"}));
        let jobs = broker.enqueue(vec![req]).unwrap();
        let job_idx = jobs[0].job_idx.clone();

        let pending = broker.get_job_requests(&[JobStatus::Queued]).unwrap();
        let report = broker
            .process_jobs(pending, &EchoProcessor, &ProcessJobsOptions::default())
            .await
            .unwrap();
        assert_eq!(report.done, 1);
        assert_eq!(report.failed, 0);

        let responses = broker.get_job_responses().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, JobStatus::Done);

        broker.dequeue(&[job_idx]).unwrap();
        assert!(broker.get_job_requests(&[JobStatus::Queued, JobStatus::Running]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn mock_force_fail_produces_failed_status() {
        let dir = tempdir().unwrap();
        let mut broker = Broker::open(dir.path()).unwrap();

        let req = EnqueueRequest::new(serde_json::json!({"prompt": "hi", "force_fail": true}));
        broker.enqueue(vec![req]).unwrap();

        let pending = broker.get_job_requests(&[JobStatus::Queued]).unwrap();
        let opts = ProcessJobsOptions {
            mock: true,
            ..Default::default()
        };
        let report = broker
            .process_jobs(pending, &MockProcessor, &opts)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let responses = broker.get_job_responses().unwrap();
        assert_eq!(responses[0].status, JobStatus::Failed);
    }

    struct SlowProcessor(Duration);
    #[async_trait]
    impl JobProcessor for SlowProcessor {
        async fn process(&self, request: &Value) -> Result<Value> {
            tokio::time::sleep(self.0).await;
            Ok(request.clone())
        }
    }

    #[tokio::test]
    async fn request_timeout_fails_a_job_that_runs_too_long() {
        let dir = tempdir().unwrap();
        let mut broker = Broker::open(dir.path()).unwrap();

        let req = EnqueueRequest::new(serde_json::json!({"prompt": "hi"}));
        broker.enqueue(vec![req]).unwrap();

        let pending = broker.get_job_requests(&[JobStatus::Queued]).unwrap();
        let opts = ProcessJobsOptions {
            request_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let report = broker
            .process_jobs(pending, &SlowProcessor(Duration::from_millis(500)), &opts)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(broker.get_job_responses().unwrap()[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn resume_reconstructs_state_from_disk() {
        let dir = tempdir().unwrap();
        let job_idx;
        {
            let mut broker = Broker::open(dir.path()).unwrap();
            let req = EnqueueRequest::new(serde_json::json!({"prompt": "hi"}));
            let jobs = broker.enqueue(vec![req]).unwrap();
            job_idx = jobs[0].job_idx.clone();
        }

        let broker = Broker::open(dir.path()).unwrap();
        let pending = broker.get_job_requests(&[JobStatus::Queued]).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_idx, job_idx);
    }
}
