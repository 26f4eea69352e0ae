//! Scenario: a broker-backed pipeline resumed against its on-disk cache
//! after a simulated restart (a fresh `Broker`/`BrokerOp` reopening the same
//! cache directory) re-processes the same record without re-dispatching.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use batchfactory_broker::{BrokerJob, CountingProcessor, JobProcessor};
use batchfactory_entry::Entry;
use batchfactory_op::{
    BrokerOp, FailureBehavior, FinishJob, InputOp, IsReadyForOutput, Node, PrepareRequest,
};
use batchfactory_runtime::{Edge, Graph, Scheduler};
use batchfactory_testkit::TestCache;
use serde_json::Value;

struct BuildPromptRequest;
impl PrepareRequest for BuildPromptRequest {
    fn prepare_request(&self, entry: &Entry) -> Result<Value> {
        Ok(serde_json::json!({"prompt": entry.get("prompt")}))
    }
}

struct DefaultReady;
impl IsReadyForOutput for DefaultReady {}

struct AttachResponse;
impl FinishJob for AttachResponse {
    fn finish_job(&self, entry: &Entry, job: &BrokerJob) -> Result<Option<Entry>> {
        let mut out = entry.next_rev(entry.data.clone());
        out.set("response", job.response.clone().unwrap_or(Value::Null));
        Ok(Some(out))
    }
}

struct SharedCounter(Arc<CountingProcessor>);
#[async_trait]
impl JobProcessor for SharedCounter {
    async fn process(&self, request: &Value) -> Result<Value> {
        self.0.process(request).await
    }
}

fn seeded_graph(cache: &TestCache, counter: Arc<CountingProcessor>) -> Result<Graph> {
    let mut seed = Entry::new("a", 0);
    seed.set("prompt", "classify this support ticket");

    let op = BrokerOp::new(
        cache.broker("llm")?,
        Box::new(SharedCounter(counter)),
        Box::new(BuildPromptRequest),
        Box::new(DefaultReady),
        Box::new(AttachResponse),
        FailureBehavior::Emit,
        batchfactory_broker::ProcessJobsOptions::default(),
    );
    Graph::build(
        vec![Node::Input(InputOp::new(vec![seed])), Node::Broker(op)],
        vec![Edge::new(0, 0, 1, 0)],
        Some(1),
    )
    .map_err(Into::into)
}

#[tokio::test(flavor = "multi_thread")]
async fn resuming_against_the_same_cache_does_not_redispatch() -> Result<()> {
    let cache = TestCache::new()?;
    let counter = Arc::new(CountingProcessor::default());
    let opts = batchfactory_config::EngineOptions::default();

    let mut first_run = seeded_graph(&cache, counter.clone())?;
    Scheduler::execute(&mut first_run, &opts)?;
    let first_tail = first_run.tail_entries();
    assert_eq!(first_tail.len(), 1);
    assert_eq!(counter.total_calls().await, 1);

    // Simulate a process restart: a brand new Broker/BrokerOp reopening the
    // same on-disk cache directory, seeded with the identical record again.
    let mut resumed_run = seeded_graph(&cache, counter.clone())?;
    Scheduler::execute(&mut resumed_run, &opts)?;
    let resumed_tail = resumed_run.tail_entries();

    assert_eq!(resumed_tail.len(), 1);
    assert_eq!(resumed_tail[0].get("response"), first_tail[0].get("response"));
    assert_eq!(counter.total_calls().await, 1, "no new dispatch after resume");
    Ok(())
}
