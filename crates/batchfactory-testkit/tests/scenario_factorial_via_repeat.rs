//! Scenario: a cyclic graph computing n! via a manually-wired loop-back edge
//! (the `Repeat` construct) rather than the linear `|` segment operator —
//! Merge picks whichever of {fresh seed, looped-back entry} is present each
//! round, Atomic advances the count and product, and Split either feeds the
//! loop back into Merge or releases the entry to the tail once done.

use std::collections::BTreeMap;

use anyhow::Result;
use batchfactory_entry::Entry;
use batchfactory_op::{AtomicOp, InputOp, Merge, MergeOp, Node, Route, SplitOp, Transform};
use batchfactory_runtime::{Edge, Graph, Scheduler};
use serde_json::Value;

struct PassThroughLatest;
impl Merge for PassThroughLatest {
    fn merge(&self, inputs: &[Option<Entry>]) -> Result<Option<Entry>> {
        Ok(inputs.iter().flatten().max_by_key(|e| e.rev).cloned())
    }
}

struct FactorialStep;
impl Transform for FactorialStep {
    fn transform(&self, entry: &Entry) -> Result<Option<Entry>> {
        let round = entry.get("round").and_then(Value::as_i64).unwrap_or(0);
        let prod = entry.get("prod").and_then(Value::as_i64).unwrap_or(1);
        let next_round = round + 1;
        let next_prod = prod * next_round;
        let mut next = entry.next_rev(entry.data.clone());
        next.set("round", next_round);
        next.set("prod", next_prod);
        Ok(Some(next))
    }
}

/// Routes to port 1 (loop back into Merge) while `round < n`, else port 0
/// (the tail).
struct RepeatUntil(i64);
impl Route for RepeatUntil {
    fn route(&self, entry: &Entry, _n_out_ports: usize) -> Result<BTreeMap<usize, Entry>> {
        let round = entry.get("round").and_then(Value::as_i64).unwrap_or(0);
        let mut m = BTreeMap::new();
        if round < self.0 {
            m.insert(1, entry.clone());
        } else {
            m.insert(0, entry.clone());
        }
        Ok(m)
    }
}

fn factorial_graph(n: i64) -> Graph {
    let mut seed = Entry::new("a", 0);
    seed.set("round", 0);
    seed.set("prod", 1);

    let nodes = vec![
        Node::Input(InputOp::new(vec![seed])),
        Node::Merge(MergeOp::new(Box::new(PassThroughLatest), 2, true)),
        Node::Atomic(AtomicOp::new(Box::new(FactorialStep))),
        Node::Split(SplitOp::new(Box::new(RepeatUntil(n)), 2)),
    ];
    let edges = vec![
        Edge::new(0, 0, 1, 0),
        Edge::new(1, 0, 2, 0),
        Edge::new(2, 0, 3, 0),
        Edge::new(3, 1, 1, 1),
    ];
    Graph::build(nodes, edges, Some(3)).unwrap()
}

#[test]
fn factorial_of_five_is_120() -> Result<()> {
    let mut graph = factorial_graph(5);
    let opts = batchfactory_config::EngineOptions::default();
    let report = Scheduler::execute(&mut graph, &opts)?;
    assert!(!report.capped);

    let tail = graph.tail_entries();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].rev, 5);
    assert_eq!(tail[0].get("round"), Some(&serde_json::json!(5)));
    assert_eq!(tail[0].get("prod"), Some(&serde_json::json!(120)));
    Ok(())
}

#[test]
fn factorial_of_one_terminates_after_a_single_round() -> Result<()> {
    let mut graph = factorial_graph(1);
    let opts = batchfactory_config::EngineOptions::default();
    Scheduler::execute(&mut graph, &opts)?;

    let tail = graph.tail_entries();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].rev, 1);
    assert_eq!(tail[0].get("prod"), Some(&serde_json::json!(1)));
    Ok(())
}
