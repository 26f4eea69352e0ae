//! Scenario: filter even entries, then multiply the survivors by ten.

use anyhow::Result;
use batchfactory_entry::Entry;
use batchfactory_op::{AtomicOp, FilterOp, InputOp, Node, Predicate, Transform};
use batchfactory_runtime::{Scheduler, Segment};

struct IsEven;
impl Predicate for IsEven {
    fn test(&self, entry: &Entry) -> Result<bool> {
        Ok(entry.get("n").and_then(|v| v.as_i64()).unwrap_or(0) % 2 == 0)
    }
}

struct TimesTen;
impl Transform for TimesTen {
    fn transform(&self, entry: &Entry) -> Result<Option<Entry>> {
        let n = entry.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        let mut next = entry.next_rev(entry.data.clone());
        next.set("n", n * 10);
        Ok(Some(next))
    }
}

fn seeded(idx: &str, n: i64) -> Entry {
    let mut e = Entry::new(idx, 0);
    e.set("n", n);
    e
}

#[test]
fn filter_then_map_emits_only_the_scaled_evens() -> Result<()> {
    let input = Segment::single(Node::Input(InputOp::new(vec![
        seeded("1", 1),
        seeded("2", 2),
        seeded("3", 3),
        seeded("4", 4),
    ])));
    let filter = Segment::single(Node::Filter(FilterOp::new(Box::new(IsEven), true)));
    let map = Segment::single(Node::Atomic(AtomicOp::new(Box::new(TimesTen))));

    let mut graph = (input | filter | map).compile()?;
    let opts = batchfactory_config::EngineOptions::default();
    let report = Scheduler::execute(&mut graph, &opts)?;
    assert!(!report.capped);

    let mut tail = graph.tail_entries();
    tail.sort_by(|a, b| a.idx.cmp(&b.idx));
    let ns: Vec<i64> = tail.iter().map(|e| e.get("n").unwrap().as_i64().unwrap()).collect();
    assert_eq!(ns, vec![20, 40]);
    Ok(())
}
