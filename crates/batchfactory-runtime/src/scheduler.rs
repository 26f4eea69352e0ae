//! The `execute` loop: interleaves draining cheap (barrier level 0) work to
//! quiescence with running progressively more expensive barriers (batch
//! collectors, broker dispatch), falling back to the lowest level that made
//! progress each time one does, until nothing anywhere can emit.

use anyhow::Result;
use batchfactory_config::EngineOptions;

use crate::graph::Graph;

/// Summary of one `Scheduler::execute` call.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutionReport {
    pub iterations: u64,
    /// `true` if the run stopped because `max_iterations` was exhausted
    /// rather than reaching quiescence.
    pub capped: bool,
}

pub struct Scheduler;

impl Scheduler {
    /// Drive `graph` to quiescence (or until `opts.max_iterations` is
    /// exhausted). See the barrier-level rules in the module and crate docs:
    /// `current_level` starts at the graph's lowest declared barrier level;
    /// a pump that emits nothing advances it to the next declared level (or
    /// stops if none remain, or if `opts.max_barrier_level` forbids the
    /// ascent); a pump that emits falls `current_level` back to the lowest
    /// level that produced work. `dispatch_brokers` is only ever passed
    /// through as `true` while `current_level > 0`, so a broker is never
    /// triggered while cheaper work can still make progress.
    pub fn execute(graph: &mut Graph, opts: &EngineOptions) -> Result<ExecutionReport> {
        let levels = graph.declared_levels();
        if levels.is_empty() {
            return Ok(ExecutionReport::default());
        }

        let mut current_level = levels[0];
        let mut first_pump = true;
        let mut iterations = 0u64;

        loop {
            if iterations >= opts.max_iterations {
                tracing::warn!(
                    max_iterations = opts.max_iterations,
                    "scheduler iteration cap exceeded; aborting with partial state"
                );
                return Ok(ExecutionReport {
                    iterations,
                    capped: true,
                });
            }
            iterations += 1;

            let mut pump_opts = opts.clone();
            pump_opts.reload_inputs = first_pump && opts.reload_inputs;
            pump_opts.dispatch_brokers = opts.dispatch_brokers && current_level > 0;
            first_pump = false;

            tracing::debug!(iteration = iterations, current_level, "scheduler pump");
            let report = graph.pump(current_level, &pump_opts)?;

            match report.highest_emitting_level {
                Some(l) => current_level = current_level.min(l),
                None => {
                    let next = levels.iter().copied().find(|&l| l > current_level);
                    match next {
                        Some(l) if opts.max_barrier_level.map_or(true, |cap| l <= cap) => {
                            current_level = l;
                        }
                        _ => break,
                    }
                }
            }
        }

        tracing::info!(iterations, "scheduler reached quiescence");
        Ok(ExecutionReport {
            iterations,
            capped: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use batchfactory_entry::Entry;
    use batchfactory_op::{AtomicOp, InputOp, Node, Transform};
    use anyhow::Result as AResult;

    struct Double;
    impl Transform for Double {
        fn transform(&self, entry: &Entry) -> AResult<Option<Entry>> {
            let n = entry.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            let mut next = entry.next_rev(entry.data.clone());
            next.set("n", n * 2);
            Ok(Some(next))
        }
    }

    #[test]
    fn execute_drains_a_linear_pipeline_to_quiescence() {
        let mut seed = Entry::new("a", 0);
        seed.set("n", 3);
        let input = Node::Input(InputOp::new(vec![seed]));
        let atomic = Node::Atomic(AtomicOp::new(Box::new(Double)));
        let mut graph = Graph::build(vec![input, atomic], vec![Edge::new(0, 0, 1, 0)], Some(1)).unwrap();

        let report = Scheduler::execute(&mut graph, &EngineOptions::default()).unwrap();
        assert!(!report.capped);
        let tail = graph.tail_entries();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].get("n"), Some(&serde_json::json!(6)));
    }

    #[test]
    fn execute_is_idempotent_on_rerun_with_no_new_seeds() {
        let mut seed = Entry::new("a", 0);
        seed.set("n", 3);
        let input = Node::Input(InputOp::new(vec![seed]));
        let atomic = Node::Atomic(AtomicOp::new(Box::new(Double)));
        let mut graph = Graph::build(vec![input, atomic], vec![Edge::new(0, 0, 1, 0)], Some(1)).unwrap();

        let opts = EngineOptions {
            reload_inputs: false,
            ..Default::default()
        };
        Scheduler::execute(&mut graph, &opts).unwrap();
        let first_tail = graph.tail_entries();
        Scheduler::execute(&mut graph, &opts).unwrap();
        let second_tail = graph.tail_entries();
        assert_eq!(first_tail.len(), second_tail.len());
    }

    #[test]
    fn execute_respects_iteration_cap() {
        let input = Node::Input(InputOp::new(vec![Entry::new("a", 0)]));
        let atomic = Node::Atomic(AtomicOp::new(Box::new(Double)));
        let mut graph = Graph::build(vec![input, atomic], vec![Edge::new(0, 0, 1, 0)], Some(1)).unwrap();

        let opts = EngineOptions {
            max_iterations: 1,
            ..Default::default()
        };
        let report = Scheduler::execute(&mut graph, &opts).unwrap();
        assert!(report.capped);
        assert_eq!(report.iterations, 1);
    }
}
