//! Task graph execution.
//!
//! A [`Scheduler`] computes requested keys from a [`TaskGraph`]. Both
//! backends share the same observable contract:
//!
//! * every node of the reachable subgraph is evaluated at most once per
//!   invocation, however many requested keys depend on it;
//! * a provider runs only after all of its inputs have produced values;
//! * a cycle in the reachable subgraph fails with [`TsugiteError::Cycle`]
//!   before anything is evaluated;
//! * intermediate values are dropped as soon as their last consumer has run,
//!   and nothing is cached across invocations.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing::{Level, span};

use crate::error::TsugiteError;
use crate::graph::TaskGraph;
use crate::key::Key;
use crate::provider::Dynamic;

#[cfg(feature = "parallel")]
pub use parallel::ParallelScheduler;

/// Executes a task graph, returning one value per requested key, in request
/// order.
pub trait Scheduler: Send + Sync {
    fn get(&self, graph: &TaskGraph, keys: &[Key]) -> Result<Vec<Dynamic>, TsugiteError>;
}

fn targets(graph: &TaskGraph, keys: &[Key]) -> Result<Vec<NodeIndex>, TsugiteError> {
    keys.iter()
        .map(|key| {
            graph
                .index_of(key)
                .ok_or_else(|| TsugiteError::KeyNotInGraph(key.clone()))
        })
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Post-order over the subgraph reachable from `targets` through input
/// edges, so dependencies come before their dependents. Fails with the
/// offending path if the reachable subgraph contains a cycle.
fn evaluation_order(
    graph: &TaskGraph,
    targets: &[NodeIndex],
) -> Result<Vec<NodeIndex>, TsugiteError> {
    fn visit(
        graph: &TaskGraph,
        index: NodeIndex,
        marks: &mut HashMap<NodeIndex, Mark>,
        trail: &mut Vec<NodeIndex>,
        order: &mut Vec<NodeIndex>,
    ) -> Result<(), TsugiteError> {
        match marks.get(&index) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = trail.iter().position(|i| *i == index).unwrap_or(0);
                let mut path: Vec<Key> = trail[start..]
                    .iter()
                    .map(|i| graph.node(*i).key.clone())
                    .collect();
                path.push(graph.node(index).key.clone());
                return Err(TsugiteError::Cycle(path));
            }
            None => {}
        }

        marks.insert(index, Mark::Visiting);
        trail.push(index);

        let dependencies: Vec<NodeIndex> = graph
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        for dependency in dependencies {
            visit(graph, dependency, marks, trail, order)?;
        }

        trail.pop();
        marks.insert(index, Mark::Done);
        order.push(index);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut trail = Vec::new();
    let mut order = Vec::new();
    for &target in targets {
        visit(graph, target, &mut marks, &mut trail, &mut order)?;
    }
    Ok(order)
}

/// Consumers of each node within the current run, so values can be dropped
/// as soon as the last consumer has finished.
fn consumer_counts(graph: &TaskGraph, in_run: &HashSet<NodeIndex>) -> HashMap<NodeIndex, usize> {
    in_run
        .iter()
        .map(|&index| {
            let count = graph
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .filter(|consumer| in_run.contains(consumer))
                .count();
            (index, count)
        })
        .collect()
}

pub(crate) fn into_execution_error(err: anyhow::Error, provider: &str) -> TsugiteError {
    match err.downcast::<TsugiteError>() {
        Ok(err) => err,
        Err(err) => TsugiteError::Userland {
            provider: provider.to_string(),
            source: err,
        },
    }
}

/// Depth-first single-threaded execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialScheduler;

impl Scheduler for SequentialScheduler {
    fn get(&self, graph: &TaskGraph, keys: &[Key]) -> Result<Vec<Dynamic>, TsugiteError> {
        let targets = targets(graph, keys)?;
        // Also serves as the cycle check: nothing runs on a cyclic subgraph.
        let order = evaluation_order(graph, &targets)?;

        let in_run: HashSet<NodeIndex> = order.iter().copied().collect();
        let wanted: HashSet<NodeIndex> = targets.iter().copied().collect();
        let mut remaining = consumer_counts(graph, &in_run);

        let mut cache: HashMap<NodeIndex, Dynamic> = HashMap::new();
        let mut results: HashMap<NodeIndex, Dynamic> = HashMap::new();

        for index in order {
            let node = graph.node(index);

            let mut values = Vec::with_capacity(node.args.len());
            for (_, argument) in &node.args {
                let dependency = graph
                    .index_of(argument)
                    .expect("argument keys are graph nodes");
                values.push(
                    cache
                        .get(&dependency)
                        .cloned()
                        .expect("dependencies are evaluated first"),
                );
            }

            let task_span = span!(Level::DEBUG, "provider", name = node.provider.name());
            let _enter = task_span.enter();

            let value = node
                .provider
                .call(&values)
                .map_err(|err| into_execution_error(err, node.provider.name()))?;

            if wanted.contains(&index) {
                results.insert(index, value.clone());
            }

            for (_, argument) in &node.args {
                let dependency = graph
                    .index_of(argument)
                    .expect("argument keys are graph nodes");
                if let Some(count) = remaining.get_mut(&dependency) {
                    *count -= 1;
                    if *count == 0 {
                        cache.remove(&dependency);
                    }
                }
            }

            if remaining.get(&index).copied().unwrap_or(0) > 0 {
                cache.insert(index, value);
            }
        }

        Ok(targets.iter().map(|index| results[index].clone()).collect())
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use super::*;

    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::mpsc::channel;

    use tracing::info;

    /// Executes independent providers concurrently on the Rayon thread pool.
    ///
    /// The algorithm is a parallel topological sort: tasks whose dependency
    /// count has dropped to zero are spawned immediately, and the main
    /// thread sits on a channel collecting results and unlocking dependents.
    /// Observable results are identical to [`SequentialScheduler`].
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ParallelScheduler;

    impl Scheduler for ParallelScheduler {
        fn get(&self, graph: &TaskGraph, keys: &[Key]) -> Result<Vec<Dynamic>, TsugiteError> {
            let targets = targets(graph, keys)?;
            // The order itself is not used, but this rejects cyclic
            // subgraphs before any provider runs.
            let order = evaluation_order(graph, &targets)?;
            let to_run: HashSet<NodeIndex> = order.into_iter().collect();
            let wanted: HashSet<NodeIndex> = targets.iter().copied().collect();

            // Dependency counts and reverse edges, restricted to this run.
            let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
            let mut dependency_counts: HashMap<NodeIndex, usize> = HashMap::new();
            for &index in &to_run {
                let mut count = 0;
                for dependency in graph
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter(|dependency| to_run.contains(dependency))
                {
                    count += 1;
                    dependents.entry(dependency).or_default().push(index);
                }
                dependency_counts.insert(index, count);
            }
            let mut remaining = consumer_counts(graph, &to_run);

            let total = to_run.len();
            let mut completed = 0usize;
            let mut cache: HashMap<NodeIndex, Dynamic> = HashMap::new();
            let mut results: HashMap<NodeIndex, Dynamic> = HashMap::new();

            rayon::scope(|s| -> Result<(), TsugiteError> {
                let (sender, receiver) = channel::<(NodeIndex, anyhow::Result<Dynamic>)>();

                // A helper closure to spawn one task on the pool.
                let spawn_task = |cache: &HashMap<NodeIndex, Dynamic>, index: NodeIndex| {
                    let node = graph.node(index);

                    let mut values = Vec::with_capacity(node.args.len());
                    for (_, argument) in &node.args {
                        let dependency = graph
                            .index_of(argument)
                            .expect("argument keys are graph nodes");
                        values.push(
                            cache
                                .get(&dependency)
                                .cloned()
                                .expect("dependencies are evaluated first"),
                        );
                    }

                    let sender = sender.clone();
                    s.spawn(move |_| {
                        let task_span =
                            span!(Level::DEBUG, "provider", name = node.provider.name());
                        let _enter = task_span.enter();

                        // AssertUnwindSafe: a panicking provider cannot
                        // corrupt shared state, every input it sees is an
                        // immutable Arc.
                        let output =
                            match catch_unwind(AssertUnwindSafe(|| node.provider.call(&values))) {
                                Ok(result) => result,
                                Err(panic) => {
                                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                                        format!("provider panicked: {s}")
                                    } else if let Some(s) = panic.downcast_ref::<String>() {
                                        format!("provider panicked: {s}")
                                    } else {
                                        String::from("provider panicked with unknown payload")
                                    };
                                    Err(anyhow::anyhow!(msg))
                                }
                            };

                        // The receiver is gone if the run already failed.
                        let _ = sender.send((index, output));
                    });
                };

                // Seed the tasks with no pending dependencies.
                for &index in &to_run {
                    if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                        spawn_task(&cache, index);
                    }
                }

                // Scheduler loop: collect results, unlock dependents.
                while completed < total {
                    let (index, output) = receiver
                        .recv()
                        .expect("worker results channel closed unexpectedly");

                    let value = match output {
                        Ok(value) => value,
                        Err(err) => {
                            let provider = graph.node(index).provider.name();
                            return Err(into_execution_error(err, provider));
                        }
                    };

                    if wanted.contains(&index) {
                        results.insert(index, value.clone());
                    }
                    cache.insert(index, value);
                    completed += 1;

                    // Release inputs whose consumers have all finished.
                    for (_, argument) in &graph.node(index).args {
                        let dependency = graph
                            .index_of(argument)
                            .expect("argument keys are graph nodes");
                        if let Some(count) = remaining.get_mut(&dependency) {
                            *count -= 1;
                            if *count == 0 {
                                cache.remove(&dependency);
                            }
                        }
                    }

                    if let Some(unlocked) = dependents.get(&index) {
                        for &next in unlocked {
                            if let Some(count) = dependency_counts.get_mut(&next) {
                                *count -= 1;
                                if *count == 0 {
                                    spawn_task(&cache, next);
                                }
                            }
                        }
                    }
                }

                Ok(())
            })?;

            info!(nodes = total, "task graph computed");
            Ok(targets.iter().map(|index| results[index].clone()).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::pipeline::Pipeline;
    use crate::provider::{Provider, arg};

    fn counted_int(calls: &Arc<AtomicUsize>) -> Provider {
        let calls = calls.clone();
        Provider::function("counted_int", (), Key::of::<i64>(), move |()| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(3i64)
        })
    }

    fn diamond(calls: &Arc<AtomicUsize>) -> Pipeline {
        let mut pipeline = Pipeline::new();
        pipeline.insert(counted_int(calls)).unwrap();
        pipeline
            .insert(Provider::function(
                "int_to_float",
                (arg::<i64>("x", Key::of::<i64>()),),
                Key::of::<f64>(),
                |(x,)| Ok(0.5 * *x as f64),
            ))
            .unwrap();
        pipeline
            .insert(Provider::function(
                "combine",
                (
                    arg::<i64>("x", Key::of::<i64>()),
                    arg::<f64>("y", Key::of::<f64>()),
                ),
                Key::of::<String>(),
                |(x, y)| Ok(format!("{x};{y}")),
            ))
            .unwrap();
        pipeline
    }

    #[test]
    fn test_sequential_computes_diamond() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = diamond(&calls).get([Key::of::<String>()]).unwrap();

        let values = SequentialScheduler
            .get(&graph, &[Key::of::<String>()])
            .unwrap();
        assert_eq!(values[0].downcast_ref::<String>().unwrap(), "3;1.5");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nothing_is_cached_across_invocations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = diamond(&calls).get([Key::of::<String>()]).unwrap();

        SequentialScheduler
            .get(&graph, &[Key::of::<String>()])
            .unwrap();
        SequentialScheduler
            .get(&graph, &[Key::of::<String>()])
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_request_keys_are_computed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = diamond(&calls).get([Key::of::<i64>()]).unwrap();

        let values = SequentialScheduler
            .get(&graph, &[Key::of::<i64>(), Key::of::<i64>()])
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].downcast_ref::<i64>(), Some(&3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_key_fails_without_running_anything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = diamond(&calls).get([Key::of::<i64>()]).unwrap();

        let err = SequentialScheduler
            .get(&graph, &[Key::of::<f64>()])
            .unwrap_err();
        assert!(matches!(err, TsugiteError::KeyNotInGraph(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cycle_is_reported_with_its_path() {
        let mut pipeline = Pipeline::new();
        pipeline
            .insert(Provider::function(
                "int_to_float",
                (arg::<i64>("x", Key::of::<i64>()),),
                Key::of::<f64>(),
                |(x,)| Ok(*x as f64),
            ))
            .unwrap();
        pipeline
            .insert(Provider::function(
                "float_to_int",
                (arg::<f64>("x", Key::of::<f64>()),),
                Key::of::<i64>(),
                |(x,)| Ok(*x as i64),
            ))
            .unwrap();

        let graph = pipeline.get([Key::of::<i64>()]).unwrap();
        let err = SequentialScheduler
            .get(&graph, &[Key::of::<i64>()])
            .unwrap_err();

        match err {
            TsugiteError::Cycle(path) => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_userland_errors_carry_the_provider_name() {
        let mut pipeline = Pipeline::new();
        pipeline
            .insert(Provider::function("broken", (), Key::of::<i64>(), |()| {
                Err::<i64, _>(anyhow::anyhow!("boom"))
            }))
            .unwrap();

        let graph = pipeline.get([Key::of::<i64>()]).unwrap();
        let err = SequentialScheduler
            .get(&graph, &[Key::of::<i64>()])
            .unwrap_err();

        match err {
            TsugiteError::Userland { provider, source } => {
                assert_eq!(provider, "broken");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("expected a userland error, got {other:?}"),
        }
    }

    #[cfg(feature = "parallel")]
    mod parallel {
        use super::*;
        use crate::provider::Dynamic;

        #[test]
        fn test_parallel_matches_sequential() {
            let calls = Arc::new(AtomicUsize::new(0));
            let pipeline = diamond(&calls);
            let graph = pipeline.get([Key::of::<String>(), Key::of::<f64>()]).unwrap();
            let keys = [Key::of::<String>(), Key::of::<f64>()];

            let sequential = SequentialScheduler.get(&graph, &keys).unwrap();
            let parallel = ParallelScheduler.get(&graph, &keys).unwrap();

            assert_eq!(
                sequential[0].downcast_ref::<String>(),
                parallel[0].downcast_ref::<String>()
            );
            assert_eq!(
                sequential[1].downcast_ref::<f64>(),
                parallel[1].downcast_ref::<f64>()
            );
        }

        #[test]
        fn test_parallel_deduplicates_shared_intermediates() {
            let calls = Arc::new(AtomicUsize::new(0));
            let graph = diamond(&calls).get([Key::of::<String>()]).unwrap();

            let values = ParallelScheduler
                .get(&graph, &[Key::of::<String>()])
                .unwrap();
            assert_eq!(values[0].downcast_ref::<String>().unwrap(), "3;1.5");
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn test_parallel_rejects_cycles_before_running() {
            let calls = Arc::new(AtomicUsize::new(0));
            let probe = {
                let calls = calls.clone();
                Provider::function(
                    "probe",
                    (arg::<i64>("x", Key::of::<i64>()),),
                    Key::of::<String>(),
                    move |(x,)| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(x.to_string())
                    },
                )
            };

            let mut pipeline = Pipeline::new();
            pipeline.insert(probe).unwrap();
            pipeline
                .insert(Provider::function(
                    "int_from_float",
                    (arg::<f64>("x", Key::of::<f64>()),),
                    Key::of::<i64>(),
                    |(x,)| Ok(*x as i64),
                ))
                .unwrap();
            pipeline
                .insert(Provider::function(
                    "float_from_int",
                    (arg::<i64>("x", Key::of::<i64>()),),
                    Key::of::<f64>(),
                    |(x,)| Ok(*x as f64),
                ))
                .unwrap();

            let graph = pipeline.get([Key::of::<String>()]).unwrap();
            let err = ParallelScheduler
                .get(&graph, &[Key::of::<String>()])
                .unwrap_err();

            assert!(matches!(err, TsugiteError::Cycle(_)));
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }

        #[test]
        fn test_parallel_converts_panics_to_errors() {
            let mut pipeline = Pipeline::new();
            pipeline
                .insert(Provider::dynamic(
                    "panicking",
                    vec![],
                    Key::of::<i64>(),
                    |_| {
                        let empty: Vec<i64> = Vec::new();
                        let first = *empty.first().expect("provider exploded");
                        Ok(Arc::new(first) as Dynamic)
                    },
                ))
                .unwrap();

            let graph = pipeline.get([Key::of::<i64>()]).unwrap();
            let err = ParallelScheduler.get(&graph, &[Key::of::<i64>()]).unwrap_err();

            match err {
                TsugiteError::Userland { provider, source } => {
                    assert_eq!(provider, "panicking");
                    assert!(source.to_string().contains("panicked"));
                }
                other => panic!("expected a userland error, got {other:?}"),
            }
        }
    }
}
