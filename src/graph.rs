//! The materialised task graph.
//!
//! A [`TaskGraph`] is the immutable result of one resolver run: a petgraph
//! DAG (or, for broken pipelines, a graph with cycles) whose nodes pair a
//! key with the provider chosen for it and the substituted argument keys.
//! Edges point from a dependency to its dependent. Computing the graph
//! delegates to the configured [`Scheduler`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::error::TsugiteError;
use crate::key::Key;
use crate::provider::{Dynamic, Provider, ProviderKind};
use crate::scheduler::Scheduler;

/// One resolved node: the provider chosen for a key, with its argument keys
/// after variable substitution.
#[derive(Clone)]
pub(crate) struct TaskNode {
    pub key: Key,
    pub provider: Provider,
    pub args: Vec<(Cow<'static, str>, Key)>,
}

/// A directed edge of the graph, for introspection. Each node contributes
/// one `Produces` edge and one `FeedsInto` edge per argument.
#[derive(Debug)]
pub enum GraphEdge<'a> {
    /// The provider produces the value stored under `key`.
    Produces { provider: &'a Provider, key: &'a Key },
    /// The value stored under `key` is an argument of the provider.
    FeedsInto { key: &'a Key, provider: &'a Provider },
}

/// Holds a concrete task graph and the keys it was built for.
///
/// Task graphs are created by [`Pipeline::get`](crate::Pipeline::get). They
/// allow computing all or a subset of the keys present in the graph; the
/// graph is fixed, so keys the originating pipeline could have resolved but
/// that are not part of this graph fail with
/// [`TsugiteError::KeyNotInGraph`].
pub struct TaskGraph {
    pub(crate) graph: Graph<TaskNode, ()>,
    index: HashMap<Key, NodeIndex>,
    roots: Vec<Key>,
    scheduler: Arc<dyn Scheduler>,
}

impl TaskGraph {
    pub(crate) fn new(
        graph: Graph<TaskNode, ()>,
        index: HashMap<Key, NodeIndex>,
        roots: Vec<Key>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            graph,
            index,
            roots,
            scheduler,
        }
    }

    /// The keys this graph was built for.
    pub fn roots(&self) -> &[Key] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.index.contains_key(key)
    }

    /// Computes the roots recorded at build time, in request order.
    pub fn compute(&self) -> Result<Vec<(Key, Dynamic)>, TsugiteError> {
        self.compute_keys(&self.roots)
    }

    /// Computes a single key of this graph, root or intermediate.
    pub fn compute_key(&self, key: &Key) -> Result<Dynamic, TsugiteError> {
        let mut values = self.scheduler.get(self, std::slice::from_ref(key))?;
        Ok(values.remove(0))
    }

    /// Computes several keys in one scheduler invocation, preserving the
    /// requested order. Shared dependencies are evaluated once.
    pub fn compute_keys(&self, keys: &[Key]) -> Result<Vec<(Key, Dynamic)>, TsugiteError> {
        let values = self.scheduler.get(self, keys)?;
        Ok(keys.iter().cloned().zip(values).collect())
    }

    /// Iterates over the nodes as `(key, provider)` pairs.
    pub fn nodes(&self) -> impl Iterator<Item = (&Key, &Provider)> {
        self.graph
            .node_weights()
            .map(|node| (&node.key, &node.provider))
    }

    /// Iterates over the directed edges of the graph.
    pub fn edges(&self) -> impl Iterator<Item = GraphEdge<'_>> {
        self.graph.node_weights().flat_map(|node| {
            let produces = std::iter::once(GraphEdge::Produces {
                provider: &node.provider,
                key: &node.key,
            });
            let feeds = node.args.iter().map(move |(_, key)| GraphEdge::FeedsInto {
                key,
                provider: &node.provider,
            });
            produces.chain(feeds)
        })
    }

    /// A JSON description of the graph, with a `data` node per key, a `task`
    /// node per provider and the directed edges between them. Intended for
    /// external renderers.
    pub fn serialize(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct Node {
            id: String,
            kind: &'static str,
            label: String,
        }

        #[derive(Serialize)]
        struct Edge {
            source: String,
            target: String,
        }

        #[derive(Serialize)]
        struct Dump {
            directed: bool,
            multigraph: bool,
            nodes: Vec<Node>,
            edges: Vec<Edge>,
        }

        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let data_id = format!("data:{}", index.index());
            let task_id = format!("task:{}", index.index());

            nodes.push(Node {
                id: data_id.clone(),
                kind: "data",
                label: node.key.to_string(),
            });
            nodes.push(Node {
                id: task_id.clone(),
                kind: match node.provider.kind() {
                    ProviderKind::Function => "function",
                    ProviderKind::Parameter => "parameter",
                    ProviderKind::Table => "table",
                },
                label: node.provider.name().to_string(),
            });
            edges.push(Edge {
                source: task_id.clone(),
                target: data_id,
            });

            for (_, arg) in &node.args {
                let arg_index = self.index[arg];
                edges.push(Edge {
                    source: format!("data:{}", arg_index.index()),
                    target: task_id.clone(),
                });
            }
        }

        serde_json::to_value(Dump {
            directed: true,
            multigraph: false,
            nodes,
            edges,
        })
        .expect("task graph serialization cannot fail")
    }

    pub(crate) fn node(&self, index: NodeIndex) -> &TaskNode {
        &self.graph[index]
    }

    pub(crate) fn index_of(&self, key: &Key) -> Option<NodeIndex> {
        self.index.get(key).copied()
    }
}

impl fmt::Display for TaskGraph {
    /// Renders the graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.provider.name().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            let (source, target) = self
                .graph
                .edge_endpoints(edge)
                .expect("edge endpoints exist");
            let label = self.graph[source].key.to_string().replace('"', "\\\"");
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                source.index(),
                label,
                target.index()
            )?;
        }

        Ok(())
    }
}
