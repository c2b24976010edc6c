//! The type-directed resolver.
//!
//! Given a requested key and a registry snapshot, the resolver picks the
//! provider that produces the key, binds its type variables by unifying the
//! provider's output key against the request, substitutes the bindings into
//! the input keys, and recurses until every dependency has a node. The
//! result is a task graph keyed by type: each key is resolved at most once,
//! so intermediates shared by several consumers appear exactly once.
//!
//! Revisiting a key that is currently being expanded simply wires an edge to
//! its existing node: a cyclic pipeline still builds a graph, and the cycle
//! is only rejected when the graph is executed. This keeps broken pipelines
//! inspectable.

use std::collections::HashMap;

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use tracing::debug;

use crate::error::TsugiteError;
use crate::graph::TaskNode;
use crate::key::{Bindings, Key};
use crate::provider::Provider;
use crate::registry::Registry;

/// Strategy for keys that have no provider.
///
/// Invoked by the resolver whenever candidate selection comes up empty.
pub trait MissingHandler: Send + Sync {
    fn handle(&self, key: &Key) -> Result<Provider, TsugiteError>;
}

/// Fails resolution immediately with [`TsugiteError::UnsatisfiedRequirement`].
/// This is the default strategy.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailAtBuild;

impl MissingHandler for FailAtBuild {
    fn handle(&self, key: &Key) -> Result<Provider, TsugiteError> {
        Err(TsugiteError::UnsatisfiedRequirement(key.clone()))
    }
}

/// Substitutes a sentinel provider that fails when evaluated, so partial
/// graphs can still be built and inspected.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailAtCompute;

impl MissingHandler for FailAtCompute {
    fn handle(&self, key: &Key) -> Result<Provider, TsugiteError> {
        let missing = key.clone();
        Ok(Provider::dynamic(
            format!("missing({key})"),
            vec![],
            key.clone(),
            move |_| Err(TsugiteError::UnsatisfiedRequirement(missing.clone()).into()),
        ))
    }
}

/// Unifies a provider's output key (`pattern`) against a requested key.
///
/// Walks both keys in lockstep; a variable in the pattern binds to whatever
/// occupies the same position in the request. Fails on origin or arity
/// mismatches, on conflicting bindings for the same variable, and on
/// bindings that fall outside a variable's constraint set.
pub(crate) fn unify(pattern: &Key, request: &Key, bindings: &mut Bindings) -> bool {
    match (pattern, request) {
        (Key::Var(var), _) => {
            if let Some(constraints) = var.constraints()
                && !constraints.contains(request)
            {
                return false;
            }
            match bindings.get(var) {
                Some(bound) => bound == request,
                None => {
                    bindings.insert(var.clone(), request.clone());
                    true
                }
            }
        }
        (Key::Nominal(a), Key::Nominal(b)) => a == b,
        (Key::Applied(a), Key::Applied(b)) => {
            a.origin() == b.origin()
                && a.args().len() == b.args().len()
                && a.args()
                    .iter()
                    .zip(b.args())
                    .all(|(p, r)| unify(p, r, bindings))
        }
        (Key::Item(a), Key::Item(b)) => {
            a.labels() == b.labels() && unify(a.inner(), b.inner(), bindings)
        }
        _ => false,
    }
}

// Like `unify`, but the term may itself contain variables and constraint
// sets are ignored. Used only for the specificity order.
fn matches_onto(pattern: &Key, term: &Key, bindings: &mut Bindings) -> bool {
    match (pattern, term) {
        (Key::Var(var), _) => match bindings.get(var) {
            Some(bound) => bound == term,
            None => {
                bindings.insert(var.clone(), term.clone());
                true
            }
        },
        (Key::Nominal(a), Key::Nominal(b)) => a == b,
        (Key::Applied(a), Key::Applied(b)) => {
            a.origin() == b.origin()
                && a.args().len() == b.args().len()
                && a.args()
                    .iter()
                    .zip(b.args())
                    .all(|(p, t)| matches_onto(p, t, bindings))
        }
        (Key::Item(a), Key::Item(b)) => {
            a.labels() == b.labels() && matches_onto(a.inner(), b.inner(), bindings)
        }
        _ => false,
    }
}

/// Whether `a` is strictly more specific than `b`: `a` can be obtained from
/// `b` by substituting variables of `b`, with at least one variable bound to
/// a non-variable key.
pub(crate) fn more_specific(a: &Key, b: &Key) -> bool {
    let mut bindings = Bindings::new();
    matches_onto(b, a, &mut bindings) && bindings.values().any(|key| !key.is_var())
}

/// Resolves requested keys against a registry into a task graph.
pub(crate) struct Resolver<'a> {
    registry: &'a Registry,
    handler: &'a dyn MissingHandler,
    graph: Graph<TaskNode, ()>,
    resolved: HashMap<Key, NodeIndex>,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a Registry, handler: &'a dyn MissingHandler) -> Self {
        Self {
            registry,
            handler,
            graph: Graph::new(),
            resolved: HashMap::new(),
        }
    }

    /// Expands all requested keys and returns the graph with its key index.
    pub fn resolve(
        mut self,
        keys: &[Key],
    ) -> Result<(Graph<TaskNode, ()>, HashMap<Key, NodeIndex>), TsugiteError> {
        for key in keys {
            self.request(key)?;
        }
        Ok((self.graph, self.resolved))
    }

    fn request(&mut self, key: &Key) -> Result<NodeIndex, TsugiteError> {
        if let Some(&index) = self.resolved.get(key) {
            return Ok(index);
        }

        let (provider, bindings) = self.select(key)?;

        let mut args = Vec::with_capacity(provider.inputs().len());
        for (name, input) in provider.inputs() {
            let bound = input.substitute(&bindings);
            if let Some(var) = bound.free_vars().into_iter().next() {
                return Err(TsugiteError::UnboundTypeVar {
                    provider: provider.name().to_string(),
                    variable: var.name().to_string(),
                });
            }
            args.push((name.clone(), bound));
        }

        debug!(key = %key, provider = %provider.name(), "resolved");

        // The node is registered before its dependencies are expanded, so a
        // request that loops back onto an in-progress key reuses the node
        // instead of recursing forever.
        let index = self.graph.add_node(TaskNode {
            key: key.clone(),
            provider,
            args: args.clone(),
        });
        self.resolved.insert(key.clone(), index);

        for (_, dependency) in &args {
            let dep_index = self.request(dependency)?;
            self.graph.add_edge(dep_index, index, ());
        }

        Ok(index)
    }

    /// Candidate selection: a direct hit in the concrete table wins,
    /// otherwise the request's origin is matched against the generic table
    /// and the most specific unifying candidate is chosen.
    fn select(&self, key: &Key) -> Result<(Provider, Bindings), TsugiteError> {
        if let Some(provider) = self.registry.get_concrete(key) {
            return Ok((provider.clone(), Bindings::new()));
        }

        let candidates = key
            .origin()
            .and_then(|origin| self.registry.get_generic(origin));
        let Some(candidates) = candidates else {
            return Ok((self.handler.handle(key)?, Bindings::new()));
        };

        let mut matched: Vec<(&Provider, Bindings)> = Vec::new();
        for provider in candidates {
            let mut bindings = Bindings::new();
            if unify(provider.output_key(), key, &mut bindings) {
                matched.push((provider, bindings));
            }
        }
        if matched.is_empty() {
            return Ok((self.handler.handle(key)?, Bindings::new()));
        }

        // Specialisation tie-breaking: drop every candidate whose output is
        // strictly less specific than another candidate's.
        let survivors: Vec<&(&Provider, Bindings)> = matched
            .iter()
            .filter(|(provider, _)| {
                !matched.iter().any(|(other, _)| {
                    !std::ptr::eq(*provider, *other)
                        && more_specific(other.output_key(), provider.output_key())
                })
            })
            .collect();

        match survivors.as_slice() {
            [] => Err(TsugiteError::UnsatisfiedRequirement(key.clone())),
            [(provider, bindings)] => Ok(((*provider).clone(), bindings.clone())),
            several => Err(TsugiteError::AmbiguousProvider {
                key: key.clone(),
                candidates: several
                    .iter()
                    .map(|(provider, _)| provider.name().to_string())
                    .collect(),
            }),
        }
    }
}
