//! The pipeline: the user-facing facade over registry, resolver and
//! scheduler.
//!
//! A [`Pipeline`] owns a [`Registry`] of providers and knows how to turn a
//! set of requested keys into a [`TaskGraph`] and execute it. Providers are
//! wired together purely by their declared keys; registering them in any
//! order works, and registering a provider for a key that already has one
//! replaces it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TsugiteError;
use crate::graph::TaskGraph;
use crate::key::{Key, Label, Nominal};
use crate::provider::{Callable, Dynamic, Provider};
use crate::registry::Registry;
use crate::resolver::{FailAtBuild, MissingHandler, Resolver};
use crate::scheduler::{Scheduler, into_execution_error};

fn default_scheduler() -> Arc<dyn Scheduler> {
    #[cfg(feature = "parallel")]
    return Arc::new(crate::scheduler::ParallelScheduler);
    #[cfg(not(feature = "parallel"))]
    Arc::new(crate::scheduler::SequentialScheduler)
}

/// Options for [`Pipeline::get_with`]. The defaults are the pipeline's own
/// scheduler and the fail-at-build missing-dependency strategy.
#[derive(Default)]
pub struct GetOptions {
    pub scheduler: Option<Arc<dyn Scheduler>>,
    pub handler: Option<Box<dyn MissingHandler>>,
}

/// A set of providers, assembled on demand into task graphs.
///
/// Cloning a pipeline yields an independent copy: inserting into or removing
/// from either side never affects the other.
#[derive(Clone)]
pub struct Pipeline {
    registry: Registry,
    scheduler: Arc<dyn Scheduler>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            scheduler: default_scheduler(),
        }
    }

    /// Builds a pipeline from providers, registered in iteration order.
    pub fn from_providers(
        providers: impl IntoIterator<Item = Provider>,
    ) -> Result<Self, TsugiteError> {
        let mut pipeline = Self::new();
        for provider in providers {
            pipeline.insert(provider)?;
        }
        Ok(pipeline)
    }

    /// Replaces the scheduler used by graphs built from this pipeline.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Validates and registers a provider. See [`Registry::insert`] for the
    /// replacement semantics.
    pub fn insert(&mut self, provider: Provider) -> Result<(), TsugiteError> {
        self.registry.insert(provider)
    }

    /// Registers `value` as a parameter provider for `key`.
    pub fn set<T: Send + Sync + 'static>(
        &mut self,
        key: Key,
        value: T,
    ) -> Result<(), TsugiteError> {
        self.registry.set_value(key, value)
    }

    /// Registers the rows of a table under the label group `L`, one provider
    /// per row. Returns the item keys in row order, so individual rows can
    /// be requested later.
    pub fn set_table<L: 'static, T: Send + Sync + 'static>(
        &mut self,
        rows: impl IntoIterator<Item = T>,
    ) -> Result<Vec<Key>, TsugiteError> {
        let group = Nominal::of::<L>();
        let inner = Key::of::<T>();

        let mut keys = Vec::new();
        for (index, row) in rows.into_iter().enumerate() {
            let provider = Provider::table_row(vec![Label { group, index }], inner.clone(), row);
            let key = provider.output_key().clone();
            self.registry.insert(provider)?;
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.registry.contains(key)
    }

    /// Removes and returns the provider registered under exactly this key.
    pub fn remove(&mut self, key: &Key) -> Option<Provider> {
        self.registry.remove(key)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Builds the task graph for the requested keys without executing it.
    pub fn get(&self, keys: impl IntoIterator<Item = Key>) -> Result<TaskGraph, TsugiteError> {
        self.get_with(keys, GetOptions::default())
    }

    /// Like [`get`](Self::get), with an explicit scheduler or
    /// missing-dependency strategy.
    pub fn get_with(
        &self,
        keys: impl IntoIterator<Item = Key>,
        options: GetOptions,
    ) -> Result<TaskGraph, TsugiteError> {
        let keys: Vec<Key> = keys.into_iter().collect();
        let handler: Box<dyn MissingHandler> = options
            .handler
            .unwrap_or_else(|| Box::new(FailAtBuild));
        let scheduler = options
            .scheduler
            .unwrap_or_else(|| self.scheduler.clone());

        let resolver = Resolver::new(&self.registry, handler.as_ref());
        let (graph, index) = resolver.resolve(&keys)?;
        Ok(TaskGraph::new(graph, index, keys, scheduler))
    }

    /// Builds and computes the graph for a single key.
    pub fn compute(&self, key: Key) -> Result<Dynamic, TsugiteError> {
        let graph = self.get([key.clone()])?;
        graph.compute_key(&key)
    }

    /// Builds and computes one graph for several keys; shared intermediates
    /// are evaluated once. The result preserves the request order.
    pub fn compute_many(
        &self,
        keys: impl IntoIterator<Item = Key>,
    ) -> Result<Vec<(Key, Dynamic)>, TsugiteError> {
        let keys: Vec<Key> = keys.into_iter().collect();
        let graph = self.get(keys.clone())?;
        graph.compute_keys(&keys)
    }

    /// Resolves the declared inputs of every callable in a single graph,
    /// computes it, then invokes the callables in order with the resolved
    /// values and returns their results.
    ///
    /// All providers finish before the first callable runs, and inputs
    /// shared between callables are computed once.
    pub fn bind_and_call(
        &self,
        callables: impl IntoIterator<Item = Callable>,
    ) -> Result<Vec<Dynamic>, TsugiteError> {
        let callables: Vec<Callable> = callables.into_iter().collect();

        let mut keys: Vec<Key> = Vec::new();
        for callable in &callables {
            for (_, key) in callable.inputs() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        let values: HashMap<Key, Dynamic> = if keys.is_empty() {
            HashMap::new()
        } else {
            self.compute_many(keys)?.into_iter().collect()
        };

        let mut outputs = Vec::with_capacity(callables.len());
        for callable in &callables {
            let args: Vec<Dynamic> = callable
                .inputs()
                .iter()
                .map(|(_, key)| values[key].clone())
                .collect();
            let value = callable
                .call(&args)
                .map_err(|err| into_execution_error(err, callable.name()))?;
            outputs.push(value);
        }
        Ok(outputs)
    }
}
