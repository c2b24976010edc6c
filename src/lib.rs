#![deny(unsafe_code, clippy::panic)]

//! Type-directed task graph builder.
//!
//! `tsugite` assembles a Directed Acyclic Graph of computations from a set
//! of *providers*: functions whose declared input and output type keys act
//! as the wiring. Dependencies are never spelled out by hand; a provider
//! consuming `i64` is wired to whatever provider produces `i64`. Generic
//! providers declare type variables in their keys and are instantiated on
//! demand when a request forces a binding.
//!
//! # Example
//!
//! ```
//! use tsugite::{Key, Pipeline, Provider, arg};
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.insert(Provider::function("int_source", (), Key::of::<i64>(), |()| Ok(3i64)))?;
//! pipeline.insert(Provider::function(
//!     "halve",
//!     (arg::<i64>("x", Key::of::<i64>()),),
//!     Key::of::<f64>(),
//!     |(x,)| Ok(0.5 * *x as f64),
//! ))?;
//!
//! let value = pipeline.compute(Key::of::<f64>())?;
//! assert_eq!(value.downcast_ref::<f64>(), Some(&1.5));
//! # Ok::<(), tsugite::TsugiteError>(())
//! ```
//!
//! Requesting a key builds a [`TaskGraph`] first; the graph can be computed,
//! inspected, rendered or serialized. Execution goes through a pluggable
//! [`Scheduler`]; the default backend runs independent providers in
//! parallel (feature `parallel`), with a sequential backend always
//! available.

pub mod error;
mod graph;
mod key;
mod pipeline;
mod provider;
mod registry;
mod resolver;
mod scheduler;
mod utils;

pub use crate::error::TsugiteError;
pub use crate::graph::{GraphEdge, TaskGraph};
pub use crate::key::{Applied, Bindings, Item, Key, Label, Nominal, Origin, TypeVar};
pub use crate::pipeline::{GetOptions, Pipeline};
pub use crate::provider::{
    AnyArg, Arg, Callable, Dynamic, Inputs, Provider, ProviderKind, Slot, any_arg, arg,
};
pub use crate::registry::Registry;
pub use crate::resolver::{FailAtBuild, FailAtCompute, MissingHandler};
#[cfg(feature = "parallel")]
pub use crate::scheduler::ParallelScheduler;
pub use crate::scheduler::{Scheduler, SequentialScheduler};
