//! Indexed storage for providers.
//!
//! The registry keeps two tables: concrete providers, keyed by their full
//! output key, and generic providers, grouped under the [`Origin`] of their
//! output so the resolver can enumerate candidates for a parametrised
//! request. An applied output key without variables counts as concrete.

use std::collections::HashMap;

use crate::error::TsugiteError;
use crate::key::{Key, Origin};
use crate::provider::{Provider, ProviderKind};

/// Owns the registered providers of a pipeline.
///
/// Cloning a registry produces an independent copy: the tables are deep
/// copied, while the callbacks themselves are shared since they are
/// immutable contracts.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    concrete: HashMap<Key, Provider>,
    generic: HashMap<Origin, Vec<Provider>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under its output key.
    ///
    /// A concrete provider replaces any existing provider at the same key.
    /// A generic provider replaces the entry with an *identical* output key
    /// in its origin's list, otherwise it is appended.
    pub fn insert(&mut self, provider: Provider) -> Result<(), TsugiteError> {
        self.validate(&provider)?;

        let output = provider.output_key().clone();
        if output.contains_var() {
            let origin = *output.origin().expect("validated: generic output has an origin");
            let providers = self.generic.entry(origin).or_default();
            match providers.iter_mut().find(|p| p.output_key() == &output) {
                Some(existing) => *existing = provider,
                None => providers.push(provider),
            }
        } else {
            self.concrete.insert(output, provider);
        }

        Ok(())
    }

    /// Registers a stored value as a parameter provider for `key`.
    pub fn set_value<T: Send + Sync + 'static>(
        &mut self,
        key: Key,
        value: T,
    ) -> Result<(), TsugiteError> {
        self.insert(Provider::parameter(key, value))
    }

    pub(crate) fn get_concrete(&self, key: &Key) -> Option<&Provider> {
        self.concrete.get(key)
    }

    pub(crate) fn get_generic(&self, origin: &Origin) -> Option<&[Provider]> {
        self.generic.get(origin).map(Vec::as_slice)
    }

    /// Whether a provider is registered under exactly this output key.
    pub fn contains(&self, key: &Key) -> bool {
        if self.concrete.contains_key(key) {
            return true;
        }
        key.origin()
            .and_then(|origin| self.generic.get(origin))
            .is_some_and(|providers| providers.iter().any(|p| p.output_key() == key))
    }

    /// Removes and returns the provider registered under exactly this key.
    pub fn remove(&mut self, key: &Key) -> Option<Provider> {
        if let Some(provider) = self.concrete.remove(key) {
            return Some(provider);
        }
        let providers = self.generic.get_mut(key.origin()?)?;
        let position = providers.iter().position(|p| p.output_key() == key)?;
        Some(providers.remove(position))
    }

    pub fn len(&self) -> usize {
        self.concrete.len() + self.generic.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self, provider: &Provider) -> Result<(), TsugiteError> {
        let output = provider.output_key();

        if output.is_unit() {
            return Err(TsugiteError::InvalidProvider(format!(
                "provider '{}' has a unit output key",
                provider.name()
            )));
        }
        if output.is_var() {
            return Err(TsugiteError::InvalidProvider(format!(
                "provider '{}' has a bare type variable as its output key",
                provider.name()
            )));
        }
        if output.contains_var() && output.origin().is_none() {
            return Err(TsugiteError::InvalidProvider(format!(
                "provider '{}' has a generic output key without an origin",
                provider.name()
            )));
        }

        // Every variable of the inputs must be inferable from the output.
        let output_vars = output.free_vars();
        for (name, key) in provider.inputs() {
            for var in key.free_vars() {
                if !output_vars.contains(&var) {
                    return Err(TsugiteError::InvalidProvider(format!(
                        "input '{name}' of provider '{}' has type variable '{var}' \
                         absent from the output key",
                        provider.name()
                    )));
                }
            }
        }

        if let Some(returns) = provider.returns() {
            let expected = match output {
                Key::Nominal(nominal) => Some(nominal.id()),
                Key::Applied(applied) => Some(applied.origin().id()),
                Key::Item(item) => match item.inner() {
                    Key::Nominal(nominal) => Some(nominal.id()),
                    Key::Applied(applied) => Some(applied.origin().id()),
                    _ => None,
                },
                Key::Var(_) => None,
            };

            if expected.is_some_and(|id| id != returns.id) {
                return Err(match provider.kind() {
                    ProviderKind::Function => TsugiteError::InvalidProvider(format!(
                        "provider '{}' returns '{}' which does not match its output key '{output}'",
                        provider.name(),
                        returns.name
                    )),
                    ProviderKind::Parameter | ProviderKind::Table => {
                        TsugiteError::KeyTypeMismatch {
                            key: output.clone(),
                            value_type: returns.name.to_string(),
                        }
                    }
                });
            }
        }

        Ok(())
    }
}
