//! The provider model.
//!
//! A [`Provider`] is a unit of work that produces a value for its declared
//! output [`Key`], given values for its declared input keys. Providers are
//! organized by the resolver into a Directed Acyclic Graph where the
//! dependency edges are inferred purely from the keys.
//!
//! ## Type erasure
//!
//! Under the hood, everything is type-erased. Values travel through the graph
//! as [`Dynamic`] (`Arc<dyn Any + Send + Sync>`).
//!
//! Typed callbacks bridge this gap through the [`Inputs`] trait:
//!
//! * **Compile-time**: a tuple of [`arg`] slots carries the concrete type of
//!   each argument, so the callback receives `(&A, &B)` rather than erased
//!   values.
//! * **Runtime**: [`Inputs::resolve`] performs the `downcast_ref` logic. It
//!   acts as the safe bridge and only fails if a provider was registered
//!   under a key that does not match its actual value type, which the
//!   registry validates up front wherever the type is statically known.
//!
//! Generic providers, whose argument and return types depend on how their
//! variables are bound, use [`any_arg`] slots or the fully erased
//! [`Provider::dynamic`] constructor and handle [`Dynamic`] values directly.

use std::any::{Any, TypeId, type_name};
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::key::{Key, Label};

pub type Dynamic = Arc<dyn Any + Send + Sync>;

type Callback = Arc<dyn Fn(&[Dynamic]) -> anyhow::Result<Dynamic> + Send + Sync>;

/// How a provider produces its value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProviderKind {
    /// A function of its declared inputs.
    Function,
    /// A stored value; arguments are ignored.
    Parameter,
    /// A stored table row addressed by an item key.
    Table,
}

/// The concrete return type of a provider, when statically known.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReturnType {
    pub id: TypeId,
    pub name: &'static str,
}

impl ReturnType {
    fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

/// A registered producer of values for one output key.
#[derive(Clone)]
pub struct Provider {
    name: Cow<'static, str>,
    kind: ProviderKind,
    inputs: Vec<(Cow<'static, str>, Key)>,
    output: Key,
    labels: Vec<Label>,
    returns: Option<ReturnType>,
    callback: Callback,
}

impl Provider {
    /// A function provider with a typed callback.
    ///
    /// `inputs` is a tuple of [`arg`]/[`any_arg`] slots; the callback receives
    /// the resolved tuple and returns the value for `output`.
    pub fn function<D, F, R>(
        name: impl Into<Cow<'static, str>>,
        inputs: D,
        output: Key,
        callback: F,
    ) -> Self
    where
        D: Inputs + Send + Sync + 'static,
        F: for<'a> Fn(D::Output<'a>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let declared = inputs.keys();
        let callback: Callback = Arc::new(move |values: &[Dynamic]| {
            let resolved = inputs.resolve(values);
            let output = callback(resolved)?;
            Ok(Arc::new(output) as Dynamic)
        });

        Self {
            name: name.into(),
            kind: ProviderKind::Function,
            inputs: declared,
            output,
            labels: Vec::new(),
            returns: Some(ReturnType::of::<R>()),
            callback,
        }
    }

    /// A function provider with a fully erased callback.
    ///
    /// This is the constructor for generic providers: when input or output
    /// types vary with the variable bindings, the callback works on
    /// [`Dynamic`] values directly and no return type is recorded.
    pub fn dynamic<F>(
        name: impl Into<Cow<'static, str>>,
        inputs: impl IntoIterator<Item = (&'static str, Key)>,
        output: Key,
        callback: F,
    ) -> Self
    where
        F: Fn(&[Dynamic]) -> anyhow::Result<Dynamic> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: ProviderKind::Function,
            inputs: inputs
                .into_iter()
                .map(|(name, key)| (Cow::Borrowed(name), key))
                .collect(),
            output,
            labels: Vec::new(),
            returns: None,
            callback: Arc::new(callback),
        }
    }

    /// A parameter provider wrapping a stored value.
    pub fn parameter<T: Send + Sync + 'static>(key: Key, value: T) -> Self {
        let stored: Dynamic = Arc::new(value);
        Self {
            name: format!("parameter({key})").into(),
            kind: ProviderKind::Parameter,
            inputs: Vec::new(),
            output: key,
            labels: Vec::new(),
            returns: Some(ReturnType::of::<T>()),
            callback: Arc::new(move |_| Ok(stored.clone())),
        }
    }

    /// A table row stored under the item key `(labels, inner)`.
    pub fn table_row<T: Send + Sync + 'static>(labels: Vec<Label>, inner: Key, value: T) -> Self {
        let key = Key::item(labels.clone(), inner);
        let stored: Dynamic = Arc::new(value);
        Self {
            name: format!("table({key})").into(),
            kind: ProviderKind::Table,
            inputs: Vec::new(),
            output: key,
            labels,
            returns: Some(ReturnType::of::<T>()),
            callback: Arc::new(move |_| Ok(stored.clone())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn output_key(&self) -> &Key {
        &self.output
    }

    /// Declared inputs, ordered by argument position.
    pub fn inputs(&self) -> &[(Cow<'static, str>, Key)] {
        &self.inputs
    }

    /// Label metadata; empty unless this is a table row.
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Whether the output key contains type variables.
    pub fn is_generic(&self) -> bool {
        self.output.contains_var()
    }

    pub(crate) fn returns(&self) -> Option<&ReturnType> {
        self.returns.as_ref()
    }

    /// Invokes the callback with values matching the declared input order.
    pub fn call(&self, values: &[Dynamic]) -> anyhow::Result<Dynamic> {
        (self.callback)(values)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

/// A callable bound by [`Pipeline::bind_and_call`](crate::Pipeline::bind_and_call).
///
/// Like a [`Provider`], it declares input keys that the pipeline resolves,
/// but it has no output key and its result is handed back to the caller
/// instead of entering the graph.
#[derive(Clone)]
pub struct Callable {
    name: Cow<'static, str>,
    inputs: Vec<(Cow<'static, str>, Key)>,
    callback: Callback,
}

impl Callable {
    pub fn new<D, F, R>(name: impl Into<Cow<'static, str>>, inputs: D, callback: F) -> Self
    where
        D: Inputs + Send + Sync + 'static,
        F: for<'a> Fn(D::Output<'a>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let declared = inputs.keys();
        let callback: Callback = Arc::new(move |values: &[Dynamic]| {
            let resolved = inputs.resolve(values);
            let output = callback(resolved)?;
            Ok(Arc::new(output) as Dynamic)
        });

        Self {
            name: name.into(),
            inputs: declared,
            callback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[(Cow<'static, str>, Key)] {
        &self.inputs
    }

    pub(crate) fn call(&self, values: &[Dynamic]) -> anyhow::Result<Dynamic> {
        (self.callback)(values)
    }
}

/// One declared argument of a typed callback.
pub trait Slot: Send + Sync {
    /// The resolved borrow handed to the callback.
    type Output<'a>;

    fn name(&self) -> Cow<'static, str>;
    fn key(&self) -> Key;
    fn downcast<'a>(&self, value: &'a Dynamic) -> Self::Output<'a>;
}

/// A typed argument slot; resolves to `&T`.
pub struct Arg<T> {
    name: Cow<'static, str>,
    key: Key,
    _phantom: PhantomData<fn() -> T>,
}

/// Declares an argument named `name` of type `T`, wired to `key`.
pub fn arg<T>(name: impl Into<Cow<'static, str>>, key: Key) -> Arg<T> {
    Arg {
        name: name.into(),
        key,
        _phantom: PhantomData,
    }
}

impl<T: Send + Sync + 'static> Slot for Arg<T> {
    type Output<'a> = &'a T;

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn key(&self) -> Key {
        self.key.clone()
    }

    fn downcast<'a>(&self, value: &'a Dynamic) -> &'a T {
        value
            .downcast_ref::<T>()
            .expect("type mismatch in dependency resolution")
    }
}

/// An erased argument slot; resolves to `&Dynamic`.
///
/// Useful in generic providers for arguments whose runtime type depends on
/// the variable binding.
pub struct AnyArg {
    name: Cow<'static, str>,
    key: Key,
}

/// Declares an erased argument named `name`, wired to `key`.
pub fn any_arg(name: impl Into<Cow<'static, str>>, key: Key) -> AnyArg {
    AnyArg {
        name: name.into(),
        key,
    }
}

impl Slot for AnyArg {
    type Output<'a> = &'a Dynamic;

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn key(&self) -> Key {
        self.key.clone()
    }

    fn downcast<'a>(&self, value: &'a Dynamic) -> &'a Dynamic {
        value
    }
}

/// A trait that enables a collection of [`Slot`]s to be used as the declared
/// inputs of a typed callback.
///
/// This trait is implemented for tuples of slots, allowing them to be passed
/// as the `inputs` argument to [`Provider::function`] and [`Callable::new`].
/// It provides the logic to extract the declared keys and to resolve erased
/// values into the concrete tuple the callback expects.
pub trait Inputs {
    /// The resulting type when all inputs are resolved.
    /// For a tuple of slots, this is a tuple of `&'a T`s.
    type Output<'a>;

    /// Declared `(argument name, key)` pairs, in order.
    fn keys(&self) -> Vec<(Cow<'static, str>, Key)>;

    /// Takes a slice of type-erased values and resolves them into the
    /// concrete `Output` tuple.
    fn resolve<'a>(&self, values: &'a [Dynamic]) -> Self::Output<'a>;
}

impl Inputs for () {
    type Output<'a> = ();

    fn keys(&self) -> Vec<(Cow<'static, str>, Key)> {
        vec![]
    }

    fn resolve<'a>(&self, _values: &'a [Dynamic]) -> Self::Output<'a> {}
}

macro_rules! impl_inputs {
    ($($S:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($S),*> Inputs for ($($S,)*)
        where
            $($S: Slot),*
        {
            type Output<'a> = ($($S::Output<'a>,)*);

            fn keys(&self) -> Vec<(Cow<'static, str>, Key)> {
                let ($($S,)*) = self;
                vec![$(($S.name(), $S.key()),)*]
            }

            fn resolve<'a>(&self, values: &'a [Dynamic]) -> Self::Output<'a> {
                let ($($S,)*) = self;
                let mut iter = values.iter();
                ($({
                    let value = iter.next().expect("missing dependency value");
                    $S.downcast(value)
                },)*)
            }
        }
    };
}

impl_inputs!(A);
impl_inputs!(A, B);
impl_inputs!(A, B, C);
impl_inputs!(A, B, C, D);
impl_inputs!(A, B, C, D, E);
impl_inputs!(A, B, C, D, E, F);
impl_inputs!(A, B, C, D, E, F, G);
impl_inputs!(A, B, C, D, E, F, G, H);
impl_inputs!(A, B, C, D, E, F, G, H, I);
impl_inputs!(A, B, C, D, E, F, G, H, I, J);
impl_inputs!(A, B, C, D, E, F, G, H, I, J, K);
impl_inputs!(A, B, C, D, E, F, G, H, I, J, K, L);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_provider_resolves_typed_inputs() {
        let provider = Provider::function(
            "add",
            (
                arg::<i64>("x", Key::of::<i64>()),
                arg::<f64>("y", Key::of::<f64>()),
            ),
            Key::of::<String>(),
            |(x, y)| Ok(format!("{x};{y}")),
        );

        assert_eq!(provider.kind(), ProviderKind::Function);
        assert_eq!(provider.inputs().len(), 2);
        assert_eq!(provider.inputs()[0].0, "x");
        assert_eq!(provider.inputs()[1].1, Key::of::<f64>());

        let values: Vec<Dynamic> = vec![Arc::new(3i64), Arc::new(1.5f64)];
        let result = provider.call(&values).unwrap();
        assert_eq!(result.downcast_ref::<String>().unwrap(), "3;1.5");
    }

    #[test]
    fn test_parameter_provider_ignores_arguments() {
        let provider = Provider::parameter(Key::of::<i64>(), 42i64);

        assert_eq!(provider.kind(), ProviderKind::Parameter);
        assert!(provider.inputs().is_empty());

        let extra: Vec<Dynamic> = vec![Arc::new("noise".to_string())];
        let result = provider.call(&extra).unwrap();
        assert_eq!(result.downcast_ref::<i64>(), Some(&42));
    }

    #[test]
    fn test_dynamic_provider_passes_values_through() {
        let provider = Provider::dynamic(
            "first",
            vec![("x", Key::of::<i64>())],
            Key::of::<i64>(),
            |values| Ok(values[0].clone()),
        );

        assert!(provider.returns().is_none());
        let values: Vec<Dynamic> = vec![Arc::new(7i64)];
        let result = provider.call(&values).unwrap();
        assert_eq!(result.downcast_ref::<i64>(), Some(&7));
    }

    #[test]
    fn test_any_arg_slot_stays_erased() {
        let provider = Provider::function(
            "reveal",
            (any_arg("x", Key::of::<i64>()),),
            Key::of::<String>(),
            |(x,)| {
                let inner = x.downcast_ref::<i64>().expect("expected an i64");
                Ok(inner.to_string())
            },
        );

        let values: Vec<Dynamic> = vec![Arc::new(5i64)];
        let result = provider.call(&values).unwrap();
        assert_eq!(result.downcast_ref::<String>().unwrap(), "5");
    }

    #[test]
    fn test_generic_detection() {
        let t = crate::key::TypeVar::new("T");
        let origin = crate::key::Origin::of::<String>();

        let generic = Provider::dynamic("generic", vec![], origin.apply([t.key()]), |values| {
            Ok(values[0].clone())
        });
        assert!(generic.is_generic());

        let concrete = Provider::parameter(Key::of::<i64>(), 1i64);
        assert!(!concrete.is_generic());
    }

    #[test]
    fn test_callable_carries_inputs() {
        let callable = Callable::new(
            "double",
            (arg::<i64>("i", Key::of::<i64>()),),
            |(i,)| Ok(i * 2),
        );

        assert_eq!(callable.inputs().len(), 1);
        let values: Vec<Dynamic> = vec![Arc::new(3i64)];
        let result = callable.call(&values).unwrap();
        assert_eq!(result.downcast_ref::<i64>(), Some(&6));
    }

    #[test]
    fn test_table_row_carries_labels() {
        struct Rows;
        let label = Label {
            group: crate::key::Nominal::of::<Rows>(),
            index: 2,
        };
        let provider = Provider::table_row(vec![label], Key::of::<String>(), "row".to_string());

        assert_eq!(provider.kind(), ProviderKind::Table);
        assert_eq!(provider.labels(), &[label]);
        assert_eq!(
            provider.output_key(),
            &Key::item(vec![label], Key::of::<String>())
        );
    }
}
