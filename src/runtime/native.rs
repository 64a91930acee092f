//! Native implementations for member references.
//!
//! Patches call out of the host module through `MemberRef` tokens. At run time each
//! reference is bound by its `Type::Name` to a [`NativeMethod`] in a [`NativeRegistry`].
//! The registry is an explicit object owned by whoever builds the [`Runtime`]; there is
//! no process-wide table.
//!
//! A [`CallbackChain`] is a native that fans out to any number of delegates. Feature
//! modules append delegates to a chain without knowing about each other, and the
//! chain runs all of them, in registration order, once per call.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::{atomic::{AtomicI32, Ordering}, Arc};
//! use cilsplice::runtime::{CallbackChain, NativeRegistry};
//!
//! let hits = Arc::new(AtomicI32::new(0));
//! let chain = Arc::new(CallbackChain::new());
//! let counter = hits.clone();
//! chain.add(move |_call| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//!     Ok(None)
//! });
//!
//! let registry = NativeRegistry::new();
//! registry.register("Mods.Hooks::OnCompute", chain.clone());
//! assert!(registry.contains("Mods.Hooks::OnCompute"));
//! assert_eq!(chain.len(), 1);
//! ```

use std::{fmt, sync::Arc};

use dashmap::DashMap;

use crate::{
    runtime::{
        interpreter::{self, Frame},
        value::{Pointer, Value},
        Runtime,
    },
    Result,
};

/// A method implemented in Rust.
pub trait NativeMethod: Send + Sync {
    /// Run the method.
    ///
    /// Returns the value to push for non-void signatures. `None` for a non-void
    /// signature is an error at the call site unless another part of a chain
    /// supplied a result.
    ///
    /// # Errors
    ///
    /// Any error aborts the running invocation.
    fn invoke(&self, call: &mut NativeCall<'_>) -> Result<Option<Value>>;
}

struct NativeFn<F>(F);

impl<F> NativeMethod for NativeFn<F>
where
    F: Fn(&mut NativeCall<'_>) -> Result<Option<Value>> + Send + Sync,
{
    fn invoke(&self, call: &mut NativeCall<'_>) -> Result<Option<Value>> {
        (self.0)(call)
    }
}

/// Wrap a closure as a [`NativeMethod`].
pub fn native_fn<F>(f: F) -> Arc<dyn NativeMethod>
where
    F: Fn(&mut NativeCall<'_>) -> Result<Option<Value>> + Send + Sync + 'static,
{
    Arc::new(NativeFn(f))
}

/// The state a native sees while it runs.
///
/// Gives access to the arguments, to the partial result of a [`CallbackChain`], and
/// through [`Pointer`]s to locals and arguments of the managed frames that called it.
pub struct NativeCall<'a> {
    runtime: &'a Runtime,
    frames: &'a mut [Frame],
    name: &'a str,
    args: Vec<Value>,
    result: Option<Value>,
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(
        runtime: &'a Runtime,
        frames: &'a mut [Frame],
        name: &'a str,
        args: Vec<Value>,
    ) -> Self {
        NativeCall {
            runtime,
            frames,
            name,
            args,
            result: None,
        }
    }

    /// `Type::Name` of the member reference being called.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    /// The runtime executing the call.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        self.runtime
    }

    /// All arguments, `this` first for instance signatures.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Argument `index`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Execution`] if there is no such argument.
    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args.get(index).ok_or_else(|| {
            execution_error!("{} has no argument {} ({} passed)", self.name, index, self.args.len())
        })
    }

    /// Read through a by-reference argument.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Execution`] if the pointer no longer refers to live storage.
    pub fn load(&self, pointer: &Pointer) -> Result<Value> {
        interpreter::load(self.runtime, self.frames, pointer)
    }

    /// Write through a by-reference argument.
    ///
    /// # Errors
    ///
    /// See [`NativeCall::load`].
    pub fn store(&mut self, pointer: &Pointer, value: Value) -> Result<()> {
        interpreter::store(self.runtime, self.frames, pointer, value)
    }

    /// The result produced so far by earlier parts of a chain.
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Override the result.
    pub fn set_result(&mut self, value: Value) {
        self.result = Some(value);
    }

    pub(crate) fn run(&mut self, native: &dyn NativeMethod) -> Result<Option<Value>> {
        if let Some(value) = native.invoke(self)? {
            self.result = Some(value);
        }
        Ok(self.result.take())
    }
}

/// Natives keyed by `Type::Name`.
#[derive(Default)]
pub struct NativeRegistry {
    natives: DashMap<String, Arc<dyn NativeMethod>>,
}

impl NativeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `native`, returning the previous binding.
    pub fn register(
        &self,
        name: impl Into<String>,
        native: Arc<dyn NativeMethod>,
    ) -> Option<Arc<dyn NativeMethod>> {
        let name = name.into();
        log::debug!("registered native {name}");
        self.natives.insert(name, native)
    }

    /// Bind `name` to a closure.
    pub fn register_fn<F>(&self, name: impl Into<String>, f: F) -> Option<Arc<dyn NativeMethod>>
    where
        F: Fn(&mut NativeCall<'_>) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.register(name, native_fn(f))
    }

    /// The native bound to `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn NativeMethod>> {
        self.natives.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns true if `name` is bound.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.natives.contains_key(name)
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.natives.len()
    }

    /// Returns true if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.natives.is_empty()
    }
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.natives.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("NativeRegistry").field("natives", &names).finish()
    }
}

/// An append-only list of delegates behind one native binding.
///
/// On each call the optional base runs first, then every delegate in the order it
/// was added, each exactly once. A delegate that returns `Some` replaces the result;
/// later delegates see it through [`NativeCall::result`]. Delegates can be added
/// while other threads are running the chain.
#[derive(Default)]
pub struct CallbackChain {
    base: Option<Arc<dyn NativeMethod>>,
    delegates: boxcar::Vec<Arc<dyn NativeMethod>>,
}

impl CallbackChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chain whose base implementation runs before the delegates.
    #[must_use]
    pub fn with_base(base: Arc<dyn NativeMethod>) -> Self {
        CallbackChain {
            base: Some(base),
            delegates: boxcar::Vec::new(),
        }
    }

    /// Append a closure delegate, returning its position in the chain.
    pub fn add<F>(&self, f: F) -> usize
    where
        F: Fn(&mut NativeCall<'_>) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.push(native_fn(f))
    }

    /// Append a delegate, returning its position in the chain.
    pub fn push(&self, delegate: Arc<dyn NativeMethod>) -> usize {
        self.delegates.push(delegate)
    }

    /// Number of delegates, not counting the base.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delegates.count()
    }

    /// Returns true if no delegate was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NativeMethod for CallbackChain {
    fn invoke(&self, call: &mut NativeCall<'_>) -> Result<Option<Value>> {
        if let Some(base) = &self.base {
            if let Some(value) = base.invoke(call)? {
                call.set_result(value);
            }
        }
        for (_, delegate) in self.delegates.iter() {
            if let Some(value) = delegate.invoke(call)? {
                call.set_result(value);
            }
        }
        Ok(call.result().cloned())
    }
}

impl fmt::Debug for CallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackChain")
            .field("base", &self.base.is_some())
            .field("delegates", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn run(native: &dyn NativeMethod, args: Vec<Value>) -> Result<Option<Value>> {
        let runtime = Runtime::new();
        let mut frames: Vec<Frame> = Vec::new();
        let mut call = NativeCall::new(&runtime, &mut frames, "Test::Call", args);
        call.run(native)
    }

    #[test]
    fn chain_runs_each_delegate_once_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain = CallbackChain::new();
        for id in 0..3 {
            let order = order.clone();
            chain.add(move |_| {
                order.lock().unwrap().push(id);
                Ok(None)
            });
        }

        assert_eq!(run(&chain, vec![]).unwrap(), None);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn later_delegates_see_and_override_result() {
        let chain = CallbackChain::with_base(native_fn(|call| Ok(Some(call.arg(0)?.clone()))));
        chain.add(|call| {
            let doubled = call.result().map_or(Ok(0), Value::as_i32)? * 2;
            Ok(Some(Value::I32(doubled)))
        });
        chain.add(|_| Ok(None));

        assert_eq!(run(&chain, vec![Value::I32(21)]).unwrap(), Some(Value::I32(42)));
        assert!(run(&chain, vec![]).is_err());
    }

    #[test]
    fn registry_lookup() {
        let registry = NativeRegistry::new();
        assert!(registry.is_empty());
        assert!(registry
            .register_fn("Mods.Hooks::Zero", |_| Ok(Some(Value::I32(0))))
            .is_none());
        assert!(registry
            .register("Mods.Hooks::Zero", Arc::new(CallbackChain::new()))
            .is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("Mods.Hooks::Other").is_none());
    }
}
