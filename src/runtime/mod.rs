//! Runtime host for patched modules.
//!
//! The [`Runtime`] is the load-time half of the pipeline. It holds, per loaded module,
//! a metadata snapshot and a live method table of bodies; the interpreter reads bodies
//! from the table on every call, so a body installed by
//! [`crate::patch::PatchCoordinator::install`] takes effect on the next invocation of
//! that method without reloading anything.
//!
//! # Architecture
//!
//! - [`Runtime`] - Module snapshots, live method table, static storage, entry points
//! - [`RuntimeLimits`] - Instruction and call depth bounds per invocation
//! - [`NativeRegistry`], [`NativeMethod`], [`CallbackChain`] - Rust implementations of
//!   the member references patches call
//! - [`CapabilitySlot`] - Typed access to injected fields from Rust
//! - [`Value`], [`Pointer`], [`Object`], [`ObjectRef`] - The data model
//!
//! # Thread Safety
//!
//! All tables are [`dashmap::DashMap`]s and every accessor takes `&self`, so a
//! `Runtime` can be shared through an [`Arc`] and invoked from several threads.
//! Each object guards its field vector with a lock; nothing else is synchronized.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::{path::Path, sync::Arc};
//! use cilsplice::{
//!     metadata::image::AssemblyImage,
//!     runtime::{NativeRegistry, Runtime, Value},
//! };
//!
//! let natives = Arc::new(NativeRegistry::new());
//! natives.register_fn("Mods.Log::Write", |call| {
//!     println!("log: {}", call.arg(0)?);
//!     Ok(None)
//! });
//!
//! let runtime = Runtime::new().with_natives(natives);
//! runtime.load(AssemblyImage::from_file(Path::new("Host.img"))?)?;
//! let score = runtime.invoke("Host", "Game.Score", "Compute", &[Value::I32(3)])?;
//! # Ok::<(), cilsplice::Error>(())
//! ```

mod capability;
mod config;
mod interpreter;
mod native;
mod object;
mod value;

pub use capability::{CapabilitySlot, SlotValue};
pub use config::RuntimeLimits;
pub use native::{native_fn, CallbackChain, NativeCall, NativeMethod, NativeRegistry};
pub use object::{Object, ObjectRef};
pub use value::{Pointer, Value};

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

use crate::{
    metadata::{
        image::{AssemblyImage, FieldDefinition, TypeDefinition},
        method::MethodBody,
        token::Token,
    },
    runtime::interpreter::{Frame, Interpreter},
    Error, Result,
};

/// Identifies a method in the live method table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// Module name
    pub module: String,
    /// `MethodDef` token
    pub token: Token,
}

impl MethodKey {
    /// Create a key.
    #[must_use]
    pub fn new(module: impl Into<String>, token: Token) -> Self {
        MethodKey {
            module: module.into(),
            token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StaticKey {
    module: String,
    field: Token,
}

/// Executes loaded modules and accepts patched bodies while running.
pub struct Runtime {
    limits: RuntimeLimits,
    natives: Arc<NativeRegistry>,
    images: DashMap<String, Arc<AssemblyImage>>,
    methods: DashMap<MethodKey, Arc<MethodBody>>,
    statics: DashMap<StaticKey, Value>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime {
            limits: RuntimeLimits::default(),
            natives: Arc::new(NativeRegistry::new()),
            images: DashMap::new(),
            methods: DashMap::new(),
            statics: DashMap::new(),
        }
    }
}

impl Runtime {
    /// Create a runtime with default limits and an empty native registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the execution limits.
    #[must_use]
    pub fn with_limits(mut self, limits: RuntimeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Use `natives` to resolve member references.
    #[must_use]
    pub fn with_natives(mut self, natives: Arc<NativeRegistry>) -> Self {
        self.natives = natives;
        self
    }

    /// The execution limits.
    #[must_use]
    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    /// The native registry.
    #[must_use]
    pub fn natives(&self) -> &Arc<NativeRegistry> {
        &self.natives
    }

    /// Load a module, installing all its bodies and zeroing its statics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if a module with the same name is already loaded.
    pub fn load(&self, image: AssemblyImage) -> Result<()> {
        let name = image.name().to_string();
        match self.images.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(malformed_error!("Module {} is already loaded", name));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(image));
            }
        }

        let image = self.image(&name)?;
        let bodies = self.install_bodies(&image);
        self.allocate_statics(&image);
        log::info!("loaded module {} ({} bodies)", name, bodies);
        Ok(())
    }

    /// The current metadata snapshot of `module`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleNotLoaded`] if no module of that name was loaded.
    pub fn image(&self, module: &str) -> Result<Arc<AssemblyImage>> {
        self.images
            .get(module)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::ModuleNotLoaded(module.to_string()))
    }

    /// Replace the snapshot of an already loaded module with a patched image.
    ///
    /// Bodies that are new or differ from the installed ones go into the live method
    /// table, new static fields are zeroed, and the snapshot is swapped. Objects
    /// allocated before keep their old layout. Returns the number of bodies installed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleNotLoaded`] if the module was never loaded.
    pub fn install_image(&self, image: AssemblyImage) -> Result<usize> {
        let name = image.name().to_string();
        if !self.images.contains_key(&name) {
            return Err(Error::ModuleNotLoaded(name));
        }

        let image = Arc::new(image);
        let installed = self.install_bodies(&image);
        self.allocate_statics(&image);
        self.images.insert(name.clone(), image);

        log::info!("installed patched snapshot of {} ({} bodies)", name, installed);
        Ok(installed)
    }

    fn install_bodies(&self, image: &AssemblyImage) -> usize {
        let mut installed = 0;
        for ty in image.types() {
            for method in &ty.methods {
                let Some(body) = &method.body else {
                    continue;
                };
                let key = MethodKey::new(image.name(), method.token);
                let unchanged = self
                    .methods
                    .get(&key)
                    .is_some_and(|current| current.value().as_ref() == body);
                if !unchanged {
                    self.methods.insert(key, Arc::new(body.clone()));
                    installed += 1;
                }
            }
        }
        installed
    }

    fn allocate_statics(&self, image: &AssemblyImage) {
        for ty in image.types() {
            for field in ty.fields.iter().filter(|field| field.is_static()) {
                self.statics
                    .entry(StaticKey {
                        module: image.name().to_string(),
                        field: field.token,
                    })
                    .or_insert_with(|| Value::default_for(&field.field_type));
            }
        }
    }

    /// The body currently installed for `key`.
    #[must_use]
    pub fn method_body(&self, key: &MethodKey) -> Option<Arc<MethodBody>> {
        self.methods.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Install `body` for `key`, returning the body it replaces.
    ///
    /// The next call of the method runs the new body; calls already executing finish
    /// on the old one.
    pub fn install_body(&self, key: MethodKey, body: MethodBody) -> Option<Arc<MethodBody>> {
        log::debug!("installing body for {}:{}", key.module, key.token);
        self.methods.insert(key, Arc::new(body))
    }

    /// Call `type_name::method` of `module` with `args` (`this` first for instance
    /// methods).
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeNotFound`] or [`Error::MethodNotFound`] if the method does not
    /// exist, [`Error::Execution`] if the argument count is wrong or execution fails,
    /// [`Error::NativeNotFound`] for an unbound member reference and
    /// [`Error::LimitExceeded`] when a [`RuntimeLimits`] bound is hit.
    pub fn invoke(
        &self,
        module: &str,
        type_name: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Option<Value>> {
        let image = self.image(module)?;
        let definition = image.find_method(type_name, method)?;
        let ty = image
            .find_type(type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;

        if args.len() != definition.arg_count() {
            return Err(execution_error!(
                "{}::{} takes {} arguments, {} given",
                type_name,
                method,
                definition.arg_count(),
                args.len()
            ));
        }
        let body = self
            .method_body(&MethodKey::new(module, definition.token))
            .ok_or_else(|| execution_error!("{}::{} has no body installed", type_name, method))?;

        let frame = Frame::new(Arc::clone(&image), ty, definition, body, args.to_vec());
        let mut interpreter = Interpreter::new(self);
        let result = interpreter.run(frame);
        log::trace!(
            "{}::{} finished after {} instructions",
            type_name,
            method,
            interpreter.executed()
        );
        result
    }

    /// Allocate an instance of `type_name` with all instance fields zeroed.
    ///
    /// No constructor runs. The object's layout is the type's instance fields in the
    /// current snapshot, including fields injected by patches installed so far.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleNotLoaded`] or [`Error::TypeNotFound`].
    pub fn instantiate(&self, module: &str, type_name: &str) -> Result<ObjectRef> {
        let image = self.image(module)?;
        let ty = image
            .find_type(type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;
        Ok(Self::allocate(ty))
    }

    pub(crate) fn allocate(ty: &TypeDefinition) -> ObjectRef {
        let fields = ty
            .instance_fields()
            .map(|field| (field.token, Value::default_for(&field.field_type)))
            .collect();
        Object::new(ty.full_name(), ty.token, fields)
    }

    /// Read static field `type_name.field` of `module`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeNotFound`] if the type does not exist and
    /// [`Error::CapabilityMissing`] if it has no such static field.
    pub fn get_static(&self, module: &str, type_name: &str, field: &str) -> Result<Value> {
        let token = self.static_field(module, type_name, field)?.token;
        self.static_value(module, token)
    }

    /// Write static field `type_name.field` of `module`.
    ///
    /// # Errors
    ///
    /// See [`Runtime::get_static`].
    pub fn set_static(&self, module: &str, type_name: &str, field: &str, value: Value) -> Result<()> {
        let token = self.static_field(module, type_name, field)?.token;
        self.set_static_value(module, token, value)
    }

    fn static_field(&self, module: &str, type_name: &str, field: &str) -> Result<FieldDefinition> {
        let image = self.image(module)?;
        let ty = image
            .find_type(type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;
        ty.field(field)
            .filter(|definition| definition.is_static())
            .cloned()
            .ok_or_else(|| Error::CapabilityMissing {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    pub(crate) fn static_value(&self, module: &str, field: Token) -> Result<Value> {
        self.statics
            .get(&StaticKey {
                module: module.to_string(),
                field,
            })
            .map(|entry| entry.value().clone())
            .ok_or_else(|| execution_error!("static field {} of {} has no storage", field, module))
    }

    pub(crate) fn set_static_value(&self, module: &str, field: Token, value: Value) -> Result<()> {
        let key = StaticKey {
            module: module.to_string(),
            field,
        };
        match self.statics.get_mut(&key) {
            Some(mut slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(execution_error!("static field {} of {} has no storage", field, module)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        metadata::{
            image::{FieldAttributes, TypeAttributes},
            token::TableId,
            typesystem::TypeDescriptor,
        },
        test::method,
    };
    use uguid::guid;

    fn counter_image() -> AssemblyImage {
        let mut image = AssemblyImage::new("Host", guid!("0c7a1f52-3d0e-4b8a-9f61-2a5e7d4c3b10"));
        image.add_type("Game", "Counter", TypeAttributes::PUBLIC).unwrap();
        let total = Token::from_parts(TableId::Field, 1);
        image
            .find_type_mut("Game.Counter")
            .unwrap()
            .fields
            .push(FieldDefinition {
                token: total,
                name: "total".to_string(),
                field_type: TypeDescriptor::int32(),
                flags: FieldAttributes::PUBLIC | FieldAttributes::STATIC,
                offset: None,
            });

        // static int32 Sum(int32 n) { int32 s = 0; while (n > 0) { s += n; n--; } total = s; return s; }
        let sum = format!("stsfld 0x{:08X}", total.value());
        image
            .add_method(
                "Game.Counter",
                method(
                    "Sum",
                    true,
                    &["int32"],
                    Some("int32"),
                    &["int32"],
                    &[
                        "ldc.i4.0", "stloc.0", "br.s 11", // 0..2
                        "ldloc.0", "ldarg.0", "add", "stloc.0", // 3..6
                        "ldarg.0", "ldc.i4.1", "sub", "starg.s 0", // 7..10
                        "ldarg.0", "ldc.i4.0", "bgt.s 3", // 11..13
                        "ldloc.0", "dup", sum.as_str(), "ret", // 14..17
                    ],
                ),
            )
            .unwrap();
        image
            .add_method(
                "Game.Counter",
                method("Spin", true, &[], None, &[], &["br.s 0"]),
            )
            .unwrap();
        image
            .add_method(
                "Game.Counter",
                method("Recurse", true, &[], None, &[], &["call 0x06000003", "ret"]),
            )
            .unwrap();
        image
    }

    #[test]
    fn invoke_runs_loops_and_statics() {
        let runtime = Runtime::new();
        runtime.load(counter_image()).unwrap();

        let result = runtime
            .invoke("Host", "Game.Counter", "Sum", &[Value::I32(4)])
            .unwrap();
        assert_eq!(result, Some(Value::I32(10)));
        assert_eq!(
            runtime.get_static("Host", "Game.Counter", "total").unwrap(),
            Value::I32(10)
        );
    }

    #[test]
    fn limits_stop_runaway_code() {
        let runtime = Runtime::new().with_limits(RuntimeLimits::new().with_max_instructions(1_000));
        runtime.load(counter_image()).unwrap();
        assert!(matches!(
            runtime.invoke("Host", "Game.Counter", "Spin", &[]),
            Err(Error::LimitExceeded(_))
        ));

        let runtime = Runtime::new().with_limits(RuntimeLimits::new().with_max_call_depth(16));
        runtime.load(counter_image()).unwrap();
        assert!(matches!(
            runtime.invoke("Host", "Game.Counter", "Recurse", &[]),
            Err(Error::LimitExceeded(_))
        ));
    }

    #[test]
    fn invoke_errors() {
        let runtime = Runtime::new();
        assert!(matches!(
            runtime.invoke("Host", "Game.Counter", "Sum", &[]),
            Err(Error::ModuleNotLoaded(_))
        ));

        runtime.load(counter_image()).unwrap();
        assert!(matches!(runtime.load(counter_image()), Err(Error::Malformed { .. })));
        assert!(matches!(
            runtime.invoke("Host", "Game.Counter", "Sum", &[]),
            Err(Error::Execution(_))
        ));
        assert!(matches!(
            runtime.invoke("Host", "Game.Counter", "Missing", &[]),
            Err(Error::MethodNotFound { .. })
        ));
    }

    #[test]
    fn install_image_only_counts_changed_bodies() {
        let runtime = Runtime::new();
        runtime.load(counter_image()).unwrap();
        assert_eq!(runtime.install_image(counter_image()).unwrap(), 0);

        let mut patched = counter_image();
        patched.find_method_mut("Game.Counter", "Spin").unwrap().body =
            method("Spin", true, &[], None, &[], &["ret"]).body;
        assert_eq!(runtime.install_image(patched).unwrap(), 1);
        assert_eq!(runtime.invoke("Host", "Game.Counter", "Spin", &[]).unwrap(), None);

        let other = AssemblyImage::new("Other", guid!("00000000-0000-0000-0000-000000000002"));
        assert!(matches!(runtime.install_image(other), Err(Error::ModuleNotLoaded(_))));
    }

    #[test]
    fn natives_see_arguments_and_pointers() {
        let mut image = counter_image();
        let bump = image.add_member_ref(
            "Mods.Hooks",
            "Bump",
            false,
            vec![TypeDescriptor::int32()],
            None,
        );
        let line = format!("call 0x{:08X}", bump.value());
        image
            .add_method(
                "Game.Counter",
                method(
                    "Bumped",
                    true,
                    &[],
                    Some("int32"),
                    &["int32"],
                    &["ldc.i4.5", "stloc.0", "ldloca.s 0", line.as_str(), "ldloc.0", "ret"],
                ),
            )
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let natives = Arc::new(NativeRegistry::new());
        let log = seen.clone();
        natives.register_fn("Mods.Hooks::Bump", move |call| {
            let Value::Ref(pointer) = call.arg(0)?.clone() else {
                return Err(execution_error!("expected pointer"));
            };
            let current = call.load(&pointer)?.as_i32()?;
            log.lock().unwrap().push(current);
            call.store(&pointer, Value::I32(current * 3))?;
            Ok(None)
        });

        let runtime = Runtime::new().with_natives(natives);
        runtime.load(image).unwrap();
        let result = runtime.invoke("Host", "Game.Counter", "Bumped", &[]).unwrap();
        assert_eq!(result, Some(Value::I32(15)));
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    #[test]
    fn unbound_member_reference() {
        let mut image = counter_image();
        let missing = image.add_member_ref("Mods.Hooks", "Nothing", false, vec![], None);
        let line = format!("call 0x{:08X}", missing.value());
        image
            .add_method("Game.Counter", method("Calls", true, &[], None, &[], &[line.as_str(), "ret"]))
            .unwrap();

        let runtime = Runtime::new();
        runtime.load(image).unwrap();
        assert!(matches!(
            runtime.invoke("Host", "Game.Counter", "Calls", &[]),
            Err(Error::NativeNotFound(name)) if name == "Mods.Hooks::Nothing"
        ));
    }
}
