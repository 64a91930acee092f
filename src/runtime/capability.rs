//! Typed access to injected fields.
//!
//! A field injected by a patch has no Rust declaration; feature code reaches it
//! through a [`CapabilitySlot`]. The slot is bound once, after the patched module is
//! loaded, and checks then that the field exists with a type the Rust side can
//! represent. Afterwards every access is a direct lookup by field token on the object.
//!
//! Objects allocated before the field was injected have no storage for it. Accessing
//! such an object fails with [`Error::CapabilityMissing`] instead of returning a
//! default, so a feature never silently reads state it did not write.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilsplice::runtime::{CapabilitySlot, Runtime};
//!
//! # fn run(runtime: &Runtime) -> cilsplice::Result<()> {
//! let shield: CapabilitySlot<i32> = CapabilitySlot::bind(runtime, "Host", "Game.Player", "shield")?;
//!
//! let player = runtime.instantiate("Host", "Game.Player")?;
//! shield.set(&player, 25)?;
//! assert_eq!(shield.get(&player)?, 25);
//! # Ok(())
//! # }
//! ```

use std::{fmt, marker::PhantomData};

use crate::{
    metadata::{
        token::Token,
        typesystem::{PrimitiveType, TypeDescriptor},
    },
    runtime::{object::ObjectRef, value::Value, Runtime},
    Error, Result,
};

/// A Rust type that can stand in for a field type.
pub trait SlotValue: Sized {
    /// Name used in [`Error::SlotTypeMismatch`].
    const NAME: &'static str;

    /// Returns true if fields of type `ty` can be accessed as `Self`.
    fn accepts(ty: &TypeDescriptor) -> bool;

    /// Convert a stored value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] if the stored value has the wrong shape.
    fn from_value(value: Value) -> Result<Self>;

    /// Convert into a storable value.
    fn into_value(self) -> Value;
}

impl SlotValue for i32 {
    const NAME: &'static str = "i32";

    fn accepts(ty: &TypeDescriptor) -> bool {
        matches!(ty.as_primitive(), Some(PrimitiveType::I4 | PrimitiveType::U4))
    }

    fn from_value(value: Value) -> Result<Self> {
        value.as_i32()
    }

    fn into_value(self) -> Value {
        Value::I32(self)
    }
}

impl SlotValue for i64 {
    const NAME: &'static str = "i64";

    fn accepts(ty: &TypeDescriptor) -> bool {
        matches!(ty.as_primitive(), Some(PrimitiveType::I8 | PrimitiveType::U8))
    }

    fn from_value(value: Value) -> Result<Self> {
        value.as_i64()
    }

    fn into_value(self) -> Value {
        Value::I64(self)
    }
}

impl SlotValue for f32 {
    const NAME: &'static str = "f32";

    fn accepts(ty: &TypeDescriptor) -> bool {
        ty.as_primitive() == Some(PrimitiveType::R4)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::F32(v) => Ok(v),
            other => Err(execution_error!("expected float32, found {}", other.kind())),
        }
    }

    fn into_value(self) -> Value {
        Value::F32(self)
    }
}

impl SlotValue for f64 {
    const NAME: &'static str = "f64";

    fn accepts(ty: &TypeDescriptor) -> bool {
        ty.as_primitive() == Some(PrimitiveType::R8)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::F64(v) => Ok(v),
            other => Err(execution_error!("expected float64, found {}", other.kind())),
        }
    }

    fn into_value(self) -> Value {
        Value::F64(self)
    }
}

impl SlotValue for bool {
    const NAME: &'static str = "bool";

    fn accepts(ty: &TypeDescriptor) -> bool {
        ty.as_primitive() == Some(PrimitiveType::Boolean)
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value.as_i32()? != 0)
    }

    fn into_value(self) -> Value {
        Value::from(self)
    }
}

impl SlotValue for Option<ObjectRef> {
    const NAME: &'static str = "Option<ObjectRef>";

    fn accepts(ty: &TypeDescriptor) -> bool {
        ty.is_reference()
    }

    fn from_value(value: Value) -> Result<Self> {
        value.as_object()
    }

    fn into_value(self) -> Value {
        self.map_or(Value::Null, Value::Object)
    }
}

/// A bound, typed handle to one field of one type.
pub struct CapabilitySlot<T> {
    module: String,
    type_name: String,
    field: String,
    token: Token,
    is_static: bool,
    _value: PhantomData<fn() -> T>,
}

impl<T: SlotValue> CapabilitySlot<T> {
    /// Bind to `type_name.field` in the current snapshot of `module`.
    ///
    /// # Errors
    ///
    /// - [`Error::ModuleNotLoaded`] or [`Error::TypeNotFound`] if the target is absent
    /// - [`Error::CapabilityMissing`] if the type has no such field, usually because the
    ///   patch that injects it was not installed
    /// - [`Error::SlotTypeMismatch`] if `T` cannot represent the field type
    pub fn bind(runtime: &Runtime, module: &str, type_name: &str, field: &str) -> Result<Self> {
        let image = runtime.image(module)?;
        let ty = image
            .find_type(type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;
        let definition = ty.field(field).ok_or_else(|| Error::CapabilityMissing {
            type_name: type_name.to_string(),
            field: field.to_string(),
        })?;

        if !T::accepts(&definition.field_type) {
            return Err(Error::SlotTypeMismatch {
                field: format!("{type_name}.{field}"),
                actual: definition.field_type.to_string(),
                requested: T::NAME,
            });
        }

        log::debug!("bound capability {}.{} as {}", type_name, field, T::NAME);
        Ok(CapabilitySlot {
            module: module.to_string(),
            type_name: type_name.to_string(),
            field: field.to_string(),
            token: definition.token,
            is_static: definition.is_static(),
            _value: PhantomData,
        })
    }

    /// Token of the bound field.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Returns true if the bound field is static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    fn missing(&self) -> Error {
        Error::CapabilityMissing {
            type_name: self.type_name.clone(),
            field: self.field.clone(),
        }
    }

    fn check_instance(&self, object: &ObjectRef) -> Result<()> {
        if self.is_static {
            return Err(execution_error!(
                "{}.{} is static; use get_static/set_static",
                self.type_name,
                self.field
            ));
        }
        if !object.has_field(self.token) {
            return Err(self.missing());
        }
        Ok(())
    }

    /// Read the field of `object`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapabilityMissing`] if `object` was allocated without the field.
    pub fn get(&self, object: &ObjectRef) -> Result<T> {
        self.check_instance(object)?;
        T::from_value(object.get(self.token)?)
    }

    /// Write the field of `object`.
    ///
    /// # Errors
    ///
    /// See [`CapabilitySlot::get`].
    pub fn set(&self, object: &ObjectRef, value: T) -> Result<()> {
        self.check_instance(object)?;
        object.set(self.token, value.into_value())
    }

    /// Read a static field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`] if the bound field is an instance field.
    pub fn get_static(&self, runtime: &Runtime) -> Result<T> {
        if !self.is_static {
            return Err(execution_error!("{}.{} is not static", self.type_name, self.field));
        }
        T::from_value(runtime.static_value(&self.module, self.token)?)
    }

    /// Write a static field.
    ///
    /// # Errors
    ///
    /// See [`CapabilitySlot::get_static`].
    pub fn set_static(&self, runtime: &Runtime, value: T) -> Result<()> {
        if !self.is_static {
            return Err(execution_error!("{}.{} is not static", self.type_name, self.field));
        }
        runtime.set_static_value(&self.module, self.token, value.into_value())
    }
}

impl<T> Clone for CapabilitySlot<T> {
    fn clone(&self) -> Self {
        CapabilitySlot {
            module: self.module.clone(),
            type_name: self.type_name.clone(),
            field: self.field.clone(),
            token: self.token,
            is_static: self.is_static,
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for CapabilitySlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.type_name, self.field, self.token)
    }
}
