//! Values on the evaluation stack and in storage.

use std::fmt;

use crate::{
    metadata::{
        token::Token,
        typesystem::{PrimitiveType, TypeDescriptor},
    },
    runtime::object::ObjectRef,
    Result,
};

/// A managed pointer, produced by `ldloca`, `ldarga`, `ldflda` and `ldsflda`.
#[derive(Debug, Clone, PartialEq)]
pub enum Pointer {
    /// A local of the frame at depth `frame`
    Local {
        /// Frame index, 0 is the outermost call
        frame: usize,
        /// Local slot
        index: u16,
    },
    /// An argument of the frame at depth `frame`
    Argument {
        /// Frame index, 0 is the outermost call
        frame: usize,
        /// Argument slot
        index: u16,
    },
    /// An instance field
    Field {
        /// The owning object
        object: ObjectRef,
        /// `Field` token
        field: Token,
    },
    /// A static field
    Static {
        /// Module name
        module: String,
        /// `Field` token
        field: Token,
    },
}

/// A runtime value.
///
/// Follows the evaluation stack model: `bool`, `char` and integers up to 32 bits are
/// all held as [`Value::I32`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null reference
    Null,
    /// 32-bit integer
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// Object reference
    Object(ObjectRef),
    /// Managed pointer
    Ref(Pointer),
}

impl Value {
    /// Zero value for storage of type `ty`.
    #[must_use]
    pub fn default_for(ty: &TypeDescriptor) -> Value {
        match ty.as_primitive() {
            Some(PrimitiveType::I8 | PrimitiveType::U8) => Value::I64(0),
            Some(PrimitiveType::R4) => Value::F32(0.0),
            Some(PrimitiveType::R8) => Value::F64(0.0),
            Some(PrimitiveType::String | PrimitiveType::Object) | None => Value::Null,
            Some(_) => Value::I32(0),
        }
    }

    /// Name of the variant, for error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::I32(_) => "int32",
            Value::I64(_) => "int64",
            Value::F32(_) => "float32",
            Value::F64(_) => "float64",
            Value::Object(_) => "object",
            Value::Ref(_) => "pointer",
        }
    }

    /// The value as `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Execution`] for non-`I32` values.
    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Value::I32(v) => Ok(*v),
            other => Err(execution_error!("expected int32, found {}", other.kind())),
        }
    }

    /// The value as `i64`, widening `I32`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Execution`] for non-integer values.
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::I32(v) => Ok(i64::from(*v)),
            Value::I64(v) => Ok(*v),
            other => Err(execution_error!("expected int64, found {}", other.kind())),
        }
    }

    /// The value as `f64`, widening `F32`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Execution`] for non-float values.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::F32(v) => Ok(f64::from(*v)),
            Value::F64(v) => Ok(*v),
            other => Err(execution_error!("expected float, found {}", other.kind())),
        }
    }

    /// The value as an object reference, `None` for null.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Execution`] for non-reference values.
    pub fn as_object(&self) -> Result<Option<ObjectRef>> {
        match self {
            Value::Null => Ok(None),
            Value::Object(object) => Ok(Some(object.clone())),
            other => Err(execution_error!("expected object, found {}", other.kind())),
        }
    }

    /// The truth value used by `brtrue`/`brfalse`: non-zero, non-null.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::F32(v) => *v != 0.0,
            Value::F64(v) => *v != 0.0,
            Value::Object(_) | Value::Ref(_) => true,
        }
    }

    /// Returns true if `self` can be stored in a location of type `ty`.
    #[must_use]
    pub fn fits(&self, ty: &TypeDescriptor) -> bool {
        matches!(
            (self, Value::default_for(ty)),
            (Value::I32(_), Value::I32(_))
                | (Value::I64(_), Value::I64(_))
                | (Value::F32(_), Value::F32(_))
                | (Value::F64(_), Value::F64(_))
                | (Value::Null | Value::Object(_), Value::Null)
        )
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::I32(i32::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}L"),
            Value::F32(v) => write!(f, "{v}f"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Object(object) => write!(f, "{}@{:p}", object.type_name(), object.as_ptr()),
            Value::Ref(pointer) => write!(f, "&{pointer:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_stack_model() {
        assert_eq!(Value::default_for(&TypeDescriptor::boolean()), Value::I32(0));
        assert_eq!(Value::default_for(&"int64".parse().unwrap()), Value::I64(0));
        assert_eq!(Value::default_for(&"float32".parse().unwrap()), Value::F32(0.0));
        assert_eq!(Value::default_for(&"Game.Player".parse().unwrap()), Value::Null);
        assert_eq!(Value::default_for(&"int32[]".parse().unwrap()), Value::Null);
    }

    #[test]
    fn conversions() {
        assert_eq!(Value::from(true).as_i32().unwrap(), 1);
        assert_eq!(Value::I32(-4).as_i64().unwrap(), -4);
        assert!(Value::I64(1).as_i32().is_err());
        assert!(Value::I32(0).fits(&TypeDescriptor::boolean()));
        assert!(!Value::I64(0).fits(&TypeDescriptor::int32()));
        assert!(!Value::Null.is_true());
    }
}
