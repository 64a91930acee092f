//! Heap objects.
//!
//! An [`Object`] captures the instance-field layout of its type at allocation time. A
//! type that gains fields later (through a patch installed while the program runs)
//! does not change objects that already exist; accessing a field such an object lacks
//! is an error, never a silent default.

use std::{
    fmt,
    ops::Deref,
    sync::{Arc, RwLock},
};

use crate::{metadata::token::Token, runtime::value::Value, Result};

/// A heap-allocated instance.
pub struct Object {
    type_name: String,
    type_token: Token,
    layout: Vec<Token>,
    fields: RwLock<Vec<Value>>,
}

impl Object {
    /// Allocate an object with the given field tokens and initial values.
    #[must_use]
    pub fn new(type_name: impl Into<String>, type_token: Token, fields: Vec<(Token, Value)>) -> ObjectRef {
        let (layout, values) = fields.into_iter().unzip();
        ObjectRef(Arc::new(Object {
            type_name: type_name.into(),
            type_token,
            layout,
            fields: RwLock::new(values),
        }))
    }

    /// Full name of the object's type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// `TypeDef` token of the object's type.
    #[must_use]
    pub fn type_token(&self) -> Token {
        self.type_token
    }

    /// Returns true if the object was allocated with storage for `field`.
    #[must_use]
    pub fn has_field(&self, field: Token) -> bool {
        self.layout.contains(&field)
    }

    fn slot(&self, field: Token) -> Result<usize> {
        self.layout.iter().position(|t| *t == field).ok_or_else(|| {
            execution_error!("{} instance has no storage for field {}", self.type_name, field)
        })
    }

    /// Read `field`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Execution`] if the object has no such field and
    /// [`crate::Error::LockError`] if the field storage lock is poisoned.
    pub fn get(&self, field: Token) -> Result<Value> {
        let slot = self.slot(field)?;
        let fields = read_lock!(self.fields)?;
        Ok(fields[slot].clone())
    }

    /// Write `field`.
    ///
    /// # Errors
    ///
    /// See [`Object::get`].
    pub fn set(&self, field: Token, value: Value) -> Result<()> {
        let slot = self.slot(field)?;
        let mut fields = write_lock!(self.fields)?;
        fields[slot] = value;
        Ok(())
    }
}

/// Shared reference to an [`Object`]. Equality is identity.
#[derive(Clone)]
pub struct ObjectRef(Arc<Object>);

impl ObjectRef {
    /// Address of the object, stable for its lifetime.
    #[must_use]
    pub fn as_ptr(&self) -> *const Object {
        Arc::as_ptr(&self.0)
    }
}

impl Deref for ObjectRef {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.0
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:p}", self.type_name, self.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn fields_by_token() {
        let hp = Token::new(0x0400_0001);
        let object = Object::new("Game.Player", Token::new(0x0200_0001), vec![(hp, Value::I32(10))]);

        assert_eq!(object.get(hp).unwrap(), Value::I32(10));
        object.set(hp, Value::I32(7)).unwrap();
        assert_eq!(object.get(hp).unwrap(), Value::I32(7));

        let missing = Token::new(0x0400_0002);
        assert!(!object.has_field(missing));
        assert!(matches!(object.get(missing), Err(Error::Execution(_))));
    }

    #[test]
    fn identity_equality() {
        let a = Object::new("T", Token::new(0x0200_0001), vec![]);
        let b = Object::new("T", Token::new(0x0200_0001), vec![]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
