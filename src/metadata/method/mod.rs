//! Method definitions, attributes and bodies.

mod body;
mod types;

pub use body::MethodBody;
pub use types::{MethodAttributes, METHOD_ACCESS_MASK};

use crate::metadata::{token::Token, typesystem::TypeDescriptor};

/// A method declared by a type in the image.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDefinition {
    /// `MethodDef` token
    pub token: Token,
    /// Simple name, e.g. `Compute` or `.ctor`
    pub name: String,
    /// Attribute flags
    pub flags: MethodAttributes,
    /// Parameter types, excluding `this`
    pub params: Vec<TypeDescriptor>,
    /// Return type, `None` for `void`
    pub returns: Option<TypeDescriptor>,
    /// The body, absent for abstract or runtime-provided methods
    pub body: Option<MethodBody>,
}

impl MethodDefinition {
    /// Returns true if the method takes no `this` argument.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAttributes::STATIC)
    }

    /// Number of argument slots, including `this` for instance methods.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(!self.is_static())
    }
}
