//! Type, field and member-reference definitions stored in an image.

use bitflags::bitflags;

use crate::metadata::{method::MethodDefinition, token::Token, typesystem::TypeDescriptor};

/// Bitmask for the layout bits of [`TypeAttributes`]
pub const TYPE_LAYOUT_MASK: u32 = 0x0000_0018;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Type attributes (ECMA-335 §II.23.1.15)
    pub struct TypeAttributes: u32 {
        /// Visible outside the module
        const PUBLIC = 0x0000_0001;
        /// Fields laid out in declaration order
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        /// Fields laid out at explicit offsets
        const EXPLICIT_LAYOUT = 0x0000_0010;
        /// Cannot be instantiated
        const ABSTRACT = 0x0000_0080;
        /// Cannot be derived from
        const SEALED = 0x0000_0100;
        /// Name has special meaning to tools
        const SPECIAL_NAME = 0x0000_0400;
    }
}

/// How the fields of a type are placed in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeLayout {
    /// The runtime picks field positions
    Auto,
    /// Declaration order
    Sequential,
    /// Explicit byte offsets
    Explicit,
}

impl TypeAttributes {
    /// The layout selected by these flags.
    #[must_use]
    pub fn layout(self) -> TypeLayout {
        match self.bits() & TYPE_LAYOUT_MASK {
            0x08 => TypeLayout::Sequential,
            0x10 => TypeLayout::Explicit,
            _ => TypeLayout::Auto,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Field attributes (ECMA-335 §II.23.1.5)
    pub struct FieldAttributes: u16 {
        /// Accessible only within the declaring type
        const PRIVATE = 0x0001;
        /// Accessible within the module
        const ASSEMBLY = 0x0003;
        /// Accessible to anyone
        const PUBLIC = 0x0006;
        /// One value per type rather than per instance
        const STATIC = 0x0010;
        /// Written only by constructors
        const INIT_ONLY = 0x0020;
        /// Name has special meaning to tools
        const SPECIAL_NAME = 0x0200;
        /// Name has special meaning to the runtime
        const RT_SPECIAL_NAME = 0x0400;
    }
}

/// A field declared by a type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    /// `Field` token
    pub token: Token,
    /// Name, unique within the declaring type
    pub name: String,
    /// Declared type
    pub field_type: TypeDescriptor,
    /// Attribute flags
    pub flags: FieldAttributes,
    /// Explicit byte offset, only meaningful for explicit layout types
    pub offset: Option<u32>,
}

impl FieldDefinition {
    /// Returns true for per-type storage.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }
}

/// A type declared by the image.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDefinition {
    /// `TypeDef` token
    pub token: Token,
    /// Namespace, may be empty
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Attribute flags
    pub flags: TypeAttributes,
    /// Fields in declaration order
    pub fields: Vec<FieldDefinition>,
    /// Methods in declaration order
    pub methods: Vec<MethodDefinition>,
}

impl TypeDefinition {
    /// `Namespace.Name`, or just `Name` without a namespace.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Returns true if `full_name` names this type.
    #[must_use]
    pub fn is_named(&self, full_name: &str) -> bool {
        if self.namespace.is_empty() {
            return self.name == full_name;
        }
        full_name
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|rest| rest == self.name)
    }

    /// The field called `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// The first method called `name`.
    #[must_use]
    pub fn method(&self, name: &str) -> Option<&MethodDefinition> {
        self.methods.iter().find(|method| method.name == name)
    }

    /// Mutable access to the first method called `name`.
    pub fn method_mut(&mut self, name: &str) -> Option<&mut MethodDefinition> {
        self.methods.iter_mut().find(|method| method.name == name)
    }

    /// Instance fields in declaration order.
    pub fn instance_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|field| !field.is_static())
    }
}

/// A method implemented outside the image, called through a `MemberRef` token.
///
/// Patch callbacks are member references; the runtime binds them to natives by
/// [`MemberReference::full_name`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemberReference {
    /// `MemberRef` token
    pub token: Token,
    /// Full name of the declaring type
    pub type_name: String,
    /// Member name
    pub name: String,
    /// Whether the callee takes a `this` argument
    pub has_this: bool,
    /// Parameter types, excluding `this`
    pub params: Vec<TypeDescriptor>,
    /// Return type, `None` for `void`
    pub returns: Option<TypeDescriptor>,
}

impl MemberReference {
    /// `Type::Name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.type_name, self.name)
    }
}
