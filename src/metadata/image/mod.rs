//! In-memory module images.
//!
//! An [`AssemblyImage`] is the mutable form of a compiled module: its types with their
//! fields and methods, and the external member references its code calls. Images are
//! loaded from a binary blob, edited in place by the patch pipeline, and either written
//! back to a blob or handed to the [`crate::runtime::Runtime`].
//!
//! Every definition carries an explicit row number. Appending a field, member reference
//! or type takes the next free row of its table, so tokens already embedded in method
//! bodies never move.
//!
//! # Examples
//!
//! ```rust
//! use cilsplice::metadata::image::{AssemblyImage, TypeAttributes};
//! use uguid::guid;
//!
//! let mut image = AssemblyImage::new("Host", guid!("6a1e2c1d-0b7f-4c55-9d4a-1f0e8e7b2c3a"));
//! let foo = image.add_type("Game", "Foo", TypeAttributes::PUBLIC)?;
//!
//! let bytes = image.to_bytes()?;
//! let reloaded = AssemblyImage::from_mem(&bytes)?;
//! assert_eq!(reloaded.find_type("Game.Foo").map(|t| t.token), Some(foo));
//! assert_eq!(reloaded.to_bytes()?, bytes);
//! # Ok::<(), cilsplice::Error>(())
//! ```

mod definitions;
mod reader;
mod writer;

pub use definitions::{
    FieldAttributes, FieldDefinition, MemberReference, TypeAttributes, TypeDefinition, TypeLayout,
    TYPE_LAYOUT_MASK,
};

use std::path::Path;

use uguid::Guid;

use crate::{
    file::File,
    metadata::{
        method::MethodDefinition,
        token::{TableId, Token},
        typesystem::TypeDescriptor,
    },
    Error, Result,
};

/// Resolves the tokens found in method bodies to their signatures.
///
/// The verifier, pattern matchers and interpreter all work through this trait, so they
/// can run against an [`AssemblyImage`] or any other source of metadata.
pub trait TokenResolver {
    /// Signature of the `MethodDef` or `MemberRef` behind `token`.
    fn method_signature(&self, token: Token) -> Option<MethodSignature>;

    /// Signature of the field behind `token`.
    fn field_signature(&self, token: Token) -> Option<FieldSignature>;
}

/// What a call site needs to know about its callee.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSignature {
    /// Full name of the declaring type
    pub type_name: String,
    /// Method name
    pub name: String,
    /// Whether the callee takes a `this` argument
    pub has_this: bool,
    /// Parameter types, excluding `this`
    pub params: Vec<TypeDescriptor>,
    /// Return type, `None` for `void`
    pub returns: Option<TypeDescriptor>,
}

impl MethodSignature {
    /// `Type::Name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.type_name, self.name)
    }

    /// Number of stack values a `call` consumes, including `this`.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }
}

/// What a field access needs to know about its field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSignature {
    /// Full name of the declaring type
    pub type_name: String,
    /// Field name
    pub name: String,
    /// Declared type
    pub field_type: TypeDescriptor,
    /// Whether the field is static
    pub is_static: bool,
}

/// A module image.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyImage {
    name: String,
    mvid: Guid,
    member_refs: Vec<MemberReference>,
    types: Vec<TypeDefinition>,
}

impl AssemblyImage {
    /// Create an empty image.
    #[must_use]
    pub fn new(name: impl Into<String>, mvid: Guid) -> Self {
        AssemblyImage {
            name: name.into(),
            mvid,
            member_refs: Vec::new(),
            types: Vec::new(),
        }
    }

    /// Parse an image from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] for empty input, [`Error::Malformed`] if the blob is not
    /// a valid image and [`Error::OutOfBounds`] if it is truncated.
    pub fn from_mem(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Empty);
        }
        reader::read_image(data)
    }

    /// Map and parse an image file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the file cannot be read, otherwise see
    /// [`AssemblyImage::from_mem`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::from_file(path)?;
        reader::read_image(file.data())
    }

    /// Serialize the image.
    ///
    /// Serialization is deterministic: an image loaded and written back without
    /// modification reproduces its input exactly.
    ///
    /// # Errors
    ///
    /// Returns an error if a method body cannot be encoded, see
    /// [`crate::assembly::encode_body`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        writer::write_image(self)
    }

    /// Serialize the image to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the file cannot be written, otherwise see
    /// [`AssemblyImage::to_bytes`].
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module version id.
    #[must_use]
    pub fn mvid(&self) -> Guid {
        self.mvid
    }

    /// All types, in declaration order.
    #[must_use]
    pub fn types(&self) -> &[TypeDefinition] {
        &self.types
    }

    /// All member references, in declaration order.
    #[must_use]
    pub fn member_refs(&self) -> &[MemberReference] {
        &self.member_refs
    }

    /// The type called `full_name`.
    #[must_use]
    pub fn find_type(&self, full_name: &str) -> Option<&TypeDefinition> {
        self.types.iter().find(|ty| ty.is_named(full_name))
    }

    /// Mutable access to the type called `full_name`.
    pub fn find_type_mut(&mut self, full_name: &str) -> Option<&mut TypeDefinition> {
        self.types.iter_mut().find(|ty| ty.is_named(full_name))
    }

    /// The method `method` of type `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeNotFound`] or [`Error::MethodNotFound`].
    pub fn find_method(&self, type_name: &str, method: &str) -> Result<&MethodDefinition> {
        let ty = self
            .find_type(type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;
        ty.method(method).ok_or_else(|| Error::MethodNotFound {
            type_name: type_name.to_string(),
            method: method.to_string(),
        })
    }

    /// Mutable access to the method `method` of type `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeNotFound`] or [`Error::MethodNotFound`].
    pub fn find_method_mut(
        &mut self,
        type_name: &str,
        method: &str,
    ) -> Result<&mut MethodDefinition> {
        let ty = self
            .find_type_mut(type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;
        ty.method_mut(method).ok_or_else(|| Error::MethodNotFound {
            type_name: type_name.to_string(),
            method: method.to_string(),
        })
    }

    /// The type behind a `TypeDef` token.
    #[must_use]
    pub fn type_by_token(&self, token: Token) -> Option<&TypeDefinition> {
        self.types.iter().find(|ty| ty.token == token)
    }

    /// The declaring type and field behind a `Field` token.
    #[must_use]
    pub fn field_by_token(&self, token: Token) -> Option<(&TypeDefinition, &FieldDefinition)> {
        self.types.iter().find_map(|ty| {
            ty.fields
                .iter()
                .find(|field| field.token == token)
                .map(|field| (ty, field))
        })
    }

    /// The declaring type and method behind a `MethodDef` token.
    #[must_use]
    pub fn method_by_token(&self, token: Token) -> Option<(&TypeDefinition, &MethodDefinition)> {
        self.types.iter().find_map(|ty| {
            ty.methods
                .iter()
                .find(|method| method.token == token)
                .map(|method| (ty, method))
        })
    }

    /// The member reference behind a `MemberRef` token.
    #[must_use]
    pub fn member_ref(&self, token: Token) -> Option<&MemberReference> {
        self.member_refs.iter().find(|mr| mr.token == token)
    }

    /// The member reference `Type::Name`, if present.
    #[must_use]
    pub fn find_member_ref(&self, type_name: &str, name: &str) -> Option<&MemberReference> {
        self.member_refs
            .iter()
            .find(|mr| mr.type_name == type_name && mr.name == name)
    }

    /// Next free row in `table`.
    #[must_use]
    pub fn next_row(&self, table: TableId) -> u32 {
        let max = match table {
            TableId::TypeDef => self.types.iter().map(|ty| ty.token.row()).max(),
            TableId::Field => self
                .types
                .iter()
                .flat_map(|ty| ty.fields.iter().map(|f| f.token.row()))
                .max(),
            TableId::MethodDef => self
                .types
                .iter()
                .flat_map(|ty| ty.methods.iter().map(|m| m.token.row()))
                .max(),
            TableId::MemberRef => self.member_refs.iter().map(|mr| mr.token.row()).max(),
        };
        max.unwrap_or(0) + 1
    }

    /// Append a new, empty type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if a type with the same full name exists.
    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        flags: TypeAttributes,
    ) -> Result<Token> {
        let ty = TypeDefinition {
            token: Token::from_parts(TableId::TypeDef, self.next_row(TableId::TypeDef)),
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags,
            fields: Vec::new(),
            methods: Vec::new(),
        };
        if self.find_type(&ty.full_name()).is_some() {
            return Err(malformed_error!("Type {} already exists", ty.full_name()));
        }

        let token = ty.token;
        self.types.push(ty);
        Ok(token)
    }

    /// Append `method` to type `type_name`, assigning it the next `MethodDef` row.
    ///
    /// The token already set on `method` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeNotFound`] if the type does not exist.
    pub fn add_method(&mut self, type_name: &str, mut method: MethodDefinition) -> Result<Token> {
        let token = Token::from_parts(TableId::MethodDef, self.next_row(TableId::MethodDef));
        let ty = self
            .find_type_mut(type_name)
            .ok_or_else(|| Error::TypeNotFound(type_name.to_string()))?;

        method.token = token;
        ty.methods.push(method);
        Ok(token)
    }

    /// Reference an external method, reusing an identical existing reference.
    pub fn add_member_ref(
        &mut self,
        type_name: &str,
        name: &str,
        has_this: bool,
        params: Vec<TypeDescriptor>,
        returns: Option<TypeDescriptor>,
    ) -> Token {
        if let Some(existing) = self.member_refs.iter().find(|mr| {
            mr.type_name == type_name
                && mr.name == name
                && mr.has_this == has_this
                && mr.params == params
                && mr.returns == returns
        }) {
            return existing.token;
        }

        let token = Token::from_parts(TableId::MemberRef, self.next_row(TableId::MemberRef));
        self.member_refs.push(MemberReference {
            token,
            type_name: type_name.to_string(),
            name: name.to_string(),
            has_this,
            params,
            returns,
        });
        token
    }

    /// Drop member references added after the first `len`.
    pub(crate) fn truncate_member_refs(&mut self, len: usize) {
        self.member_refs.truncate(len);
    }

    pub(crate) fn from_parts(
        name: String,
        mvid: Guid,
        member_refs: Vec<MemberReference>,
        types: Vec<TypeDefinition>,
    ) -> Self {
        AssemblyImage {
            name,
            mvid,
            member_refs,
            types,
        }
    }
}

impl TokenResolver for AssemblyImage {
    fn method_signature(&self, token: Token) -> Option<MethodSignature> {
        match token.table_id()? {
            TableId::MethodDef => self.method_by_token(token).map(|(ty, method)| MethodSignature {
                type_name: ty.full_name(),
                name: method.name.clone(),
                has_this: !method.is_static(),
                params: method.params.clone(),
                returns: method.returns.clone(),
            }),
            TableId::MemberRef => self.member_ref(token).map(|mr| MethodSignature {
                type_name: mr.type_name.clone(),
                name: mr.name.clone(),
                has_this: mr.has_this,
                params: mr.params.clone(),
                returns: mr.returns.clone(),
            }),
            TableId::TypeDef | TableId::Field => None,
        }
    }

    fn field_signature(&self, token: Token) -> Option<FieldSignature> {
        self.field_by_token(token).map(|(ty, field)| FieldSignature {
            type_name: ty.full_name(),
            name: field.name.clone(),
            field_type: field.field_type.clone(),
            is_static: field.is_static(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::method::MethodAttributes;
    use uguid::guid;

    fn image() -> AssemblyImage {
        AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-000000000001"))
    }

    #[test]
    fn rows_are_allocated_per_table() {
        let mut image = image();
        let foo = image.add_type("", "Foo", TypeAttributes::PUBLIC).unwrap();
        let bar = image.add_type("Game", "Bar", TypeAttributes::PUBLIC).unwrap();
        assert_eq!(foo, Token::new(0x0200_0001));
        assert_eq!(bar, Token::new(0x0200_0002));

        let get = image
            .add_method(
                "Game.Bar",
                MethodDefinition {
                    token: Token::new(0),
                    name: "Get".to_string(),
                    flags: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                    params: Vec::new(),
                    returns: Some(TypeDescriptor::int32()),
                    body: None,
                },
            )
            .unwrap();
        assert_eq!(get, Token::new(0x0600_0001));
        assert_eq!(image.next_row(TableId::Field), 1);

        assert!(image.add_type("Game", "Bar", TypeAttributes::PUBLIC).is_err());
        assert!(matches!(
            image.find_method("Game.Bar", "Set"),
            Err(Error::MethodNotFound { .. })
        ));
        assert!(matches!(
            image.find_method("Baz", "Get"),
            Err(Error::TypeNotFound(_))
        ));
    }

    #[test]
    fn member_refs_are_deduplicated() {
        let mut image = image();
        let first = image.add_member_ref("Hooks", "OnCompute", false, vec![], None);
        let again = image.add_member_ref("Hooks", "OnCompute", false, vec![], None);
        let other = image.add_member_ref(
            "Hooks",
            "OnCompute",
            false,
            vec![TypeDescriptor::int32()],
            None,
        );
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(image.member_refs().len(), 2);

        let signature = image.method_signature(other).unwrap();
        assert_eq!(signature.full_name(), "Hooks::OnCompute");
        assert_eq!(signature.arg_count(), 1);
        assert!(image.method_signature(Token::new(0x0A00_0009)).is_none());
    }
}
