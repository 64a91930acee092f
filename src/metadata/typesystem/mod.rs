//! Semantic type descriptors for fields, locals and signatures.
//!
//! The image stores every type as an ECMA-335 element-type blob (§II.23.1.16): a single
//! code byte for primitives, `SZARRAY` followed by the element type for vectors, and
//! `CLASS` followed by the full name of a type for references. [`TypeDescriptor`] is the
//! decoded form; [`PrimitiveType`] names the built-in types the injector and runtime know.
//!
//! # Examples
//!
//! ```rust
//! use cilsplice::metadata::typesystem::{PrimitiveType, TypeDescriptor};
//!
//! let counter: TypeDescriptor = "int32".parse()?;
//! assert_eq!(counter, TypeDescriptor::Primitive(PrimitiveType::I4));
//!
//! let names: TypeDescriptor = "string[]".parse()?;
//! assert_eq!(names.to_string(), "string[]");
//! # Ok::<(), cilsplice::Error>(())
//! ```

use std::{fmt, str::FromStr};

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    file::{io::ByteWriter, parser::Parser},
    Result,
};

#[allow(non_snake_case, missing_docs)]
/// Element-type codes used by the image format, a subset of coreclr's
pub mod ELEMENT_TYPE {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    // Followed by the full type name
    pub const CLASS: u8 = 0x12;
    // System.Object
    pub const OBJECT: u8 = 0x1c;
    // Single-dim array with 0 lower bound, followed by the element type
    pub const SZARRAY: u8 = 0x1d;
}

/// Array nesting deeper than this is treated as a malformed blob.
const MAX_NESTING: usize = 32;

/// Built-in types, named as in ILAsm.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
pub enum PrimitiveType {
    /// `System.Boolean`
    #[strum(serialize = "bool")]
    Boolean,
    /// `System.Char`
    #[strum(serialize = "char")]
    Char,
    /// `System.SByte`
    #[strum(serialize = "int8")]
    I1,
    /// `System.Byte`
    #[strum(serialize = "uint8")]
    U1,
    /// `System.Int16`
    #[strum(serialize = "int16")]
    I2,
    /// `System.UInt16`
    #[strum(serialize = "uint16")]
    U2,
    /// `System.Int32`
    #[strum(serialize = "int32")]
    I4,
    /// `System.UInt32`
    #[strum(serialize = "uint32")]
    U4,
    /// `System.Int64`
    #[strum(serialize = "int64")]
    I8,
    /// `System.UInt64`
    #[strum(serialize = "uint64")]
    U8,
    /// `System.Single`
    #[strum(serialize = "float32")]
    R4,
    /// `System.Double`
    #[strum(serialize = "float64")]
    R8,
    /// `System.String`
    #[strum(serialize = "string")]
    String,
    /// `System.Object`
    #[strum(serialize = "object")]
    Object,
}

impl PrimitiveType {
    /// The element-type code this primitive is stored as.
    #[must_use]
    pub fn element_type(self) -> u8 {
        match self {
            PrimitiveType::Boolean => ELEMENT_TYPE::BOOLEAN,
            PrimitiveType::Char => ELEMENT_TYPE::CHAR,
            PrimitiveType::I1 => ELEMENT_TYPE::I1,
            PrimitiveType::U1 => ELEMENT_TYPE::U1,
            PrimitiveType::I2 => ELEMENT_TYPE::I2,
            PrimitiveType::U2 => ELEMENT_TYPE::U2,
            PrimitiveType::I4 => ELEMENT_TYPE::I4,
            PrimitiveType::U4 => ELEMENT_TYPE::U4,
            PrimitiveType::I8 => ELEMENT_TYPE::I8,
            PrimitiveType::U8 => ELEMENT_TYPE::U8,
            PrimitiveType::R4 => ELEMENT_TYPE::R4,
            PrimitiveType::R8 => ELEMENT_TYPE::R8,
            PrimitiveType::String => ELEMENT_TYPE::STRING,
            PrimitiveType::Object => ELEMENT_TYPE::OBJECT,
        }
    }

    /// Map an element-type code back to a primitive.
    #[must_use]
    pub fn from_element_type(code: u8) -> Option<PrimitiveType> {
        Some(match code {
            ELEMENT_TYPE::BOOLEAN => PrimitiveType::Boolean,
            ELEMENT_TYPE::CHAR => PrimitiveType::Char,
            ELEMENT_TYPE::I1 => PrimitiveType::I1,
            ELEMENT_TYPE::U1 => PrimitiveType::U1,
            ELEMENT_TYPE::I2 => PrimitiveType::I2,
            ELEMENT_TYPE::U2 => PrimitiveType::U2,
            ELEMENT_TYPE::I4 => PrimitiveType::I4,
            ELEMENT_TYPE::U4 => PrimitiveType::U4,
            ELEMENT_TYPE::I8 => PrimitiveType::I8,
            ELEMENT_TYPE::U8 => PrimitiveType::U8,
            ELEMENT_TYPE::R4 => PrimitiveType::R4,
            ELEMENT_TYPE::R8 => PrimitiveType::R8,
            ELEMENT_TYPE::STRING => PrimitiveType::String,
            ELEMENT_TYPE::OBJECT => PrimitiveType::Object,
            _ => return None,
        })
    }

    /// Storage size in bytes, `None` for reference types.
    #[must_use]
    pub fn size(self) -> Option<u32> {
        match self {
            PrimitiveType::Boolean | PrimitiveType::I1 | PrimitiveType::U1 => Some(1),
            PrimitiveType::Char | PrimitiveType::I2 | PrimitiveType::U2 => Some(2),
            PrimitiveType::I4 | PrimitiveType::U4 | PrimitiveType::R4 => Some(4),
            PrimitiveType::I8 | PrimitiveType::U8 | PrimitiveType::R8 => Some(8),
            PrimitiveType::String | PrimitiveType::Object => None,
        }
    }

    /// Returns true for `string` and `object`.
    #[must_use]
    pub fn is_reference(self) -> bool {
        self.size().is_none()
    }
}

/// The declared type of a field, local, parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    /// A built-in type
    Primitive(PrimitiveType),
    /// A zero-based single-dimension array of the inner type
    Array(Box<TypeDescriptor>),
    /// A class or value type defined in the image or elsewhere, by full name
    Reference(String),
}

impl TypeDescriptor {
    /// Shorthand for `Primitive(PrimitiveType::I4)`.
    #[must_use]
    pub fn int32() -> Self {
        TypeDescriptor::Primitive(PrimitiveType::I4)
    }

    /// Shorthand for `Primitive(PrimitiveType::Boolean)`.
    #[must_use]
    pub fn boolean() -> Self {
        TypeDescriptor::Primitive(PrimitiveType::Boolean)
    }

    /// Returns true if values of this type are object references.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        match self {
            TypeDescriptor::Primitive(primitive) => primitive.is_reference(),
            TypeDescriptor::Array(_) | TypeDescriptor::Reference(_) => true,
        }
    }

    /// Returns the primitive this descriptor names, if any.
    #[must_use]
    pub fn as_primitive(&self) -> Option<PrimitiveType> {
        match self {
            TypeDescriptor::Primitive(primitive) => Some(*primitive),
            _ => None,
        }
    }

    /// Append the element-type blob for this descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if a referenced type name is too long to encode.
    pub fn encode(&self, writer: &mut ByteWriter) -> Result<()> {
        match self {
            TypeDescriptor::Primitive(primitive) => writer.write_le::<u8>(primitive.element_type()),
            TypeDescriptor::Array(element) => {
                writer.write_le::<u8>(ELEMENT_TYPE::SZARRAY);
                element.encode(writer)?;
            }
            TypeDescriptor::Reference(name) => {
                writer.write_le::<u8>(ELEMENT_TYPE::CLASS);
                writer.write_prefixed_string_utf8(name)?;
            }
        }
        Ok(())
    }

    /// Read an element-type blob.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for unknown codes or excessive nesting, and
    /// [`crate::Error::OutOfBounds`] if the blob is truncated.
    pub fn decode(parser: &mut Parser) -> Result<TypeDescriptor> {
        Self::decode_nested(parser, 0)
    }

    fn decode_nested(parser: &mut Parser, depth: usize) -> Result<TypeDescriptor> {
        if depth > MAX_NESTING {
            return Err(malformed_error!("Type blob nested deeper than {}", MAX_NESTING));
        }

        let code = parser.read_le::<u8>()?;
        match code {
            ELEMENT_TYPE::SZARRAY => Ok(TypeDescriptor::Array(Box::new(
                Self::decode_nested(parser, depth + 1)?,
            ))),
            ELEMENT_TYPE::CLASS => Ok(TypeDescriptor::Reference(
                parser.read_prefixed_string_utf8()?,
            )),
            _ => PrimitiveType::from_element_type(code)
                .map(TypeDescriptor::Primitive)
                .ok_or_else(|| malformed_error!("Unknown element type - {:#04x}", code)),
        }
    }

    /// Write an optional return type, `VOID` for `None`.
    ///
    /// # Errors
    ///
    /// See [`TypeDescriptor::encode`].
    pub fn encode_return(returns: Option<&TypeDescriptor>, writer: &mut ByteWriter) -> Result<()> {
        match returns {
            Some(descriptor) => descriptor.encode(writer),
            None => {
                writer.write_le::<u8>(ELEMENT_TYPE::VOID);
                Ok(())
            }
        }
    }

    /// Read an optional return type written by [`TypeDescriptor::encode_return`].
    ///
    /// # Errors
    ///
    /// See [`TypeDescriptor::decode`].
    pub fn decode_return(parser: &mut Parser) -> Result<Option<TypeDescriptor>> {
        if parser.peek_byte()? == ELEMENT_TYPE::VOID {
            parser.advance_by(1)?;
            return Ok(None);
        }
        Ok(Some(Self::decode(parser)?))
    }
}

impl From<PrimitiveType> for TypeDescriptor {
    fn from(primitive: PrimitiveType) -> Self {
        TypeDescriptor::Primitive(primitive)
    }
}

impl FromStr for TypeDescriptor {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(element) = s.strip_suffix("[]") {
            return Ok(TypeDescriptor::Array(Box::new(element.parse()?)));
        }
        if s.is_empty() {
            return Err(malformed_error!("Empty type name"));
        }

        Ok(match PrimitiveType::from_str(s) {
            Ok(primitive) => TypeDescriptor::Primitive(primitive),
            Err(_) => TypeDescriptor::Reference(s.to_string()),
        })
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Primitive(primitive) => write!(f, "{primitive}"),
            TypeDescriptor::Array(element) => write!(f, "{element}[]"),
            TypeDescriptor::Reference(name) => write!(f, "{name}"),
        }
    }
}
