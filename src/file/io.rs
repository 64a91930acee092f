//! Little-endian primitive IO and ECMA-335 compressed integer encoding.
//!
//! The image codec reads through [`crate::file::parser::Parser`] and writes through
//! [`ByteWriter`]; both sit on top of the [`CilIO`] trait defined here so that the
//! reader and writer agree on the width and byte order of every primitive.
//!
//! # Key Components
//!
//! - [`CilIO`] - Conversion between primitives and their byte representation
//! - [`read_le_at`] - Bounds-checked little-endian read at a moving offset
//! - [`ByteWriter`] - Growable little-endian output buffer
//!
//! # Examples
//!
//! ```rust
//! use cilsplice::file::io::{read_le_at, ByteWriter};
//!
//! let mut writer = ByteWriter::new();
//! writer.write_le::<u32>(0x0600_0001);
//! writer.write_compressed_uint(300)?;
//!
//! let bytes = writer.into_inner();
//! let mut offset = 0;
//! assert_eq!(read_le_at::<u32>(&bytes, &mut offset)?, 0x0600_0001);
//! # Ok::<(), cilsplice::Error>(())
//! ```

use crate::Result;

/// Trait for primitives that can be read from and written to little-endian byte slices.
///
/// Implemented for all fixed-width integers and floats used by the image format.
pub trait CilIO: Sized {
    /// The fixed-size byte array backing this type
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Build the value from its little-endian representation
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Convert the value into its little-endian representation
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io! {
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
    f32 => 4,
    f64 => 8,
}

/// Read a little-endian value of type `T` at `offset`, advancing `offset` past it.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    if (type_len + *offset) > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..*offset + type_len].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset += type_len;

    Ok(T::from_le_bytes(read))
}

/// Read a little-endian value of type `T` from the start of `data`.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Growable output buffer for the image writer and the instruction encoder.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    data: Vec<u8>,
}

impl ByteWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a little-endian primitive.
    pub fn write_le<T: CilIO>(&mut self, value: T) {
        self.data.extend_from_slice(value.to_le_bytes().as_ref());
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append an ECMA-335 II.23.2 compressed unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if `value` exceeds `0x1FFF_FFFF`, the largest
    /// value the encoding can carry.
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        match value {
            0..=0x7F => self.data.push(value as u8),
            0x80..=0x3FFF => {
                self.data.push(((value >> 8) as u8) | 0x80);
                self.data.push(value as u8);
            }
            0x4000..=0x1FFF_FFFF => {
                self.data.push(((value >> 24) as u8) | 0xC0);
                self.data.push((value >> 16) as u8);
                self.data.push((value >> 8) as u8);
                self.data.push(value as u8);
            }
            _ => {
                return Err(malformed_error!(
                    "Value {:#x} is too large for compressed encoding",
                    value
                ))
            }
        }
        Ok(())
    }

    /// Append a UTF-8 string prefixed with its compressed byte length.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the string is too long to encode.
    pub fn write_prefixed_string_utf8(&mut self, value: &str) -> Result<()> {
        let length = u32::try_from(value.len())
            .map_err(|_| malformed_error!("String of {} bytes is too long", value.len()))?;
        self.write_compressed_uint(length)?;
        self.data.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Overwrite bytes at an absolute position, used to patch forward offsets.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range lies beyond the written data.
    pub fn patch_at(&mut self, position: usize, bytes: &[u8]) -> Result<()> {
        let end = position + bytes.len();
        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }
        self.data[position..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Access the bytes written so far.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume the writer and return the buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}
