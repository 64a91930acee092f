//! Low-level byte stream parser for image and CIL decoding.
//!
//! This module provides the [`Parser`] type, a cursor-based binary data parser used by the
//! image reader and the instruction decoder. All operations validate data availability
//! before reading and report [`crate::Error::OutOfBounds`] instead of panicking.
//!
//! # Usage Examples
//!
//! ```rust
//! use cilsplice::Parser;
//!
//! // a call token followed by a compressed length
//! let bytes = [0x01, 0x00, 0x00, 0x06, 0x81, 0x02];
//! let mut parser = Parser::new(&bytes);
//!
//! assert_eq!(parser.read_le::<u32>()?, 0x0600_0001);
//! assert_eq!(parser.read_compressed_uint()?, 0x0102);
//! assert!(!parser.has_more_data());
//! # Ok::<(), cilsplice::Error>(())
//! ```

use crate::{
    file::io::{read_le_at, CilIO},
    Result,
};

/// A cursor over a byte slice with bounds-checked little-endian reads.
///
/// # Thread Safety
///
/// [`Parser`] holds a mutable position and is intended for single-threaded,
/// sequential use. Create one parser per thread when decoding in parallel.
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new parser positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Total length of the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the underlying data is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if there are unread bytes left.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Move to an absolute position.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is beyond the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Skip `step` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `step` bytes remain.
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        if self.position + step > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position += step;
        Ok(())
    }

    /// Current read position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Peek at the next byte without advancing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] at the end of the data.
    pub fn peek_byte(&self) -> Result<u8> {
        if self.position >= self.data.len() {
            return Err(out_of_bounds_error!());
        }
        Ok(self.data[self.position])
    }

    /// Read a little-endian primitive and advance.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit in the remaining data.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read `length` raw bytes and advance.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `length` bytes remain.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        if self.position + length > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        let slice = &self.data[self.position..self.position + length];
        self.position += length;
        Ok(slice)
    }

    /// Read an ECMA-335 II.23.2 compressed unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for an invalid leading byte, or
    /// [`crate::Error::OutOfBounds`] if the encoding is truncated.
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let lead = self.read_le::<u8>()?;
        let (width, high) = match lead.leading_ones() {
            0 => return Ok(u32::from(lead)),
            1 => (1, lead & 0x3F),
            2 => (3, lead & 0x1F),
            _ => return Err(malformed_error!("Invalid compressed uint lead byte 0x{:02x}", lead)),
        };

        let mut value = u32::from(high);
        for byte in self.read_bytes(width)? {
            value = (value << 8) | u32::from(*byte);
        }
        Ok(value)
    }

    /// Read a UTF-8 string prefixed with its compressed byte length.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the string is truncated, or
    /// [`crate::Error::Malformed`] if it is not valid UTF-8.
    pub fn read_prefixed_string_utf8(&mut self) -> Result<String> {
        let length = self.read_compressed_uint()? as usize;
        let string_data = self.read_bytes(length)?;

        String::from_utf8(string_data.to_vec()).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                self.position - length,
                self.position,
                e.utf8_error()
            )
        })
    }
}
