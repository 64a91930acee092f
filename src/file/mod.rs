//! File access for module images.
//!
//! A [`File`] owns the raw bytes of a module image, either memory-mapped from disk
//! ([`physical::Physical`]) or held in an owned buffer ([`memory::Memory`]). The image
//! reader borrows the bytes through [`File::data`] and never copies the whole input.

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::path::Path;

use crate::{Error::Empty, Result};
use memory::Memory;
use physical::Physical;

/// Storage backend for the bytes of a [`File`].
pub trait Backend: Send + Sync {
    /// Returns the whole backing data.
    fn data(&self) -> &[u8];

    /// Returns the length of the backing data.
    fn len(&self) -> usize;
}

/// Raw bytes of a module image.
pub struct File {
    data: Box<dyn Backend>,
}

impl File {
    /// Map a file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped, and
    /// [`crate::Error::Empty`] if it has no content.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Wrap an owned buffer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Empty`] if `data` is empty.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        let input = Memory::new(data);

        Self::load(input)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        Ok(File {
            data: Box::new(data),
        })
    }

    /// The complete file contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Length of the file in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; empty inputs are rejected on load.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }
}
