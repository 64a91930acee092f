//! Metadata representation for patchable modules.
//!
//! This module contains the in-memory model that the patch pipeline edits and the
//! runtime executes: the module image with its types, fields, methods and member
//! references, the tokens that address them, and the type descriptors that describe
//! field, parameter and local types.
//!
//! # Key Components
//!
//! - [`image`] - [`image::AssemblyImage`], its definitions and its binary codec
//! - [`method`] - Method definitions, attributes and bodies
//! - [`token`] - Metadata table row references used throughout the crate
//! - [`typesystem`] - Primitive and composite type descriptors
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilsplice::metadata::image::AssemblyImage;
//! use std::path::Path;
//!
//! let image = AssemblyImage::from_file(Path::new("Host.img"))?;
//! for ty in image.types() {
//!     println!("{} - {} fields, {} methods", ty.full_name(), ty.fields.len(), ty.methods.len());
//! }
//! # Ok::<(), cilsplice::Error>(())
//! ```

/// Implementation of the module image and its serialization
pub mod image;
/// Implementation of method definitions and bodies
pub mod method;
/// Implementation of the metadata token
pub mod token;
/// Implementation of type descriptors
pub mod typesystem;
