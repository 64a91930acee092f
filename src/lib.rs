// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # cilsplice
//!
//! Augment compiled CIL modules you do not own: inject new fields into existing type
//! definitions and splice new call sites into existing method bodies, either offline
//! by rewriting the module image or at load time by installing rewritten bodies into a
//! live method table before they run.
//!
//! Host modules change between versions, so nothing here assumes a patch target is
//! present. A missing type, method or instruction pattern is reported per patch and the
//! pass goes on; only a body that fails verification after an edit stops a pass, before
//! anything is written back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cilsplice::prelude::*;
//! use std::path::Path;
//!
//! let patches = [
//!     PatchDescriptor::inject_field(
//!         "player-shield",
//!         "Game.Player",
//!         FieldSpec::new("shield", TypeDescriptor::int32()),
//!     ),
//!     PatchDescriptor::instruction_patch(
//!         "tick-hook",
//!         "Game.Player",
//!         "Tick",
//!         Pattern::new().then(OpcodeMatcher::new("ret")),
//!         PatchAction::InsertBefore(vec![CallbackRef::new("Mods.Hooks", "OnTick").into()]),
//!     ),
//! ];
//!
//! let mut coordinator = PatchCoordinator::new();
//! let report = coordinator.patch_file(
//!     Path::new("Host.img"),
//!     Path::new("Host.patched.img"),
//!     &patches,
//! )?;
//! println!("{} applied, {} skipped, {} failed",
//!     report.applied.len(), report.skipped.len(), report.failed.len());
//! # Ok::<(), cilsplice::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`file`] - Memory-mapped input and little-endian byte IO
//! - [`metadata`] - The module image: types, fields, methods, member references, tokens
//! - [`assembly`] - Instruction model with label-based branches, decoder and encoder
//! - [`patch`] - Field injector, pattern matcher, cursor, patcher, verifier and coordinator
//! - [`runtime`] - Interpreter host with a live method table, natives, callback chains and
//!   capability slots for injected fields
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade: `debug!` for every applied edit, `warn!`
//! for misses and skips, `info!` for pass summaries and `error!` for aborted passes.
//! Pick any `log` backend in the binary to see them.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use cilsplice::prelude::*;
///
/// let pattern = Pattern::new()
///     .then(LocalMatcher::store())
///     .eventually(OpcodeMatcher::new("ret"));
/// assert_eq!(pattern.len(), 2);
/// ```
pub mod prelude;

/// Module image bytes and the byte-level parser and writer.
pub mod file;

/// CIL instructions with label-based branches, decoding and encoding.
pub mod assembly;

/// The metadata model of a module image.
pub mod metadata;

/// Field injection, instruction patching and the patch coordinator.
pub mod patch;

/// Interpreter host, natives and capability slots.
pub mod runtime;

/// `cilsplice` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `cilsplice` Error type
///
/// Every fallible operation in the crate returns this type; the variant documentation
/// lists which stage produces each one.
pub use error::Error;

/// Raw image bytes, memory-mapped or owned.
pub use file::File;

/// Cursor-based little-endian parser.
pub use file::parser::Parser;
