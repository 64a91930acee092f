//! Field injection and instruction-stream patching.
//!
//! This module turns declarative [`PatchDescriptor`]s into edits of an
//! [`crate::metadata::image::AssemblyImage`]. It is organised in layers, each usable on
//! its own:
//!
//! - [`inject_field`] adds a field to a type
//! - [`Pattern`] and the [`InstructionMatcher`] implementations locate instruction
//!   sequences inside a method body
//! - [`Cursor`] edits a body while keeping every branch target consistent
//! - [`apply_patch`] combines a pattern with a [`BoundAction`], verifies the result
//!   with [`verify_method`] and restores the body if verification fails
//! - [`PatchCoordinator`] applies descriptors in order, keeps the idempotency ledger,
//!   and drives the offline ([`PatchCoordinator::patch_file`]) and load-time
//!   ([`PatchCoordinator::install`]) variants
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilsplice::{
//!     metadata::typesystem::TypeDescriptor,
//!     patch::{CallbackRef, CallMatcher, PatchAction, PatchCoordinator, PatchDescriptor, Pattern},
//! };
//! use std::path::Path;
//!
//! // pass the value returned by Game.Score::Add through Mods.Score::Adjust
//! let adjust = PatchDescriptor::instruction_patch(
//!     "score-adjust",
//!     "Game.Round",
//!     "Finish",
//!     Pattern::new().then(CallMatcher::new().type_name("Game.Score").method_name("Add")),
//!     PatchAction::InsertAfter(vec![CallbackRef::new("Mods.Score", "Adjust")
//!         .params(vec![TypeDescriptor::int32()])
//!         .returns(TypeDescriptor::int32())
//!         .into()]),
//! );
//!
//! let mut coordinator = PatchCoordinator::new();
//! let report = coordinator.patch_file(Path::new("Host.img"), Path::new("Host.patched.img"), &[adjust])?;
//! for failure in &report.failed {
//!     eprintln!("{}: {}", failure.name, failure.reason);
//! }
//! # Ok::<(), cilsplice::Error>(())
//! ```

mod action;
mod config;
mod coordinator;
mod cursor;
mod descriptor;
mod injector;
mod patcher;
mod pattern;
mod verify;

pub use action::{BoundAction, CallbackRef, Emit, PatchAction};
pub use config::PatchConfig;
pub use coordinator::{
    recorded_ids, AppliedPatch, ApplyReport, FailedPatch, FailureReason, ModuleReport,
    ModuleTarget, PatchCoordinator, SkipReason, SkippedPatch, LEDGER_NAMESPACE, LEDGER_TYPE,
};
pub use cursor::Cursor;
pub use descriptor::{DescriptorId, FieldSpec, PatchDescriptor, PatchKind, PatchTarget};
pub use injector::inject_field;
pub use patcher::{apply_patch, PatchResult};
pub use pattern::{
    AnyMatcher, ArgumentMatcher, CallMatcher, ConstantMatcher, FieldAccess, FieldAccessMatcher,
    FlowMatcher, Gap, InstructionMatcher, InstructionPredicate, LocalAccess, LocalMatcher,
    OpcodeMatcher, Pattern, PatternMatch, PatternStep, PredicateMatcher,
};
pub use verify::verify_method;
