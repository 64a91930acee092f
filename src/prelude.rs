//! # cilsplice Prelude
//!
//! The types most patch authors need, in one glob import: the image, descriptors and
//! the coordinator for offline patching, and the runtime pieces for load-time patching.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilsplice operations
pub use crate::Error;

/// The result type used throughout cilsplice
pub use crate::Result;

// ================================================================================================
// Metadata
// ================================================================================================

/// The module image and its definitions
pub use crate::metadata::image::{
    AssemblyImage, FieldAttributes, FieldDefinition, MemberReference, TypeAttributes,
    TypeDefinition,
};

/// Methods and bodies
pub use crate::metadata::method::{MethodAttributes, MethodBody, MethodDefinition};

/// Metadata tokens
pub use crate::metadata::token::{TableId, Token};

/// Field, parameter and local types
pub use crate::metadata::typesystem::{PrimitiveType, TypeDescriptor};

// ================================================================================================
// Instructions
// ================================================================================================

/// Instruction model
pub use crate::assembly::{Instruction, InstructionSequence, Label, Operand};

// ================================================================================================
// Patching
// ================================================================================================

/// Descriptors, actions and the coordinator
pub use crate::patch::{
    ApplyReport, CallbackRef, FieldSpec, ModuleTarget, PatchAction, PatchConfig,
    PatchCoordinator, PatchDescriptor, PatchResult,
};

/// Pattern building blocks
pub use crate::patch::{
    AnyMatcher, ArgumentMatcher, CallMatcher, ConstantMatcher, FieldAccess, FieldAccessMatcher,
    FlowMatcher, InstructionMatcher, LocalMatcher, OpcodeMatcher, Pattern, PredicateMatcher,
};

// ================================================================================================
// Runtime
// ================================================================================================

/// Runtime host and extension points
pub use crate::runtime::{
    CallbackChain, CapabilitySlot, NativeCall, NativeRegistry, ObjectRef, Runtime, RuntimeLimits,
    Value,
};
