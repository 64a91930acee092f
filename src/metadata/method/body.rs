//! Method bodies.

use crate::{assembly::InstructionSequence, metadata::typesystem::TypeDescriptor};

/// The executable part of a method: stack limit, local slots and code.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    /// Maximum number of items on the operand stack
    pub max_stack: u16,
    /// Declared types of the local variable slots, by index
    pub locals: Vec<TypeDescriptor>,
    /// The instructions
    pub code: InstructionSequence,
}

impl MethodBody {
    /// Create a body from its parts.
    #[must_use]
    pub fn new(max_stack: u16, locals: Vec<TypeDescriptor>, code: InstructionSequence) -> Self {
        MethodBody {
            max_stack,
            locals,
            code,
        }
    }
}
