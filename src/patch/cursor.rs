//! A movable position inside an instruction sequence.
//!
//! The [`Cursor`] is the editing surface patch actions are written against. It wraps
//! [`InstructionSequence`] so that every edit goes through the sequence's label
//! bookkeeping, and it keeps its own position stable across insertions: after
//! inserting before the current instruction the cursor still points at that same
//! instruction.

use std::ops::Range;

use crate::{
    assembly::{Instruction, InstructionSequence, Label},
    metadata::image::TokenResolver,
    patch::pattern::{Pattern, PatternMatch},
    Result,
};

/// Editing cursor over a method body.
pub struct Cursor<'a> {
    code: &'a mut InstructionSequence,
    position: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the first instruction.
    pub fn new(code: &'a mut InstructionSequence) -> Self {
        Cursor { code, position: 0 }
    }

    /// The current instruction index.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// The instruction under the cursor.
    #[must_use]
    pub fn current(&self) -> Option<&Instruction> {
        self.code.get(self.position)
    }

    /// The underlying sequence.
    #[must_use]
    pub fn code(&self) -> &InstructionSequence {
        self.code
    }

    /// Move to `index`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `index` is past the end.
    pub fn seek(&mut self, index: usize) -> Result<()> {
        if index > self.code.len() {
            return Err(out_of_bounds_error!());
        }
        self.position = index;
        Ok(())
    }

    /// Move one instruction forward, returning false at the end.
    pub fn advance(&mut self) -> bool {
        if self.position < self.code.len() {
            self.position += 1;
        }
        self.position < self.code.len()
    }

    /// Move to the next instruction at or after the cursor satisfying `predicate`.
    ///
    /// The cursor does not move when nothing matches.
    pub fn find_next<F>(&mut self, predicate: F) -> Option<usize>
    where
        F: Fn(&Instruction) -> bool,
    {
        let found = (self.position..self.code.len())
            .find(|&index| self.code.get(index).is_some_and(&predicate))?;
        self.position = found;
        Some(found)
    }

    /// Move to the start of the next match of `pattern` at or after the cursor.
    ///
    /// The cursor does not move when nothing matches.
    pub fn find_pattern(
        &mut self,
        pattern: &Pattern,
        resolver: &dyn TokenResolver,
    ) -> Option<PatternMatch> {
        let found = pattern.find(self.code, self.position, resolver)?;
        self.position = found.start();
        Some(found)
    }

    /// Insert `instructions` before the current instruction.
    ///
    /// With `take_labels`, branches that targeted the current instruction now land on
    /// the first inserted one. The cursor keeps pointing at the original instruction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the cursor is past the end.
    pub fn insert_before(&mut self, instructions: Vec<Instruction>, take_labels: bool) -> Result<()> {
        let count = instructions.len();
        self.code.insert(self.position, instructions, take_labels)?;
        self.position += count;
        Ok(())
    }

    /// Insert `instructions` after the current instruction.
    ///
    /// Branches that targeted the following instruction keep doing so and skip the
    /// inserted code. The cursor moves to the last inserted instruction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the cursor is at the end.
    pub fn insert_after(&mut self, instructions: Vec<Instruction>) -> Result<()> {
        if self.position >= self.code.len() {
            return Err(out_of_bounds_error!());
        }
        let count = instructions.len();
        self.code.insert(self.position + 1, instructions, false)?;
        self.position += count;
        Ok(())
    }

    /// Remove `range` and put the cursor on whatever follows it.
    ///
    /// # Errors
    ///
    /// See [`InstructionSequence::remove`].
    pub fn remove(&mut self, range: Range<usize>) -> Result<Vec<Instruction>> {
        let start = range.start;
        let removed = self.code.remove(range)?;
        self.position = start;
        Ok(removed)
    }

    /// Replace `range` with `instructions` and put the cursor on the first replacement.
    ///
    /// # Errors
    ///
    /// See [`InstructionSequence::replace`].
    pub fn replace(&mut self, range: Range<usize>, instructions: Vec<Instruction>) -> Result<Vec<Instruction>> {
        let start = range.start;
        let removed = self.code.replace(range, instructions)?;
        self.position = start;
        Ok(removed)
    }

    /// Append `instructions` at the end of the body, returning a label on the first one.
    ///
    /// The cursor does not move.
    ///
    /// # Errors
    ///
    /// Returns an error only if the label table is inconsistent.
    pub fn append_block(&mut self, instructions: Vec<Instruction>) -> Result<Label> {
        let label = self.code.new_label();
        let start = self.code.len();
        self.code.mark_label(label, start)?;
        for instruction in instructions {
            self.code.push(instruction);
        }
        Ok(label)
    }

    /// Append `instructions` at the end of the body without labelling them.
    pub fn append(&mut self, instructions: Vec<Instruction>) {
        for instruction in instructions {
            self.code.push(instruction);
        }
    }

    /// Create a new, unplaced label.
    pub fn new_label(&mut self) -> Label {
        self.code.new_label()
    }

    /// Place `label` on the current instruction.
    ///
    /// # Errors
    ///
    /// See [`InstructionSequence::mark_label`].
    pub fn mark_label(&mut self, label: Label) -> Result<()> {
        self.code.mark_label(label, self.position)
    }

    /// Point the branch at `index` (or one of its switch cases) to `label`, returning
    /// the previous target.
    ///
    /// # Errors
    ///
    /// See [`InstructionSequence::retarget`].
    pub fn redirect(&mut self, index: usize, case: Option<usize>, label: Label) -> Result<Label> {
        self.code.retarget(index, case, label)
    }
}
