//! Editable instruction sequences with a central label table.
//!
//! An [`InstructionSequence`] owns a method's instructions plus a table mapping each
//! [`Label`] to the index of the instruction it marks. Branches name labels, so every
//! structural edit (insert, remove, replace) only has to update this one table to keep
//! all branch targets valid. This is the single place where "branch targets after the
//! insertion point move with the code" is implemented.
//!
//! # Examples
//!
//! ```rust
//! use cilsplice::assembly::{Instruction, InstructionSequence};
//!
//! let mut code = InstructionSequence::new();
//! let end = code.new_label();
//! code.push(Instruction::ldarg(0)?);
//! code.push(Instruction::branch("brfalse.s", end)?);
//! code.push(Instruction::simple("nop")?);
//! code.mark_label(end, 3)?;
//! code.push(Instruction::simple("ret")?);
//!
//! // Splicing before the nop moves the label along with the ret.
//! code.insert(2, vec![Instruction::simple("nop")?], false)?;
//! assert_eq!(code.label_position(end), Some(4));
//! # Ok::<(), cilsplice::Error>(())
//! ```

use std::{fmt, ops::Range};

use crate::{
    assembly::instruction::{Instruction, Label, Operand},
    Error, Result,
};

/// A method body's instructions and label table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionSequence {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
}

impl InstructionSequence {
    /// Create an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sequence from straight-line instructions.
    ///
    /// Any labels the instructions reference must be created with
    /// [`InstructionSequence::new_label`] before verification succeeds.
    #[must_use]
    pub fn from_instructions(instructions: Vec<Instruction>) -> Self {
        InstructionSequence {
            instructions,
            labels: Vec::new(),
        }
    }

    pub(crate) fn from_parts(instructions: Vec<Instruction>, labels: Vec<Option<usize>>) -> Self {
        InstructionSequence {
            instructions,
            labels,
        }
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns true if the sequence holds no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// The instructions in order.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Instruction at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    /// Iterate over the instructions.
    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    /// Number of labels ever created, placed or not.
    #[must_use]
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Append an instruction.
    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Create a new, unplaced label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Place `label` on the instruction at `index`.
    ///
    /// `index` may equal the current length, which anchors the label at the next
    /// instruction to be pushed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UndefinedLabel`] if the label was not created by this sequence and
    /// [`Error::OutOfBounds`] if `index` is past the end.
    pub fn mark_label(&mut self, label: Label, index: usize) -> Result<()> {
        if index > self.instructions.len() {
            return Err(out_of_bounds_error!());
        }
        let slot = self
            .labels
            .get_mut(label.0 as usize)
            .ok_or(Error::UndefinedLabel(label.0))?;
        *slot = Some(index);
        Ok(())
    }

    /// Index of the instruction `label` marks, if placed.
    #[must_use]
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Labels placed on the instruction at `index`.
    #[must_use]
    pub fn labels_at(&self, index: usize) -> Vec<Label> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, position)| **position == Some(index))
            .map(|(label, _)| Label(label as u32))
            .collect()
    }

    /// Returns true if any branch in the sequence can jump to `index`.
    #[must_use]
    pub fn is_branch_target(&self, index: usize) -> bool {
        let labels = self.labels_at(index);
        !labels.is_empty()
            && self
                .instructions
                .iter()
                .any(|instr| instr.targets().iter().any(|t| labels.contains(t)))
    }

    /// Insert `new` before the instruction at `index`.
    ///
    /// Labels positioned after `index` shift with their instructions. Labels positioned
    /// exactly at `index` stay on the first inserted instruction when `take_labels` is
    /// true, so branches to the old instruction now run the inserted code first; when
    /// false they shift and keep pointing at the old instruction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] if `index` is past the end.
    pub fn insert(&mut self, index: usize, new: Vec<Instruction>, take_labels: bool) -> Result<()> {
        if index > self.instructions.len() {
            return Err(out_of_bounds_error!());
        }

        let count = new.len();
        for position in self.labels.iter_mut().flatten() {
            if *position > index || (*position == index && !take_labels) {
                *position += count;
            }
        }

        self.instructions.splice(index..index, new);
        Ok(())
    }

    /// Replace the instructions in `range` with `new`.
    ///
    /// Labels on the first replaced instruction move to the first replacement (or to
    /// whatever follows, if `new` is empty). Labels after the range shift.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBranch`] if a label points strictly inside the range,
    /// since no instruction would remain for it to mark, and [`Error::OutOfBounds`] for an
    /// invalid range. The sequence is unchanged on error.
    pub fn replace(&mut self, range: Range<usize>, new: Vec<Instruction>) -> Result<Vec<Instruction>> {
        if range.start > range.end || range.end > self.instructions.len() {
            return Err(out_of_bounds_error!());
        }

        if let Some((label, _)) = self
            .labels
            .iter()
            .enumerate()
            .find(|(_, p)| matches!(p, Some(p) if *p > range.start && *p < range.end))
        {
            return Err(Error::InvalidBranch(format!(
                "label L{label} targets an instruction inside the replaced range {}..{}",
                range.start, range.end
            )));
        }

        let removed = range.end - range.start;
        let added = new.len();
        for position in self.labels.iter_mut().flatten() {
            if *position >= range.end {
                *position = *position - removed + added;
            }
        }

        Ok(self.instructions.splice(range, new).collect())
    }

    /// Remove the instructions in `range`.
    ///
    /// # Errors
    ///
    /// See [`InstructionSequence::replace`].
    pub fn remove(&mut self, range: Range<usize>) -> Result<Vec<Instruction>> {
        self.replace(range, Vec::new())
    }

    /// Point the branch at `index` to `label`, returning its old target.
    ///
    /// For a `switch`, `case` selects the entry to retarget; it is ignored for plain
    /// branches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBranch`] if the instruction is not a branch or the case
    /// does not exist, and [`Error::OutOfBounds`] for an invalid index.
    pub fn retarget(&mut self, index: usize, case: Option<usize>, label: Label) -> Result<Label> {
        if label.0 as usize >= self.labels.len() {
            return Err(Error::UndefinedLabel(label.0));
        }

        let instruction = self
            .instructions
            .get_mut(index)
            .ok_or_else(|| out_of_bounds_error!())?;

        match (&mut instruction.operand, case) {
            (Operand::Target(target), _) => Ok(std::mem::replace(target, label)),
            (Operand::Switch(targets), Some(case)) => {
                let count = targets.len();
                let target = targets.get_mut(case).ok_or_else(|| {
                    Error::InvalidBranch(format!("switch has {count} cases, no case {case}"))
                })?;
                Ok(std::mem::replace(target, label))
            }
            (Operand::Switch(_), None) => Err(Error::InvalidBranch(
                "a switch case must be selected to retarget a switch".to_string(),
            )),
            _ => Err(Error::InvalidBranch(format!(
                "instruction '{}' at {index} is not a branch",
                instruction.mnemonic
            ))),
        }
    }
}

impl<'a> IntoIterator for &'a InstructionSequence {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

impl fmt::Display for InstructionSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, instruction) in self.instructions.iter().enumerate() {
            for label in self.labels_at(index) {
                writeln!(f, "{label}:")?;
            }
            writeln!(f, "  {index:04}: {instruction}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_body() -> (InstructionSequence, Label) {
        // 0: ldc.i4.0  1: stloc.0  2: ldloc.0  3: ldc.i4.1  4: add  5: stloc.0
        // 6: ldloc.0   7: ldc.i4.s 10  8: blt.s L0  9: ret
        let mut code = InstructionSequence::new();
        let head = code.new_label();
        for instr in [
            Instruction::ldc_i4(0),
            Instruction::stloc(0),
            Instruction::ldloc(0),
            Instruction::ldc_i4(1),
            Instruction::simple("add"),
            Instruction::stloc(0),
            Instruction::ldloc(0),
            Instruction::ldc_i4(10),
            Instruction::branch("blt.s", head),
            Instruction::simple("ret"),
        ] {
            code.push(instr.unwrap());
        }
        code.mark_label(head, 2).unwrap();
        (code, head)
    }

    #[test]
    fn insert_shifts_labels_after_point() {
        let (mut code, head) = loop_body();
        code.insert(1, vec![Instruction::simple("nop").unwrap()], false)
            .unwrap();
        assert_eq!(code.label_position(head), Some(3));
        assert_eq!(code.get(3).unwrap().mnemonic, "ldloc.0");
    }

    #[test]
    fn insert_at_label_with_and_without_taking() {
        let (mut code, head) = loop_body();
        code.insert(2, vec![Instruction::simple("nop").unwrap()], true)
            .unwrap();
        assert_eq!(code.label_position(head), Some(2));
        assert_eq!(code.get(2).unwrap().mnemonic, "nop");

        let (mut code, head) = loop_body();
        code.insert(2, vec![Instruction::simple("nop").unwrap()], false)
            .unwrap();
        assert_eq!(code.label_position(head), Some(3));
        assert_eq!(code.get(3).unwrap().mnemonic, "ldloc.0");
    }

    #[test]
    fn replace_rejects_interior_labels() {
        let (mut code, _) = loop_body();
        let before = code.clone();
        assert!(matches!(
            code.replace(1..4, vec![]),
            Err(Error::InvalidBranch(_))
        ));
        assert_eq!(code, before);
    }

    #[test]
    fn replace_moves_trailing_labels() {
        let (mut code, head) = loop_body();
        let removed = code
            .replace(0..2, vec![Instruction::simple("nop").unwrap()])
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(code.len(), 9);
        assert_eq!(code.label_position(head), Some(1));
    }

    #[test]
    fn retarget_branch_and_switch() {
        let (mut code, head) = loop_body();
        let other = code.new_label();
        code.mark_label(other, 9).unwrap();
        assert_eq!(code.retarget(8, None, other).unwrap(), head);
        assert_eq!(code.get(8).unwrap().targets(), vec![other]);
        assert!(matches!(
            code.retarget(0, None, head),
            Err(Error::InvalidBranch(_))
        ));

        let mut switch = InstructionSequence::new();
        let a = switch.new_label();
        let b = switch.new_label();
        switch.push(Instruction::ldarg(0).unwrap());
        switch.push(Instruction::switch(vec![a, a]).unwrap());
        assert_eq!(switch.retarget(1, Some(1), b).unwrap(), a);
        assert_eq!(switch.get(1).unwrap().targets(), vec![a, b]);
        assert!(switch.retarget(1, Some(2), b).is_err());
        assert!(switch.retarget(1, None, b).is_err());
    }

    #[test]
    fn branch_target_detection() {
        let (code, _) = loop_body();
        assert!(code.is_branch_target(2));
        assert!(!code.is_branch_target(3));
        assert!(code.to_string().contains("L0:\n  0002: ldloc.0"));
    }
}
