//! CIL bytecode encoding for instruction sequences.
//!
//! The encoder is the reverse of [`crate::assembly::decode_body`]. It lays out every
//! instruction, resolves labels to byte offsets and writes relative displacements.
//! Branches keep the form they were decoded or built with, except that a short branch
//! whose displacement no longer fits in a signed byte (usually because a patch inserted
//! code between it and its target) is widened to the long form. Widening moves every
//! later instruction, which can push other short branches out of range, so the layout is
//! recomputed until it is stable. Branches are never shrunk, which keeps an unmodified
//! body byte-identical to its input.
//!
//! # Usage Examples
//!
//! ```rust
//! use cilsplice::assembly::{encode_body, Instruction, InstructionSequence};
//!
//! let mut code = InstructionSequence::new();
//! let end = code.new_label();
//! code.push(Instruction::branch("br.s", end)?);
//! for _ in 0..200 {
//!     code.push(Instruction::simple("nop")?);
//! }
//! code.mark_label(end, code.len())?;
//! code.push(Instruction::simple("ret")?);
//!
//! let bytes = encode_body(&code)?;
//! assert_eq!(bytes[0], 0x38); // widened to `br`
//! # Ok::<(), cilsplice::Error>(())
//! ```

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, Label, Operand, OperandType},
        instructions::{by_mnemonic, long_form, CilInstruction},
        sequence::InstructionSequence,
    },
    file::io::ByteWriter,
    Error, Result,
};

/// Lays out and writes one [`InstructionSequence`].
pub struct InstructionEncoder<'a> {
    code: &'a InstructionSequence,
    forms: Vec<&'static CilInstruction>,
    offsets: Vec<usize>,
}

impl<'a> InstructionEncoder<'a> {
    /// Prepare `code` for encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMnemonic`] if an instruction is outside the supported set.
    pub fn new(code: &'a InstructionSequence) -> Result<Self> {
        let forms = code
            .iter()
            .map(Instruction::info)
            .collect::<Result<Vec<_>>>()?;

        Ok(InstructionEncoder {
            code,
            forms,
            offsets: Vec::new(),
        })
    }

    /// Encode the sequence into bytecode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UndefinedLabel`] if a branch names a label that was never placed,
    /// [`Error::InvalidBranch`] if a label points past the last instruction, and
    /// [`Error::WrongOperandType`] if an operand does not match its opcode.
    pub fn encode(mut self) -> Result<Vec<u8>> {
        self.layout()?;

        let mut writer = ByteWriter::new();
        for (index, instruction) in self.code.iter().enumerate() {
            let form = self.forms[index];
            if form.prefix != 0 {
                writer.write_le::<u8>(form.prefix);
            }
            writer.write_le::<u8>(form.opcode);
            self.write_operand(&mut writer, index, form, &instruction.operand)?;
        }

        Ok(writer.into_inner())
    }

    /// Compute offsets, widening short branches until every displacement fits.
    fn layout(&mut self) -> Result<()> {
        loop {
            self.offsets = self.compute_offsets();

            let mut widened = false;
            for (index, instruction) in self.code.iter().enumerate() {
                let form = self.forms[index];
                if form.op_type != OperandType::ShortBranch {
                    continue;
                }
                let Operand::Target(label) = &instruction.operand else {
                    continue;
                };

                let end = self.offsets[index] + self.size_of(index);
                let delta = self.target_offset(*label)? as i64 - end as i64;
                if i8::try_from(delta).is_err() {
                    let long = long_form(form.instr).and_then(by_mnemonic).ok_or_else(|| {
                        Error::InvalidBranch(format!("no long form for '{}'", form.instr))
                    })?;
                    self.forms[index] = long;
                    widened = true;
                }
            }

            if !widened {
                return Ok(());
            }
        }
    }

    fn compute_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.forms.len() + 1);
        let mut offset = 0;
        for index in 0..self.forms.len() {
            offsets.push(offset);
            offset += self.size_of(index);
        }
        offsets.push(offset);
        offsets
    }

    fn size_of(&self, index: usize) -> usize {
        let form = self.forms[index];
        let opcode_len = if form.prefix != 0 { 2 } else { 1 };
        let operand_len = match (&form.op_type, &self.code.instructions()[index].operand) {
            (OperandType::Switch, Operand::Switch(labels)) => 4 + 4 * labels.len(),
            (op_type, _) => op_type.size().unwrap_or(0),
        };
        opcode_len + operand_len
    }

    fn target_offset(&self, label: Label) -> Result<usize> {
        let index = self
            .code
            .label_position(label)
            .ok_or(Error::UndefinedLabel(label.0))?;
        if index >= self.code.len() {
            return Err(Error::InvalidBranch(format!(
                "label {label} points past the last instruction"
            )));
        }
        Ok(self.offsets[index])
    }

    fn write_operand(
        &self,
        writer: &mut ByteWriter,
        index: usize,
        form: &CilInstruction,
        operand: &Operand,
    ) -> Result<()> {
        let end = (self.offsets[index] + self.size_of(index)) as i64;

        match (form.op_type, operand) {
            (OperandType::None, Operand::None) => {}
            (OperandType::Int8, Operand::Immediate(Immediate::Int8(v))) => writer.write_le(*v),
            (OperandType::Int32, Operand::Immediate(Immediate::Int32(v))) => writer.write_le(*v),
            (OperandType::Int64, Operand::Immediate(Immediate::Int64(v))) => writer.write_le(*v),
            (OperandType::Float32, Operand::Immediate(Immediate::Float32(v))) => {
                writer.write_le(*v);
            }
            (OperandType::Float64, Operand::Immediate(Immediate::Float64(v))) => {
                writer.write_le(*v);
            }
            (OperandType::Token, Operand::Token(token)) => writer.write_le(token.value()),
            (OperandType::ShortLocal, Operand::Local(i))
            | (OperandType::ShortArgument, Operand::Argument(i)) => {
                let short = u8::try_from(*i).map_err(|_| Error::WrongOperandType {
                    expected: format!("8-bit index for '{}'", form.instr),
                })?;
                writer.write_le(short);
            }
            (OperandType::Local, Operand::Local(i)) | (OperandType::Argument, Operand::Argument(i)) => {
                writer.write_le(*i);
            }
            (OperandType::ShortBranch, Operand::Target(label)) => {
                let delta = self.target_offset(*label)? as i64 - end;
                let short = i8::try_from(delta).map_err(|_| {
                    Error::InvalidBranch(format!("displacement {delta} does not fit '{}'", form.instr))
                })?;
                writer.write_le(short);
            }
            (OperandType::Branch, Operand::Target(label)) => {
                writer.write_le(self.displacement(*label, end)?);
            }
            (OperandType::Switch, Operand::Switch(labels)) => {
                writer.write_le(labels.len() as u32);
                for label in labels {
                    writer.write_le(self.displacement(*label, end)?);
                }
            }
            _ => {
                return Err(Error::WrongOperandType {
                    expected: format!("{:?} for '{}'", form.op_type, form.instr),
                })
            }
        }
        Ok(())
    }

    fn displacement(&self, label: Label, end: i64) -> Result<i32> {
        let delta = self.target_offset(label)? as i64 - end;
        i32::try_from(delta)
            .map_err(|_| Error::InvalidBranch(format!("displacement {delta} exceeds 32 bits")))
    }
}

/// Encode `code` into bytecode, see [`InstructionEncoder`].
///
/// # Errors
///
/// See [`InstructionEncoder::encode`].
pub fn encode_body(code: &InstructionSequence) -> Result<Vec<u8>> {
    InstructionEncoder::new(code)?.encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::decode_body;

    #[test]
    fn roundtrip_preserves_forms() {
        // ldarg.0; ldc.i4 1000; bgt 0 (to ret); ldc.i4.s 5; pop; ret
        let bytes = vec![
            0x02, 0x20, 0xE8, 0x03, 0x00, 0x00, 0x3D, 0x03, 0x00, 0x00, 0x00, 0x1F, 0x05, 0x26,
            0x2A,
        ];
        let code = decode_body(&bytes).unwrap();
        assert_eq!(code.get(2).unwrap().mnemonic, "bgt");
        assert_eq!(encode_body(&code).unwrap(), bytes);
    }

    #[test]
    fn widening_cascades() {
        // The outer branch fits until the inner one, which sits between the outer
        // branch and its target, is widened.
        let mut code = InstructionSequence::new();
        let outer = code.new_label();
        let inner = code.new_label();
        code.push(Instruction::branch("br.s", outer).unwrap());
        code.push(Instruction::branch("br.s", inner).unwrap());
        for _ in 0..124 {
            code.push(Instruction::simple("nop").unwrap());
        }
        code.mark_label(outer, code.len()).unwrap();
        for _ in 0..4 {
            code.push(Instruction::simple("nop").unwrap());
        }
        code.mark_label(inner, code.len()).unwrap();
        code.push(Instruction::simple("ret").unwrap());

        let bytes = encode_body(&code).unwrap();
        assert_eq!(bytes[0], 0x38);
        assert_eq!(bytes[5], 0x38);

        let decoded = decode_body(&bytes).unwrap();
        for (index, label) in [(0, outer), (1, inner)] {
            let target = decoded.get(index).unwrap().targets()[0];
            assert_eq!(decoded.label_position(target), code.label_position(label));
        }
    }

    #[test]
    fn unplaced_label_fails() {
        let mut code = InstructionSequence::new();
        let nowhere = code.new_label();
        code.push(Instruction::branch("br", nowhere).unwrap());
        assert!(matches!(encode_body(&code), Err(Error::UndefinedLabel(0))));

        code.mark_label(nowhere, 1).unwrap();
        assert!(matches!(encode_body(&code), Err(Error::InvalidBranch(_))));
    }
}
