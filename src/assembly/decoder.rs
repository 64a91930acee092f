//! CIL bytecode decoding into label-based instruction sequences.
//!
//! Decoding happens in two passes. The first pass reads every instruction linearly and
//! records branch destinations as absolute byte offsets. The second pass maps each
//! destination onto the instruction that starts at that offset and replaces it with a
//! [`Label`], so that the resulting [`InstructionSequence`] no longer depends on byte
//! layout at all.
//!
//! # Usage Examples
//!
//! ```rust
//! use cilsplice::assembly::{decode_body, encode_body};
//!
//! // ldarg.0; brfalse.s +1; nop; ret
//! let bytes = [0x02, 0x2C, 0x01, 0x00, 0x2A];
//! let code = decode_body(&bytes)?;
//!
//! assert_eq!(code.len(), 4);
//! assert_eq!(code.label_position(code.get(1).unwrap().targets()[0]), Some(3));
//! assert_eq!(encode_body(&code)?, bytes);
//! # Ok::<(), cilsplice::Error>(())
//! ```

use std::collections::{BTreeMap, HashMap};

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, Label, Operand, OperandType},
        instructions::{by_opcode, FE_PREFIX},
        sequence::InstructionSequence,
    },
    metadata::token::Token,
    Parser, Result,
};

/// Destination of a branch before labels are assigned.
enum RawTargets {
    None,
    Single(i64),
    Switch(Vec<i64>),
}

/// Decode a complete method body.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] for unknown opcodes or for branches that do not
/// land on an instruction boundary inside the body, and [`crate::Error::OutOfBounds`] if
/// an instruction is truncated.
pub fn decode_body(code: &[u8]) -> Result<InstructionSequence> {
    let mut parser = Parser::new(code);
    let mut decoded = Vec::new();
    let mut offsets = HashMap::new();

    while parser.has_more_data() {
        let offset = parser.pos();
        let (instruction, targets) = decode_instruction(&mut parser)?;
        offsets.insert(offset as i64, decoded.len());
        decoded.push((offset, instruction, targets));
    }

    let mut label_of = BTreeMap::new();
    for (_, _, targets) in &decoded {
        let destinations = match targets {
            RawTargets::None => continue,
            RawTargets::Single(target) => std::slice::from_ref(target),
            RawTargets::Switch(targets) => targets.as_slice(),
        };
        for target in destinations {
            if !offsets.contains_key(target) {
                return Err(malformed_error!(
                    "Branch target {:#x} is not an instruction boundary",
                    target
                ));
            }
            label_of.insert(*target, 0_u32);
        }
    }

    let mut labels = Vec::with_capacity(label_of.len());
    for (number, (target, label)) in label_of.iter_mut().enumerate() {
        *label = number as u32;
        labels.push(offsets.get(target).copied());
    }

    let mut instructions = Vec::with_capacity(decoded.len());
    for (_, mut instruction, targets) in decoded {
        let to_label = |target: &i64| Label(label_of.get(target).copied().unwrap_or_default());
        match targets {
            RawTargets::None => {}
            RawTargets::Single(target) => instruction.operand = Operand::Target(to_label(&target)),
            RawTargets::Switch(targets) => {
                instruction.operand = Operand::Switch(targets.iter().map(to_label).collect());
            }
        }
        instructions.push(instruction);
    }

    Ok(InstructionSequence::from_parts(instructions, labels))
}

/// Decode one instruction, returning branch destinations as absolute byte offsets.
fn decode_instruction(parser: &mut Parser) -> Result<(Instruction, RawTargets)> {
    let first_byte = parser.read_le::<u8>()?;
    let (prefix, opcode) = if first_byte == FE_PREFIX {
        (FE_PREFIX, parser.read_le::<u8>()?)
    } else {
        (0, first_byte)
    };

    let info = by_opcode(prefix, opcode).ok_or_else(|| {
        if prefix == 0 {
            malformed_error!("Invalid opcode: {:02X}", opcode)
        } else {
            malformed_error!("Invalid opcode: FE {:02X}", opcode)
        }
    })?;

    let mut targets = RawTargets::None;
    let operand = match info.op_type {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
        OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
        OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
        OperandType::Float32 => Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?)),
        OperandType::Float64 => Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)),
        OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandType::ShortLocal => Operand::Local(u16::from(parser.read_le::<u8>()?)),
        OperandType::Local => Operand::Local(parser.read_le::<u16>()?),
        OperandType::ShortArgument => Operand::Argument(u16::from(parser.read_le::<u8>()?)),
        OperandType::Argument => Operand::Argument(parser.read_le::<u16>()?),
        OperandType::ShortBranch => {
            let delta = i64::from(parser.read_le::<i8>()?);
            targets = RawTargets::Single(parser.pos() as i64 + delta);
            Operand::None
        }
        OperandType::Branch => {
            let delta = i64::from(parser.read_le::<i32>()?);
            targets = RawTargets::Single(parser.pos() as i64 + delta);
            Operand::None
        }
        OperandType::Switch => {
            let case_count = parser.read_le::<u32>()? as usize;
            let remaining = parser.len().saturating_sub(parser.pos());
            if case_count > remaining / 4 {
                return Err(out_of_bounds_error!());
            }

            let mut deltas = Vec::with_capacity(case_count);
            for _ in 0..case_count {
                deltas.push(i64::from(parser.read_le::<i32>()?));
            }
            let end = parser.pos() as i64;
            targets = RawTargets::Switch(deltas.into_iter().map(|d| end + d).collect());
            Operand::None
        }
    };

    Ok((
        Instruction {
            opcode: info.opcode,
            prefix: info.prefix,
            mnemonic: info.instr,
            flow_type: info.flow,
            operand,
        },
        targets,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn decode_simple() {
        let bytes = [0x00, 0x17, 0x2A];
        let code = decode_body(&bytes).unwrap();
        let mnemonics: Vec<_> = code.iter().map(|i| i.mnemonic).collect();
        assert_eq!(mnemonics, ["nop", "ldc.i4.1", "ret"]);
        assert_eq!(code.label_count(), 0);
    }

    #[test]
    fn decode_two_byte_and_operands() {
        // ldloc 0x0102; ldc.i4.s -2; ceq; call 0x0A000003; ret
        let bytes = [
            0xFE, 0x0C, 0x02, 0x01, 0x1F, 0xFE, 0xFE, 0x01, 0x28, 0x03, 0x00, 0x00, 0x0A, 0x2A,
        ];
        let code = decode_body(&bytes).unwrap();
        assert_eq!(code.get(0).unwrap().operand, Operand::Local(0x0102));
        assert_eq!(code.get(1).unwrap().constant(), Some(-2));
        assert_eq!(code.get(2).unwrap().mnemonic, "ceq");
        assert_eq!(code.get(3).unwrap().token(), Some(Token::new(0x0A00_0003)));
    }

    #[test]
    fn decode_backward_branch() {
        // 0: nop  1: br.s -3 (to 0)
        let bytes = [0x00, 0x2B, 0xFD];
        let code = decode_body(&bytes).unwrap();
        let target = code.get(1).unwrap().targets()[0];
        assert_eq!(code.label_position(target), Some(0));
    }

    #[test]
    fn decode_switch_shares_labels() {
        // 0: ldarg.0  1: switch(2) -> +1, +1   14: nop  15: ret
        let bytes = [
            0x02, 0x45, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x00, 0x2A,
        ];
        let code = decode_body(&bytes).unwrap();
        let targets = code.get(1).unwrap().targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], targets[1]);
        assert_eq!(code.label_position(targets[0]), Some(3));
    }

    #[test]
    fn branch_into_operand_is_malformed() {
        // br.s +0 lands on the ret, br.s -1 lands inside the branch itself
        assert!(decode_body(&[0x2B, 0x00, 0x2A]).is_ok());
        assert!(matches!(
            decode_body(&[0x2B, 0xFF, 0x2A]),
            Err(Error::Malformed { .. })
        ));
        // branch past the end
        assert!(matches!(
            decode_body(&[0x2B, 0x00]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn invalid_and_truncated() {
        assert!(matches!(
            decode_body(&[0xFF]),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            decode_body(&[0x20, 0x01]),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            decode_body(&[0x45, 0xFF, 0xFF, 0xFF, 0x0F]),
            Err(Error::OutOfBounds { .. })
        ));
    }
}
