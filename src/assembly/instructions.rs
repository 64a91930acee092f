//! Instruction metadata table for the supported CIL subset.
//!
//! Every supported opcode has one [`CilInstruction`] entry describing its mnemonic,
//! operand layout, control flow and fixed stack effect. The decoder looks entries up by
//! opcode and the instruction constructors by mnemonic; both lookups are built lazily
//! from the same [`INSTRUCTIONS`] table so they can never disagree.

use std::{collections::HashMap, sync::OnceLock};

use crate::assembly::instruction::{FlowType, OperandType};

/// First byte of every two-byte opcode.
pub const FE_PREFIX: u8 = 0xFE;

/// Static description of one opcode.
#[derive(Debug)]
pub struct CilInstruction {
    /// Mnemonic, as written in ILAsm
    pub instr: &'static str,
    /// Prefix byte, `0xFE` for two-byte opcodes and 0 otherwise
    pub prefix: u8,
    /// Opcode byte
    pub opcode: u8,
    /// Operand layout
    pub op_type: OperandType,
    /// Control-flow behavior
    pub flow: FlowType,
    /// Values popped, excluding signature-dependent pops
    pub stack_pops: u8,
    /// Values pushed, excluding signature-dependent pushes
    pub stack_pushes: u8,
}

const fn op(
    instr: &'static str,
    opcode: u8,
    op_type: OperandType,
    flow: FlowType,
    stack_pops: u8,
    stack_pushes: u8,
) -> CilInstruction {
    CilInstruction {
        instr,
        prefix: 0,
        opcode,
        op_type,
        flow,
        stack_pops,
        stack_pushes,
    }
}

const fn fe(
    instr: &'static str,
    opcode: u8,
    op_type: OperandType,
    stack_pops: u8,
    stack_pushes: u8,
) -> CilInstruction {
    CilInstruction {
        instr,
        prefix: FE_PREFIX,
        opcode,
        op_type,
        flow: FlowType::Sequential,
        stack_pops,
        stack_pushes,
    }
}

use FlowType::{Call, ConditionalBranch as Cond, Return, Sequential as Seq, UnconditionalBranch};
use OperandType as O;

/// All supported instructions.
pub static INSTRUCTIONS: &[CilInstruction] = &[
    op("nop", 0x00, O::None, Seq, 0, 0),
    op("ldarg.0", 0x02, O::None, Seq, 0, 1),
    op("ldarg.1", 0x03, O::None, Seq, 0, 1),
    op("ldarg.2", 0x04, O::None, Seq, 0, 1),
    op("ldarg.3", 0x05, O::None, Seq, 0, 1),
    op("ldloc.0", 0x06, O::None, Seq, 0, 1),
    op("ldloc.1", 0x07, O::None, Seq, 0, 1),
    op("ldloc.2", 0x08, O::None, Seq, 0, 1),
    op("ldloc.3", 0x09, O::None, Seq, 0, 1),
    op("stloc.0", 0x0A, O::None, Seq, 1, 0),
    op("stloc.1", 0x0B, O::None, Seq, 1, 0),
    op("stloc.2", 0x0C, O::None, Seq, 1, 0),
    op("stloc.3", 0x0D, O::None, Seq, 1, 0),
    op("ldarg.s", 0x0E, O::ShortArgument, Seq, 0, 1),
    op("ldarga.s", 0x0F, O::ShortArgument, Seq, 0, 1),
    op("starg.s", 0x10, O::ShortArgument, Seq, 1, 0),
    op("ldloc.s", 0x11, O::ShortLocal, Seq, 0, 1),
    op("ldloca.s", 0x12, O::ShortLocal, Seq, 0, 1),
    op("stloc.s", 0x13, O::ShortLocal, Seq, 1, 0),
    op("ldnull", 0x14, O::None, Seq, 0, 1),
    op("ldc.i4.m1", 0x15, O::None, Seq, 0, 1),
    op("ldc.i4.0", 0x16, O::None, Seq, 0, 1),
    op("ldc.i4.1", 0x17, O::None, Seq, 0, 1),
    op("ldc.i4.2", 0x18, O::None, Seq, 0, 1),
    op("ldc.i4.3", 0x19, O::None, Seq, 0, 1),
    op("ldc.i4.4", 0x1A, O::None, Seq, 0, 1),
    op("ldc.i4.5", 0x1B, O::None, Seq, 0, 1),
    op("ldc.i4.6", 0x1C, O::None, Seq, 0, 1),
    op("ldc.i4.7", 0x1D, O::None, Seq, 0, 1),
    op("ldc.i4.8", 0x1E, O::None, Seq, 0, 1),
    op("ldc.i4.s", 0x1F, O::Int8, Seq, 0, 1),
    op("ldc.i4", 0x20, O::Int32, Seq, 0, 1),
    op("ldc.i8", 0x21, O::Int64, Seq, 0, 1),
    op("ldc.r4", 0x22, O::Float32, Seq, 0, 1),
    op("ldc.r8", 0x23, O::Float64, Seq, 0, 1),
    op("dup", 0x25, O::None, Seq, 1, 2),
    op("pop", 0x26, O::None, Seq, 1, 0),
    op("call", 0x28, O::Token, Call, 0, 0),
    op("ret", 0x2A, O::None, Return, 0, 0),
    op("br.s", 0x2B, O::ShortBranch, UnconditionalBranch, 0, 0),
    op("brfalse.s", 0x2C, O::ShortBranch, Cond, 1, 0),
    op("brtrue.s", 0x2D, O::ShortBranch, Cond, 1, 0),
    op("beq.s", 0x2E, O::ShortBranch, Cond, 2, 0),
    op("bge.s", 0x2F, O::ShortBranch, Cond, 2, 0),
    op("bgt.s", 0x30, O::ShortBranch, Cond, 2, 0),
    op("ble.s", 0x31, O::ShortBranch, Cond, 2, 0),
    op("blt.s", 0x32, O::ShortBranch, Cond, 2, 0),
    op("bne.un.s", 0x33, O::ShortBranch, Cond, 2, 0),
    op("bge.un.s", 0x34, O::ShortBranch, Cond, 2, 0),
    op("bgt.un.s", 0x35, O::ShortBranch, Cond, 2, 0),
    op("ble.un.s", 0x36, O::ShortBranch, Cond, 2, 0),
    op("blt.un.s", 0x37, O::ShortBranch, Cond, 2, 0),
    op("br", 0x38, O::Branch, UnconditionalBranch, 0, 0),
    op("brfalse", 0x39, O::Branch, Cond, 1, 0),
    op("brtrue", 0x3A, O::Branch, Cond, 1, 0),
    op("beq", 0x3B, O::Branch, Cond, 2, 0),
    op("bge", 0x3C, O::Branch, Cond, 2, 0),
    op("bgt", 0x3D, O::Branch, Cond, 2, 0),
    op("ble", 0x3E, O::Branch, Cond, 2, 0),
    op("blt", 0x3F, O::Branch, Cond, 2, 0),
    op("bne.un", 0x40, O::Branch, Cond, 2, 0),
    op("bge.un", 0x41, O::Branch, Cond, 2, 0),
    op("bgt.un", 0x42, O::Branch, Cond, 2, 0),
    op("ble.un", 0x43, O::Branch, Cond, 2, 0),
    op("blt.un", 0x44, O::Branch, Cond, 2, 0),
    op("switch", 0x45, O::Switch, FlowType::Switch, 1, 0),
    op("ldind.i1", 0x46, O::None, Seq, 1, 1),
    op("ldind.u1", 0x47, O::None, Seq, 1, 1),
    op("ldind.i2", 0x48, O::None, Seq, 1, 1),
    op("ldind.u2", 0x49, O::None, Seq, 1, 1),
    op("ldind.i4", 0x4A, O::None, Seq, 1, 1),
    op("ldind.u4", 0x4B, O::None, Seq, 1, 1),
    op("ldind.i8", 0x4C, O::None, Seq, 1, 1),
    op("ldind.r4", 0x4E, O::None, Seq, 1, 1),
    op("ldind.r8", 0x4F, O::None, Seq, 1, 1),
    op("ldind.ref", 0x50, O::None, Seq, 1, 1),
    op("stind.ref", 0x51, O::None, Seq, 2, 0),
    op("stind.i1", 0x52, O::None, Seq, 2, 0),
    op("stind.i2", 0x53, O::None, Seq, 2, 0),
    op("stind.i4", 0x54, O::None, Seq, 2, 0),
    op("stind.i8", 0x55, O::None, Seq, 2, 0),
    op("stind.r4", 0x56, O::None, Seq, 2, 0),
    op("stind.r8", 0x57, O::None, Seq, 2, 0),
    op("add", 0x58, O::None, Seq, 2, 1),
    op("sub", 0x59, O::None, Seq, 2, 1),
    op("mul", 0x5A, O::None, Seq, 2, 1),
    op("div", 0x5B, O::None, Seq, 2, 1),
    op("rem", 0x5D, O::None, Seq, 2, 1),
    op("and", 0x5F, O::None, Seq, 2, 1),
    op("or", 0x60, O::None, Seq, 2, 1),
    op("xor", 0x61, O::None, Seq, 2, 1),
    op("shl", 0x62, O::None, Seq, 2, 1),
    op("shr", 0x63, O::None, Seq, 2, 1),
    op("neg", 0x65, O::None, Seq, 1, 1),
    op("not", 0x66, O::None, Seq, 1, 1),
    op("conv.i1", 0x67, O::None, Seq, 1, 1),
    op("conv.i2", 0x68, O::None, Seq, 1, 1),
    op("conv.i4", 0x69, O::None, Seq, 1, 1),
    op("conv.i8", 0x6A, O::None, Seq, 1, 1),
    op("conv.r4", 0x6B, O::None, Seq, 1, 1),
    op("conv.r8", 0x6C, O::None, Seq, 1, 1),
    op("conv.u4", 0x6D, O::None, Seq, 1, 1),
    op("conv.u8", 0x6E, O::None, Seq, 1, 1),
    op("callvirt", 0x6F, O::Token, Call, 0, 0),
    op("newobj", 0x73, O::Token, Call, 0, 0),
    op("ldfld", 0x7B, O::Token, Seq, 1, 1),
    op("ldflda", 0x7C, O::Token, Seq, 1, 1),
    op("stfld", 0x7D, O::Token, Seq, 2, 0),
    op("ldsfld", 0x7E, O::Token, Seq, 0, 1),
    op("ldsflda", 0x7F, O::Token, Seq, 0, 1),
    op("stsfld", 0x80, O::Token, Seq, 1, 0),
    op("conv.u2", 0xD1, O::None, Seq, 1, 1),
    op("conv.u1", 0xD2, O::None, Seq, 1, 1),
    fe("ceq", 0x01, O::None, 2, 1),
    fe("cgt", 0x02, O::None, 2, 1),
    fe("cgt.un", 0x03, O::None, 2, 1),
    fe("clt", 0x04, O::None, 2, 1),
    fe("clt.un", 0x05, O::None, 2, 1),
    fe("ldarg", 0x09, O::Argument, 0, 1),
    fe("ldarga", 0x0A, O::Argument, 0, 1),
    fe("starg", 0x0B, O::Argument, 1, 0),
    fe("ldloc", 0x0C, O::Local, 0, 1),
    fe("ldloca", 0x0D, O::Local, 0, 1),
    fe("stloc", 0x0E, O::Local, 1, 0),
];

static MNEMONIC_LOOKUP: OnceLock<HashMap<&'static str, &'static CilInstruction>> =
    OnceLock::new();
static OPCODE_LOOKUP: OnceLock<HashMap<(u8, u8), &'static CilInstruction>> = OnceLock::new();

/// Find an instruction by mnemonic.
#[must_use]
pub fn by_mnemonic(mnemonic: &str) -> Option<&'static CilInstruction> {
    MNEMONIC_LOOKUP
        .get_or_init(|| INSTRUCTIONS.iter().map(|i| (i.instr, i)).collect())
        .get(mnemonic)
        .copied()
}

/// Find an instruction by prefix and opcode byte.
#[must_use]
pub fn by_opcode(prefix: u8, opcode: u8) -> Option<&'static CilInstruction> {
    OPCODE_LOOKUP
        .get_or_init(|| {
            INSTRUCTIONS
                .iter()
                .map(|i| ((i.prefix, i.opcode), i))
                .collect()
        })
        .get(&(prefix, opcode))
        .copied()
}

/// Long-form equivalent of a short branch.
#[must_use]
pub fn long_form(mnemonic: &str) -> Option<&'static str> {
    match mnemonic {
        "br.s" => Some("br"),
        "brfalse.s" => Some("brfalse"),
        "brtrue.s" => Some("brtrue"),
        "beq.s" => Some("beq"),
        "bne.un.s" => Some("bne.un"),
        "bge.s" => Some("bge"),
        "bge.un.s" => Some("bge.un"),
        "bgt.s" => Some("bgt"),
        "bgt.un.s" => Some("bgt.un"),
        "ble.s" => Some("ble"),
        "ble.un.s" => Some("ble.un"),
        "blt.s" => Some("blt"),
        "blt.un.s" => Some("blt.un"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_is_consistent() {
        let mut mnemonics = HashSet::new();
        let mut opcodes = HashSet::new();
        for instr in INSTRUCTIONS {
            assert!(mnemonics.insert(instr.instr), "duplicate {}", instr.instr);
            assert!(
                opcodes.insert((instr.prefix, instr.opcode)),
                "duplicate opcode for {}",
                instr.instr
            );
            assert!(std::ptr::eq(
                by_opcode(instr.prefix, instr.opcode).unwrap(),
                instr
            ));
        }
    }

    #[test]
    fn long_forms_exist() {
        for instr in INSTRUCTIONS
            .iter()
            .filter(|i| i.op_type == OperandType::ShortBranch)
        {
            let long = long_form(instr.instr).unwrap();
            assert_eq!(by_mnemonic(long).unwrap().op_type, OperandType::Branch);
            assert_eq!(by_mnemonic(long).unwrap().flow, instr.flow);
        }
    }

    #[test]
    fn unknown_lookups() {
        assert!(by_mnemonic("throw").is_none());
        assert!(by_opcode(0, 0xFF).is_none());
        assert!(by_opcode(FE_PREFIX, 0x01).is_some());
    }
}
