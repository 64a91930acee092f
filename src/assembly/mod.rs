//! CIL instruction model, decoding and encoding.
//!
//! Method bodies are decoded into an [`InstructionSequence`]: a list of [`Instruction`]s
//! whose branches name [`Label`]s rather than byte offsets. The patcher edits sequences
//! freely; the [`InstructionEncoder`] turns them back into bytecode, widening short
//! branches that no longer reach their target.
//!
//! # Key Components
//!
//! - [`decode_body`] / [`encode_body`] - Bytecode to sequence and back
//! - [`InstructionSequence`] - Instructions plus the label table
//! - [`Instruction`], [`Operand`], [`Label`] - Position independent instruction model
//!
//! # Examples
//!
//! ```rust
//! use cilsplice::assembly::{decode_body, encode_body, Instruction};
//!
//! let mut code = decode_body(&[0x02, 0x2A])?; // ldarg.0; ret
//! code.insert(1, vec![Instruction::simple("dup")?, Instruction::simple("pop")?], false)?;
//! assert_eq!(encode_body(&code)?, vec![0x02, 0x25, 0x26, 0x2A]);
//! # Ok::<(), cilsplice::Error>(())
//! ```

mod decoder;
mod encoder;
mod instruction;
mod instructions;
mod sequence;

pub use decoder::decode_body;
pub use encoder::{encode_body, InstructionEncoder};
pub use instruction::{FlowType, Immediate, Instruction, Label, Operand, OperandType, StackBehavior};
pub use instructions::{by_mnemonic, by_opcode, long_form, CilInstruction, FE_PREFIX, INSTRUCTIONS};
pub use sequence::InstructionSequence;
