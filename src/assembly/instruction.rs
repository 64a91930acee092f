//! Instruction model for editable method bodies.
//!
//! Instructions here are position independent: a branch names a [`Label`] instead of a
//! byte offset, and the owning [`crate::assembly::InstructionSequence`] maps labels to
//! instruction indices. This lets the patcher splice code anywhere in a body and leaves
//! byte offsets to the encoder.
//!
//! # Key Components
//!
//! - [`Instruction`] - One opcode with its operand
//! - [`Operand`] - Structured operand (immediate, label, token, local or argument index)
//! - [`OperandType`] - How an opcode's operand is laid out in the byte stream
//! - [`FlowType`] / [`StackBehavior`] - Control-flow and stack metadata used by the verifier
//!
//! # Examples
//!
//! ```rust
//! use cilsplice::assembly::{Instruction, Operand, Immediate};
//!
//! let push = Instruction::ldc_i4(100)?;
//! assert_eq!(push.mnemonic, "ldc.i4.s");
//! assert_eq!(push.operand, Operand::Immediate(Immediate::Int8(100)));
//!
//! let load = Instruction::ldarg(1)?;
//! assert_eq!(load.mnemonic, "ldarg.1");
//! # Ok::<(), cilsplice::Error>(())
//! ```

use std::fmt;

use crate::{
    assembly::instructions::{by_mnemonic, CilInstruction},
    metadata::token::Token,
    Error, Result,
};

/// How an opcode's operand is laid out in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    None,
    /// Signed 8-bit integer
    Int8,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Metadata token reference
    Token,
    /// 8-bit relative branch target
    ShortBranch,
    /// 32-bit relative branch target
    Branch,
    /// Switch table operand
    Switch,
    /// 8-bit local variable index
    ShortLocal,
    /// 16-bit local variable index
    Local,
    /// 8-bit argument index
    ShortArgument,
    /// 16-bit argument index
    Argument,
}

impl OperandType {
    /// Returns the encoded size in bytes of this operand type.
    ///
    /// Returns `None` for `Switch`, whose size depends on the number of cases.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8
            | OperandType::ShortBranch
            | OperandType::ShortLocal
            | OperandType::ShortArgument => Some(1),
            OperandType::Local | OperandType::Argument => Some(2),
            OperandType::Int32 | OperandType::Float32 | OperandType::Token | OperandType::Branch => {
                Some(4)
            }
            OperandType::Int64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// An immediate constant embedded in an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit immediate value
    Int8(i8),
    /// Signed 32-bit immediate value
    Int32(i32),
    /// Signed 64-bit immediate value
    Int64(i64),
    /// 32-bit floating point immediate value
    Float32(f32),
    /// 64-bit floating point immediate value
    Float64(f64),
}

/// A branch target, resolved to an instruction index by the owning sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand present
    None,
    /// Immediate value (constant embedded in instruction)
    Immediate(Immediate),
    /// Branch target
    Target(Label),
    /// Metadata token reference
    Token(Token),
    /// Local variable index
    Local(u16),
    /// Method argument index
    Argument(u16),
    /// Switch table, one target per case
    Switch(Vec<Label>),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Immediate(Immediate::Int8(v)) => write!(f, "{v}"),
            Operand::Immediate(Immediate::Int32(v)) => write!(f, "{v}"),
            Operand::Immediate(Immediate::Int64(v)) => write!(f, "{v}"),
            Operand::Immediate(Immediate::Float32(v)) => write!(f, "{v}"),
            Operand::Immediate(Immediate::Float64(v)) => write!(f, "{v}"),
            Operand::Target(label) => write!(f, "{label}"),
            Operand::Token(token) => write!(f, "{token}"),
            Operand::Local(index) => write!(f, "V_{index}"),
            Operand::Argument(index) => write!(f, "A_{index}"),
            Operand::Switch(labels) => {
                write!(f, "(")?;
                for (i, label) in labels.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{label}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location
    UnconditionalBranch,
    /// Call to another method, or object construction
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch
    Switch,
}

/// Fixed stack effect of an instruction.
///
/// Calls, `newobj` and `ret` depend on a signature and report zero here; the verifier
/// and interpreter resolve them through [`crate::metadata::image::TokenResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Number of items popped from stack
    pub pops: u8,
    /// Number of items pushed to stack
    pub pushes: u8,
}

/// One CIL instruction inside an [`crate::assembly::InstructionSequence`].
#[derive(Clone, PartialEq)]
pub struct Instruction {
    /// Primary opcode byte
    pub opcode: u8,
    /// Prefix byte (0 if no prefix)
    pub prefix: u8,
    /// Instruction mnemonic (e.g. "add", "ldloc.s", "ret")
    pub mnemonic: &'static str,
    /// How this instruction affects control flow
    pub flow_type: FlowType,
    /// The operand data for this instruction
    pub operand: Operand,
}

impl Instruction {
    /// Build an instruction from a mnemonic and operand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMnemonic`] for an unsupported mnemonic,
    /// [`Error::WrongOperandType`] if the operand does not fit the opcode, and
    /// [`Error::UnexpectedOperand`] if the opcode takes no operand.
    pub fn new(mnemonic: &str, operand: Operand) -> Result<Self> {
        let info =
            by_mnemonic(mnemonic).ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))?;
        check_operand(info, &operand)?;

        Ok(Instruction {
            opcode: info.opcode,
            prefix: info.prefix,
            mnemonic: info.instr,
            flow_type: info.flow,
            operand,
        })
    }

    /// Build an instruction that takes no operand.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn simple(mnemonic: &str) -> Result<Self> {
        Self::new(mnemonic, Operand::None)
    }

    /// Build an instruction with a token operand (`call`, `ldfld`, `newobj`, ...).
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn with_token(mnemonic: &str, token: Token) -> Result<Self> {
        Self::new(mnemonic, Operand::Token(token))
    }

    /// `call token`.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn call(token: Token) -> Result<Self> {
        Self::with_token("call", token)
    }

    /// A branch to `label`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBranch`] if `mnemonic` is not a branch.
    pub fn branch(mnemonic: &str, label: Label) -> Result<Self> {
        let info =
            by_mnemonic(mnemonic).ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))?;
        if !matches!(
            info.flow,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch
        ) {
            return Err(Error::InvalidBranch(format!(
                "instruction '{mnemonic}' is not a branch instruction"
            )));
        }
        Self::new(mnemonic, Operand::Target(label))
    }

    /// A `switch` over `labels`.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn switch(labels: Vec<Label>) -> Result<Self> {
        Self::new("switch", Operand::Switch(labels))
    }

    /// Push a 32-bit constant using the shortest encoding.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn ldc_i4(value: i32) -> Result<Self> {
        match value {
            -1 => Self::simple("ldc.i4.m1"),
            0 => Self::simple("ldc.i4.0"),
            1 => Self::simple("ldc.i4.1"),
            2 => Self::simple("ldc.i4.2"),
            3 => Self::simple("ldc.i4.3"),
            4 => Self::simple("ldc.i4.4"),
            5 => Self::simple("ldc.i4.5"),
            6 => Self::simple("ldc.i4.6"),
            7 => Self::simple("ldc.i4.7"),
            8 => Self::simple("ldc.i4.8"),
            _ => match i8::try_from(value) {
                Ok(short) => Self::new("ldc.i4.s", Operand::Immediate(Immediate::Int8(short))),
                Err(_) => Self::new("ldc.i4", Operand::Immediate(Immediate::Int32(value))),
            },
        }
    }

    /// Load argument `index`.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn ldarg(index: u16) -> Result<Self> {
        match index {
            0 => Self::simple("ldarg.0"),
            1 => Self::simple("ldarg.1"),
            2 => Self::simple("ldarg.2"),
            3 => Self::simple("ldarg.3"),
            0..=255 => Self::new("ldarg.s", Operand::Argument(index)),
            _ => Self::new("ldarg", Operand::Argument(index)),
        }
    }

    /// Load the address of argument `index`.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn ldarga(index: u16) -> Result<Self> {
        if index <= 255 {
            Self::new("ldarga.s", Operand::Argument(index))
        } else {
            Self::new("ldarga", Operand::Argument(index))
        }
    }

    /// Store into argument `index`.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn starg(index: u16) -> Result<Self> {
        if index <= 255 {
            Self::new("starg.s", Operand::Argument(index))
        } else {
            Self::new("starg", Operand::Argument(index))
        }
    }

    /// Load local `index`.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn ldloc(index: u16) -> Result<Self> {
        match index {
            0 => Self::simple("ldloc.0"),
            1 => Self::simple("ldloc.1"),
            2 => Self::simple("ldloc.2"),
            3 => Self::simple("ldloc.3"),
            0..=255 => Self::new("ldloc.s", Operand::Local(index)),
            _ => Self::new("ldloc", Operand::Local(index)),
        }
    }

    /// Load the address of local `index`.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn ldloca(index: u16) -> Result<Self> {
        if index <= 255 {
            Self::new("ldloca.s", Operand::Local(index))
        } else {
            Self::new("ldloca", Operand::Local(index))
        }
    }

    /// Store into local `index`.
    ///
    /// # Errors
    ///
    /// See [`Instruction::new`].
    pub fn stloc(index: u16) -> Result<Self> {
        match index {
            0 => Self::simple("stloc.0"),
            1 => Self::simple("stloc.1"),
            2 => Self::simple("stloc.2"),
            3 => Self::simple("stloc.3"),
            0..=255 => Self::new("stloc.s", Operand::Local(index)),
            _ => Self::new("stloc", Operand::Local(index)),
        }
    }

    /// Table metadata for this instruction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMnemonic`] if the instruction was built by hand with a
    /// mnemonic outside the supported set.
    pub fn info(&self) -> Result<&'static CilInstruction> {
        by_mnemonic(self.mnemonic).ok_or_else(|| Error::InvalidMnemonic(self.mnemonic.to_string()))
    }

    /// Fixed stack effect of this instruction, see [`StackBehavior`].
    ///
    /// # Errors
    ///
    /// See [`Instruction::info`].
    pub fn stack_behavior(&self) -> Result<StackBehavior> {
        let info = self.info()?;
        Ok(StackBehavior {
            pops: info.stack_pops,
            pushes: info.stack_pushes,
        })
    }

    /// Returns true for conditional and unconditional branches and `switch`.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Switch
        )
    }

    /// Returns true if execution never falls through to the next instruction.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::UnconditionalBranch | FlowType::Return
        )
    }

    /// Labels this instruction can transfer control to.
    #[must_use]
    pub fn targets(&self) -> Vec<Label> {
        match &self.operand {
            Operand::Target(label) => vec![*label],
            Operand::Switch(labels) => labels.clone(),
            _ => Vec::new(),
        }
    }

    /// The token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Local index read by `ldloc*`.
    #[must_use]
    pub fn loaded_local(&self) -> Option<u16> {
        match self.mnemonic {
            "ldloc.s" | "ldloc" => self.local_operand(),
            short => short.strip_prefix("ldloc.").and_then(macro_index),
        }
    }

    /// Local index written by `stloc*`.
    #[must_use]
    pub fn stored_local(&self) -> Option<u16> {
        match self.mnemonic {
            "stloc.s" | "stloc" => self.local_operand(),
            short => short.strip_prefix("stloc.").and_then(macro_index),
        }
    }

    /// Argument index read by `ldarg*`.
    #[must_use]
    pub fn loaded_argument(&self) -> Option<u16> {
        match (self.mnemonic, &self.operand) {
            ("ldarg.s" | "ldarg", Operand::Argument(index)) => Some(*index),
            (short, _) => short.strip_prefix("ldarg.").and_then(macro_index),
        }
    }

    /// The constant pushed by an `ldc.i4*` or `ldc.i8` instruction.
    #[must_use]
    pub fn constant(&self) -> Option<i64> {
        match (self.mnemonic, &self.operand) {
            ("ldc.i4.m1", _) => Some(-1),
            ("ldc.i4.s", Operand::Immediate(Immediate::Int8(v))) => Some(i64::from(*v)),
            ("ldc.i4", Operand::Immediate(Immediate::Int32(v))) => Some(i64::from(*v)),
            ("ldc.i8", Operand::Immediate(Immediate::Int64(v))) => Some(*v),
            (short, _) => short
                .strip_prefix("ldc.i4.")
                .and_then(|digit| digit.parse::<u8>().ok())
                .map(i64::from),
        }
    }

    fn local_operand(&self) -> Option<u16> {
        match self.operand {
            Operand::Local(index) => Some(index),
            _ => None,
        }
    }
}

/// Index encoded in a macro form such as `ldloc.2`.
fn macro_index(suffix: &str) -> Option<u16> {
    suffix.parse().ok().filter(|index| *index <= 3)
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operand == Operand::None {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operand)
        }
    }
}

/// Validate `operand` against the operand type of `info`.
pub(crate) fn check_operand(info: &CilInstruction, operand: &Operand) -> Result<()> {
    let fits = match (info.op_type, operand) {
        (OperandType::None, Operand::None) => true,
        (OperandType::None, _) => return Err(Error::UnexpectedOperand),
        (OperandType::Int8, Operand::Immediate(Immediate::Int8(_)))
        | (OperandType::Int32, Operand::Immediate(Immediate::Int32(_)))
        | (OperandType::Int64, Operand::Immediate(Immediate::Int64(_)))
        | (OperandType::Float32, Operand::Immediate(Immediate::Float32(_)))
        | (OperandType::Float64, Operand::Immediate(Immediate::Float64(_)))
        | (OperandType::Token, Operand::Token(_))
        | (OperandType::ShortBranch | OperandType::Branch, Operand::Target(_))
        | (OperandType::Switch, Operand::Switch(_))
        | (OperandType::Local, Operand::Local(_))
        | (OperandType::Argument, Operand::Argument(_)) => true,
        (OperandType::ShortLocal, Operand::Local(index))
        | (OperandType::ShortArgument, Operand::Argument(index)) => *index <= 255,
        _ => false,
    };

    if fits {
        Ok(())
    } else {
        Err(Error::WrongOperandType {
            expected: format!("{:?} for '{}'", info.op_type, info.instr),
        })
    }
}
