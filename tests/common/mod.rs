//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;

use cilsplice::{
    assembly::{by_mnemonic, Immediate, Instruction, InstructionSequence, Label, Operand, OperandType},
    metadata::{
        image::{AssemblyImage, TypeAttributes},
        method::{MethodAttributes, MethodBody, MethodDefinition},
        token::Token,
        typesystem::TypeDescriptor,
    },
};
use uguid::guid;

pub const MODULE: &str = "Host";

/// `MethodDef` tokens of the host fixture.
pub const COMPUTE: u32 = 0x0600_0001;
pub const SCORE_ADD: u32 = 0x0600_0002;
pub const ROUND_FINISH: u32 = 0x0600_0003;

/// Assemble `"mnemonic operand"` lines; branch operands are instruction indices.
pub fn code(lines: &[&str]) -> InstructionSequence {
    let mut code = InstructionSequence::new();
    let mut labels: BTreeMap<usize, Label> = BTreeMap::new();

    for &line in lines {
        let (mnemonic, operand) = line.split_once(' ').unwrap_or((line, ""));
        let info = by_mnemonic(mnemonic).unwrap_or_else(|| panic!("unknown mnemonic {mnemonic}"));
        let mut label = |code: &mut InstructionSequence, target: &str| {
            let target: usize = target.trim().parse().unwrap();
            *labels.entry(target).or_insert_with(|| code.new_label())
        };

        let operand = match info.op_type {
            OperandType::None => Operand::None,
            OperandType::Int8 => Operand::Immediate(Immediate::Int8(operand.parse().unwrap())),
            OperandType::Int32 => Operand::Immediate(Immediate::Int32(operand.parse().unwrap())),
            OperandType::Int64 => Operand::Immediate(Immediate::Int64(operand.parse().unwrap())),
            OperandType::Float32 => Operand::Immediate(Immediate::Float32(operand.parse().unwrap())),
            OperandType::Float64 => Operand::Immediate(Immediate::Float64(operand.parse().unwrap())),
            OperandType::Token => Operand::Token(Token::new(
                u32::from_str_radix(operand.trim_start_matches("0x"), 16).unwrap(),
            )),
            OperandType::ShortLocal | OperandType::Local => Operand::Local(operand.parse().unwrap()),
            OperandType::ShortArgument | OperandType::Argument => {
                Operand::Argument(operand.parse().unwrap())
            }
            OperandType::ShortBranch | OperandType::Branch => {
                Operand::Target(label(&mut code, operand))
            }
            OperandType::Switch => Operand::Switch(
                operand
                    .split(',')
                    .map(|target| label(&mut code, target))
                    .collect(),
            ),
        };
        code.push(Instruction::new(mnemonic, operand).unwrap());
    }

    for (target, label) in labels {
        code.mark_label(label, target).unwrap();
    }
    code
}

/// A static method with a body.
pub fn static_method(
    name: &str,
    params: Vec<TypeDescriptor>,
    returns: Option<TypeDescriptor>,
    locals: Vec<TypeDescriptor>,
    lines: &[&str],
) -> MethodDefinition {
    MethodDefinition {
        token: Token::new(0),
        name: name.to_string(),
        flags: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
        params,
        returns,
        body: Some(MethodBody::new(8, locals, code(lines))),
    }
}

/// The host module the tests patch.
///
/// ```text
/// class Foo { }
/// class Bar { static int32 Compute() => 40 + 2; }
/// class Game.Score { static int32 Add(int32 points) => points + 10; }
/// class Game.Round {
///     static int32 Finish(int32 points) {
///         if (points < 0) points = 0;
///         int32 total = Game.Score.Add(points);
///         return total;
///     }
/// }
/// class Game.Player (sequential) { int32 hp; }
/// ```
pub fn host() -> AssemblyImage {
    let int32 = TypeDescriptor::int32;
    let mut image = AssemblyImage::new(MODULE, guid!("3f2a8c61-7d4e-4b9a-8e15-c0d2f4a6b8e1"));

    image.add_type("", "Foo", TypeAttributes::PUBLIC).unwrap();
    image.add_type("", "Bar", TypeAttributes::PUBLIC).unwrap();
    image.add_type("Game", "Score", TypeAttributes::PUBLIC).unwrap();
    image.add_type("Game", "Round", TypeAttributes::PUBLIC).unwrap();
    image
        .add_type(
            "Game",
            "Player",
            TypeAttributes::PUBLIC | TypeAttributes::SEQUENTIAL_LAYOUT,
        )
        .unwrap();

    image
        .add_method(
            "Bar",
            static_method("Compute", vec![], Some(int32()), vec![], &[
                "ldc.i4.s 40",
                "ldc.i4.2",
                "add",
                "ret",
            ]),
        )
        .unwrap();
    image
        .add_method(
            "Game.Score",
            static_method("Add", vec![int32()], Some(int32()), vec![], &[
                "ldarg.0",
                "ldc.i4.s 10",
                "add",
                "ret",
            ]),
        )
        .unwrap();
    image
        .add_method(
            "Game.Round",
            static_method("Finish", vec![int32()], Some(int32()), vec![int32()], &[
                "ldarg.0",      // 0
                "ldc.i4.0",     // 1
                "bge.s 5",      // 2
                "ldc.i4.0",     // 3
                "starg.s 0",    // 4
                "ldarg.0",      // 5
                "call 0x06000002",
                "stloc.0",      // 7
                "ldloc.0",      // 8
                "ret",          // 9
            ]),
        )
        .unwrap();

    cilsplice::patch::inject_field(&mut image, "Game.Player", "hp", int32(), false, None).unwrap();
    image
}
