//! Shared helpers for unit tests.

use std::collections::BTreeMap;

use crate::{
    assembly::{by_mnemonic, Immediate, Instruction, InstructionSequence, Label, Operand, OperandType},
    metadata::{
        method::{MethodAttributes, MethodBody, MethodDefinition},
        token::Token,
        typesystem::TypeDescriptor,
    },
};

/// Build a sequence from `"mnemonic operand"` lines.
///
/// Branch operands are target instruction indices, `switch` takes a comma separated
/// list of them, tokens are written in hex (`0x0A000001`) and everything else in
/// decimal. Labels are created in order of first reference.
pub(crate) fn body(lines: &[&str]) -> InstructionSequence {
    let mut code = InstructionSequence::new();
    let mut labels: BTreeMap<usize, Label> = BTreeMap::new();
    let mut label_for = |code: &mut InstructionSequence, target: usize| {
        *labels.entry(target).or_insert_with(|| code.new_label())
    };

    let mut parsed = Vec::new();
    for line in lines {
        let (mnemonic, operand) = match line.split_once(' ') {
            Some((mnemonic, operand)) => (mnemonic, operand.trim()),
            None => (*line, ""),
        };
        let info = by_mnemonic(mnemonic).unwrap_or_else(|| panic!("unknown mnemonic {mnemonic}"));

        let operand = match info.op_type {
            OperandType::None => Operand::None,
            OperandType::Int8 => Operand::Immediate(Immediate::Int8(operand.parse().unwrap())),
            OperandType::Int32 => Operand::Immediate(Immediate::Int32(operand.parse().unwrap())),
            OperandType::Int64 => Operand::Immediate(Immediate::Int64(operand.parse().unwrap())),
            OperandType::Float32 => Operand::Immediate(Immediate::Float32(operand.parse().unwrap())),
            OperandType::Float64 => Operand::Immediate(Immediate::Float64(operand.parse().unwrap())),
            OperandType::Token => {
                let hex = operand.trim_start_matches("0x");
                Operand::Token(Token::new(u32::from_str_radix(hex, 16).unwrap()))
            }
            OperandType::ShortLocal | OperandType::Local => Operand::Local(operand.parse().unwrap()),
            OperandType::ShortArgument | OperandType::Argument => {
                Operand::Argument(operand.parse().unwrap())
            }
            OperandType::ShortBranch | OperandType::Branch => {
                Operand::Target(label_for(&mut code, operand.parse().unwrap()))
            }
            OperandType::Switch => Operand::Switch(
                operand
                    .split(',')
                    .map(|target| label_for(&mut code, target.trim().parse().unwrap()))
                    .collect(),
            ),
        };
        parsed.push(Instruction::new(mnemonic, operand).unwrap());
    }

    for instruction in parsed {
        code.push(instruction);
    }
    for (target, label) in labels {
        code.mark_label(label, target).unwrap();
    }
    code
}

/// Build a public method with a body from [`body`] lines.
///
/// Types are written as ILAsm names (`int32`, `Game.Player`, `int32[]`). The token is
/// left null for [`crate::metadata::image::AssemblyImage::add_method`] to assign.
pub(crate) fn method(
    name: &str,
    is_static: bool,
    params: &[&str],
    returns: Option<&str>,
    locals: &[&str],
    lines: &[&str],
) -> MethodDefinition {
    let parse = |ty: &&str| ty.parse::<TypeDescriptor>().unwrap();
    let mut flags = MethodAttributes::PUBLIC;
    if is_static {
        flags |= MethodAttributes::STATIC;
    }
    MethodDefinition {
        token: Token::new(0),
        name: name.to_string(),
        flags,
        params: params.iter().map(parse).collect(),
        returns: returns.map(|ty| parse(&ty)),
        body: Some(MethodBody::new(8, locals.iter().map(parse).collect(), body(lines))),
    }
}

#[test]
fn body_places_labels() {
    let code = body(&["ldarg.0", "brtrue.s 3", "ldc.i4.0", "ret", "switch 0,3"]);
    assert_eq!(code.len(), 5);
    assert_eq!(code.label_count(), 2);
    assert_eq!(code.label_position(Label(0)), Some(3));
    assert_eq!(code.label_position(Label(1)), Some(0));
}
