//! Structural verification of method bodies.
//!
//! [`verify_method`] runs a stack-depth dataflow over a body and reports the first
//! violation it finds:
//!
//! - a label used by a branch is unplaced or points past the last instruction
//! - a local or argument index is out of range
//! - a token operand does not resolve
//! - the stack underflows, or two paths reach an instruction with different depths
//! - `ret` is reached with anything other than exactly the return value on the stack
//! - execution can fall off the end of the body
//!
//! On success it returns the maximum stack depth, which the patcher uses to raise the
//! body's `max_stack`.

use crate::{
    assembly::{FlowType, Instruction, Operand},
    metadata::{image::TokenResolver, method::MethodDefinition},
    Error, Result,
};

/// Verify `method`'s body, returning its maximum stack depth.
///
/// Methods without a body verify trivially with depth 0.
///
/// # Errors
///
/// Returns [`Error::InvalidInstructionStream`] describing the first violation.
pub fn verify_method(method: &MethodDefinition, resolver: &dyn TokenResolver) -> Result<u16> {
    let Some(body) = &method.body else {
        return Ok(0);
    };
    let fail = |reason: String| Error::InvalidInstructionStream {
        method: method.name.clone(),
        reason,
    };

    let code = &body.code;
    if code.is_empty() {
        return Err(fail("body is empty".to_string()));
    }

    let arg_count = method.arg_count();
    let local_count = body.locals.len();
    let ret_depth = usize::from(method.returns.is_some());

    let mut depth_at: Vec<Option<usize>> = vec![None; code.len()];
    let mut worklist = vec![0_usize];
    depth_at[0] = Some(0);
    let mut max_depth = 0_usize;

    while let Some(index) = worklist.pop() {
        let instruction = &code.instructions()[index];
        let depth = depth_at[index].unwrap_or_default();

        check_slots(instruction, arg_count, local_count).map_err(|reason| fail(format!("{reason} at {index}")))?;

        let (pops, pushes) = stack_effect(instruction, resolver)
            .map_err(|reason| fail(format!("{reason} at {index}")))?;
        if depth < pops {
            return Err(fail(format!(
                "stack underflow at {index} ({instruction}): depth {depth}, needs {pops}"
            )));
        }

        if instruction.flow_type == FlowType::Return {
            if depth != ret_depth {
                return Err(fail(format!(
                    "ret at {index} with stack depth {depth}, expected {ret_depth}"
                )));
            }
            continue;
        }

        let after = depth - pops + pushes;
        max_depth = max_depth.max(after);

        let mut successors = Vec::new();
        for label in instruction.targets() {
            match code.label_position(label) {
                Some(target) if target < code.len() => successors.push(target),
                Some(target) => {
                    return Err(fail(format!("{label} at {index} points past the end ({target})")))
                }
                None => return Err(fail(format!("{label} at {index} is never placed"))),
            }
        }
        if !instruction.is_terminal() {
            if index + 1 >= code.len() {
                return Err(fail(format!("execution falls off the end after {index}")));
            }
            successors.push(index + 1);
        }

        for successor in successors {
            match depth_at[successor] {
                Some(existing) if existing != after => {
                    return Err(fail(format!(
                        "inconsistent stack depth at {successor}: {existing} vs {after} from {index}"
                    )))
                }
                Some(_) => {}
                None => {
                    depth_at[successor] = Some(after);
                    worklist.push(successor);
                }
            }
        }
    }

    u16::try_from(max_depth).map_err(|_| fail(format!("stack depth {max_depth} exceeds u16")))
}

/// Pops and pushes of `instruction`, resolving signature-dependent calls.
pub(crate) fn stack_effect(
    instruction: &Instruction,
    resolver: &dyn TokenResolver,
) -> std::result::Result<(usize, usize), String> {
    match instruction.mnemonic {
        "call" | "callvirt" | "newobj" => {
            let token = instruction
                .token()
                .ok_or_else(|| format!("{} without token", instruction.mnemonic))?;
            let signature = resolver
                .method_signature(token)
                .ok_or_else(|| format!("unresolved method token {token}"))?;

            if instruction.mnemonic == "newobj" {
                Ok((signature.params.len(), 1))
            } else {
                Ok((
                    signature.arg_count(),
                    usize::from(signature.returns.is_some()),
                ))
            }
        }
        "ldfld" | "ldflda" | "stfld" | "ldsfld" | "ldsflda" | "stsfld" => {
            let token = instruction
                .token()
                .ok_or_else(|| format!("{} without token", instruction.mnemonic))?;
            let field = resolver
                .field_signature(token)
                .ok_or_else(|| format!("unresolved field token {token}"))?;
            let wants_static = instruction.mnemonic.contains("sfld");
            if field.is_static != wants_static {
                return Err(format!(
                    "{} used on {} field {}.{}",
                    instruction.mnemonic,
                    if field.is_static { "static" } else { "instance" },
                    field.type_name,
                    field.name
                ));
            }
            behavior(instruction)
        }
        // the return value is checked against the method signature by the caller
        "ret" => Ok((0, 0)),
        _ => behavior(instruction),
    }
}

fn behavior(instruction: &Instruction) -> std::result::Result<(usize, usize), String> {
    let behavior = instruction.stack_behavior().map_err(|e| e.to_string())?;
    Ok((usize::from(behavior.pops), usize::from(behavior.pushes)))
}

fn check_slots(
    instruction: &Instruction,
    arg_count: usize,
    local_count: usize,
) -> std::result::Result<(), String> {
    let local = match instruction.operand {
        Operand::Local(index) => Some(index),
        _ => instruction.loaded_local().or(instruction.stored_local()),
    };
    if let Some(index) = local {
        if usize::from(index) >= local_count {
            return Err(format!("local {index} out of range ({local_count} locals)"));
        }
    }

    let argument = match instruction.operand {
        Operand::Argument(index) => Some(index),
        _ => instruction.loaded_argument(),
    };
    if let Some(index) = argument {
        if usize::from(index) >= arg_count {
            return Err(format!("argument {index} out of range ({arg_count} arguments)"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionSequence,
        metadata::{
            image::AssemblyImage,
            method::{MethodAttributes, MethodBody},
            token::Token,
            typesystem::TypeDescriptor,
        },
        test::body,
    };
    use uguid::guid;

    fn method(code: InstructionSequence, locals: usize, returns: bool) -> MethodDefinition {
        MethodDefinition {
            token: Token::new(0x0600_0001),
            name: "Run".to_string(),
            flags: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
            params: vec![TypeDescriptor::int32()],
            returns: returns.then(TypeDescriptor::int32),
            body: Some(MethodBody::new(8, vec![TypeDescriptor::int32(); locals], code)),
        }
    }

    fn image() -> AssemblyImage {
        AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-0000000000cc"))
    }

    fn reason(result: Result<u16>) -> String {
        match result {
            Err(Error::InvalidInstructionStream { reason, .. }) => reason,
            other => panic!("expected a verification failure, got {other:?}"),
        }
    }

    #[test]
    fn valid_body_reports_max_depth() {
        let code = body(&[
            "ldarg.0", "ldc.i4.2", "add", "stloc.0", "ldloc.0", "brtrue.s 8", "ldc.i4.0", "ret",
            "ldloc.0", "ret",
        ]);
        assert_eq!(verify_method(&method(code, 1, true), &image()).unwrap(), 2);
    }

    #[test]
    fn detects_underflow_and_bad_ret() {
        let code = body(&["add", "ret"]);
        assert!(reason(verify_method(&method(code, 0, true), &image())).contains("underflow"));

        let code = body(&["ldc.i4.1", "ret"]);
        assert!(reason(verify_method(&method(code, 0, false), &image())).contains("ret at 1"));
    }

    #[test]
    fn detects_inconsistent_merge() {
        // one path reaches index 4 with one value, the other with two
        let code = body(&["ldc.i4.1", "ldarg.0", "brtrue.s 4", "ldc.i4.2", "ret"]);
        assert!(reason(verify_method(&method(code, 0, true), &image())).contains("inconsistent"));
    }

    #[test]
    fn detects_fall_through_and_labels() {
        let code = body(&["ldc.i4.1", "pop"]);
        assert!(reason(verify_method(&method(code, 0, false), &image())).contains("falls off"));

        let mut code = body(&["ret"]);
        let label = code.new_label();
        code.insert(0, vec![Instruction::branch("br.s", label).unwrap()], false)
            .unwrap();
        assert!(reason(verify_method(&method(code, 0, false), &image())).contains("never placed"));
    }

    #[test]
    fn detects_slots_and_tokens() {
        let code = body(&["ldloc.1", "ret"]);
        assert!(reason(verify_method(&method(code, 1, true), &image())).contains("local 1"));

        let code = body(&["ldarg.1", "ret"]);
        assert!(reason(verify_method(&method(code, 0, true), &image())).contains("argument 1"));

        let code = body(&["call 0x0A000001", "ret"]);
        assert!(reason(verify_method(&method(code, 0, false), &image())).contains("unresolved"));
    }
}
