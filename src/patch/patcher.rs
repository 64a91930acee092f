//! Applying one pattern-and-action pair to one method.

use log::{debug, warn};

use crate::{
    assembly::Instruction,
    metadata::{image::TokenResolver, method::MethodDefinition},
    patch::{
        action::BoundAction,
        cursor::Cursor,
        pattern::{Pattern, PatternMatch},
        verify::verify_method,
    },
    Error, Result,
};

/// Outcome of [`apply_patch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchResult {
    /// The pattern matched and the edit was applied and verified.
    Applied {
        /// Index of the first matched instruction, before the edit
        position: usize,
    },
    /// The pattern did not match; the body is untouched.
    NotFound,
    /// The pattern matched but the action cannot be carried out there, for example a
    /// redirect step that is not a branch or a wrapped region other code branches into.
    /// The body is untouched.
    NotApplicable(String),
}

/// Find `pattern` in `method` and apply `action` at the first match.
///
/// After the edit the body is verified with [`verify_method`] and its `max_stack` is
/// raised to the verified depth if needed. If the edit cannot be made or verification
/// fails, the body is restored to exactly its previous state.
///
/// # Errors
///
/// Returns [`Error::InvalidInstructionStream`] if the edited body fails verification.
///
/// # Examples
///
/// ```rust
/// use cilsplice::{
///     assembly::{Instruction, InstructionSequence},
///     metadata::{image::AssemblyImage, method::{MethodAttributes, MethodBody, MethodDefinition}, token::Token},
///     patch::{apply_patch, BoundAction, LocalMatcher, Pattern, PatchResult},
/// };
/// use uguid::guid;
///
/// let image = AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-000000000001"));
/// let code = InstructionSequence::from_instructions(vec![
///     Instruction::ldc_i4(5)?,
///     Instruction::stloc(0)?,
///     Instruction::simple("ret")?,
/// ]);
/// let mut method = MethodDefinition {
///     token: Token::new(0x0600_0001),
///     name: "Run".to_string(),
///     flags: MethodAttributes::STATIC,
///     params: vec![],
///     returns: None,
///     body: Some(MethodBody::new(1, vec!["int32".parse()?], code)),
/// };
///
/// let pattern = Pattern::new().then(LocalMatcher::store().index(0));
/// let action = BoundAction::InsertAfter(vec![Instruction::simple("nop")?]);
/// let result = apply_patch(&mut method, &pattern, &action, &image)?;
/// assert_eq!(result, PatchResult::Applied { position: 1 });
/// # Ok::<(), cilsplice::Error>(())
/// ```
pub fn apply_patch(
    method: &mut MethodDefinition,
    pattern: &Pattern,
    action: &BoundAction,
    resolver: &dyn TokenResolver,
) -> Result<PatchResult> {
    let found = method
        .body
        .as_ref()
        .and_then(|body| pattern.find(&body.code, 0, resolver));
    let Some(found) = found else {
        warn!(
            "Pattern [{}] not found in {}, leaving it unchanged",
            pattern.description(),
            method.name
        );
        return Ok(PatchResult::NotFound);
    };

    let snapshot = method.body.clone();
    let edited = match method.body.as_mut() {
        Some(body) => edit(&mut Cursor::new(&mut body.code), &found, action),
        None => Ok(()),
    };
    if let Err(error) = edited {
        method.body = snapshot;
        warn!(
            "Cannot {} at {} in {}: {}",
            action_name(action),
            found.start(),
            method.name,
            error
        );
        return Ok(PatchResult::NotApplicable(error.to_string()));
    }

    match verify_method(method, resolver) {
        Ok(depth) => {
            if let Some(body) = method.body.as_mut() {
                body.max_stack = body.max_stack.max(depth);
            }
            debug!(
                "Patched {} at {} ({})",
                method.name,
                found.start(),
                action_name(action)
            );
            Ok(PatchResult::Applied {
                position: found.start(),
            })
        }
        Err(error) => {
            method.body = snapshot;
            Err(error)
        }
    }
}

fn edit(cursor: &mut Cursor<'_>, found: &PatternMatch, action: &BoundAction) -> Result<()> {
    match action {
        BoundAction::InsertBefore(instructions) => {
            cursor.seek(found.start())?;
            cursor.insert_before(instructions.clone(), true)
        }
        BoundAction::InsertAfter(instructions) => {
            cursor.seek(found.end() - 1)?;
            cursor.insert_after(instructions.clone())
        }
        BoundAction::RedirectBranch {
            step,
            case,
            block,
            resume_original,
        } => {
            let index = found.position(*step).ok_or_else(|| {
                Error::InvalidBranch(format!("pattern has no step {step} to redirect"))
            })?;

            let anchor = cursor.append_block(block.clone())?;
            let old = cursor.redirect(index, *case, anchor)?;
            if *resume_original {
                cursor.append(vec![Instruction::branch("br", old)?]);
            }
            Ok(())
        }
        BoundAction::WrapWithDelegate { callback } => {
            cursor.replace(found.start()..found.end(), vec![Instruction::call(*callback)?])?;
            Ok(())
        }
    }
}

fn action_name(action: &BoundAction) -> &'static str {
    match action {
        BoundAction::InsertBefore(_) => "insert-before",
        BoundAction::InsertAfter(_) => "insert-after",
        BoundAction::RedirectBranch { .. } => "redirect",
        BoundAction::WrapWithDelegate { .. } => "wrap",
    }
}
