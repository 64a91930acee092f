//! What a patch does once its pattern has matched.
//!
//! Actions come in two forms. A [`PatchAction`] is what patch authors write: it can
//! refer to callbacks by signature through [`CallbackRef`], since the member reference
//! rows of the target image are not known in advance. Binding it to an image with
//! [`PatchAction::bind`] adds (or reuses) those member references and yields a
//! [`BoundAction`] that only contains concrete instructions.

use std::fmt::Write;

use crate::{
    assembly::Instruction,
    metadata::{image::AssemblyImage, token::Token, typesystem::TypeDescriptor},
    Result,
};

/// A static callback method, identified by signature.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackRef {
    /// Full name of the declaring type
    pub type_name: String,
    /// Method name
    pub name: String,
    /// Parameter types
    pub params: Vec<TypeDescriptor>,
    /// Return type, `None` for `void`
    pub returns: Option<TypeDescriptor>,
}

impl CallbackRef {
    /// A `void` callback without parameters.
    #[must_use]
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        CallbackRef {
            type_name: type_name.into(),
            name: name.into(),
            params: Vec::new(),
            returns: None,
        }
    }

    /// Set the parameter types.
    #[must_use]
    pub fn params(mut self, params: Vec<TypeDescriptor>) -> Self {
        self.params = params;
        self
    }

    /// Set the return type.
    #[must_use]
    pub fn returns(mut self, returns: TypeDescriptor) -> Self {
        self.returns = Some(returns);
        self
    }

    /// `Type::Name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.type_name, self.name)
    }

    /// Reference this callback from `image`, reusing an identical reference.
    pub fn bind(&self, image: &mut AssemblyImage) -> Token {
        image.add_member_ref(
            &self.type_name,
            &self.name,
            false,
            self.params.clone(),
            self.returns.clone(),
        )
    }

    fn description(&self) -> String {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        let returns = self
            .returns
            .as_ref()
            .map_or_else(|| "void".to_string(), ToString::to_string);
        format!("{} {}({})", returns, self.full_name(), params.join(", "))
    }
}

/// One element of an instruction list inside a [`PatchAction`].
#[derive(Debug, Clone, PartialEq)]
pub enum Emit {
    /// A concrete instruction
    Instruction(Instruction),
    /// `call` to a callback, resolved at bind time
    Call(CallbackRef),
}

impl From<Instruction> for Emit {
    fn from(instruction: Instruction) -> Self {
        Emit::Instruction(instruction)
    }
}

impl From<CallbackRef> for Emit {
    fn from(callback: CallbackRef) -> Self {
        Emit::Call(callback)
    }
}

/// The edit a patch performs on a matched region.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchAction {
    /// Insert before the first matched instruction. Branches into the match run the
    /// inserted code first.
    InsertBefore(Vec<Emit>),
    /// Insert directly after the last matched instruction.
    InsertAfter(Vec<Emit>),
    /// Retarget the branch matched by `step` (or its switch entry `case`) to `block`,
    /// which is appended to the body. With `resume_original` the block ends with a
    /// `br` to the old target.
    RedirectBranch {
        /// Pattern step whose instruction is the branch
        step: usize,
        /// Switch entry to retarget, `None` for plain branches
        case: Option<usize>,
        /// Code of the new branch target
        block: Vec<Emit>,
        /// Whether to continue at the old target after the block
        resume_original: bool,
    },
    /// Replace the whole matched region by a call to `callback`, which must consume the
    /// region's stack inputs and produce its outputs.
    WrapWithDelegate {
        /// The replacement
        callback: CallbackRef,
    },
}

impl PatchAction {
    /// Resolve every callback against `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if a `call` instruction cannot be built for a bound token.
    pub fn bind(&self, image: &mut AssemblyImage) -> Result<BoundAction> {
        Ok(match self {
            PatchAction::InsertBefore(emits) => BoundAction::InsertBefore(bind_all(emits, image)?),
            PatchAction::InsertAfter(emits) => BoundAction::InsertAfter(bind_all(emits, image)?),
            PatchAction::RedirectBranch {
                step,
                case,
                block,
                resume_original,
            } => BoundAction::RedirectBranch {
                step: *step,
                case: *case,
                block: bind_all(block, image)?,
                resume_original: *resume_original,
            },
            PatchAction::WrapWithDelegate { callback } => BoundAction::WrapWithDelegate {
                callback: callback.bind(image),
            },
        })
    }

    /// Canonical description, part of the patch identity.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            PatchAction::InsertBefore(emits) => format!("insert-before [{}]", describe(emits)),
            PatchAction::InsertAfter(emits) => format!("insert-after [{}]", describe(emits)),
            PatchAction::RedirectBranch {
                step,
                case,
                block,
                resume_original,
            } => {
                let mut out = format!("redirect step={step}");
                if let Some(case) = case {
                    let _ = write!(out, " case={case}");
                }
                let _ = write!(out, " resume={resume_original} [{}]", describe(block));
                out
            }
            PatchAction::WrapWithDelegate { callback } => {
                format!("wrap {}", callback.description())
            }
        }
    }
}

fn bind_all(emits: &[Emit], image: &mut AssemblyImage) -> Result<Vec<Instruction>> {
    emits
        .iter()
        .map(|emit| match emit {
            Emit::Instruction(instruction) => Ok(instruction.clone()),
            Emit::Call(callback) => Instruction::call(callback.bind(image)),
        })
        .collect()
}

fn describe(emits: &[Emit]) -> String {
    let parts: Vec<String> = emits
        .iter()
        .map(|emit| match emit {
            Emit::Instruction(instruction) => instruction.to_string(),
            Emit::Call(callback) => format!("call {}", callback.description()),
        })
        .collect();
    parts.join("; ")
}

/// A [`PatchAction`] with every callback resolved to a token of one image.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundAction {
    /// See [`PatchAction::InsertBefore`]
    InsertBefore(Vec<Instruction>),
    /// See [`PatchAction::InsertAfter`]
    InsertAfter(Vec<Instruction>),
    /// See [`PatchAction::RedirectBranch`]
    RedirectBranch {
        /// Pattern step whose instruction is the branch
        step: usize,
        /// Switch entry to retarget
        case: Option<usize>,
        /// Code of the new branch target
        block: Vec<Instruction>,
        /// Whether to continue at the old target after the block
        resume_original: bool,
    },
    /// See [`PatchAction::WrapWithDelegate`]
    WrapWithDelegate {
        /// `MethodDef` or `MemberRef` token of the callback
        callback: Token,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use uguid::guid;

    #[test]
    fn bind_reuses_member_refs() {
        let mut image = AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-0000000000bb"));
        let hook = CallbackRef::new("Hooks", "OnTick");
        let action = PatchAction::InsertBefore(vec![
            hook.clone().into(),
            Instruction::simple("nop").unwrap().into(),
            hook.into(),
        ]);

        let BoundAction::InsertBefore(instructions) = action.bind(&mut image).unwrap() else {
            panic!("unexpected variant");
        };
        assert_eq!(image.member_refs().len(), 1);
        assert_eq!(instructions[0], instructions[2]);
        assert_eq!(instructions[0].token(), Some(image.member_refs()[0].token));
    }

    #[test]
    fn descriptions_are_canonical() {
        let action = PatchAction::RedirectBranch {
            step: 0,
            case: Some(2),
            block: vec![
                CallbackRef::new("Hooks", "Pick")
                    .params(vec![TypeDescriptor::int32()])
                    .returns(TypeDescriptor::int32())
                    .into(),
                Instruction::simple("ret").unwrap().into(),
            ],
            resume_original: false,
        };
        assert_eq!(
            action.description(),
            "redirect step=0 case=2 resume=false [call int32 Hooks::Pick(int32); ret]"
        );
    }
}
