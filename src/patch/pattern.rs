//! Instruction patterns and the matchers they are built from.
//!
//! A [`Pattern`] is an ordered list of steps. Each step pairs an [`InstructionMatcher`]
//! with a [`Gap`] that says where the step may match relative to the previous one:
//! directly after it, or anywhere further on. Searching is greedy and first-match-wins:
//! candidate start positions are tried from the beginning of the body, every
//! [`Gap::Eventually`] step takes the earliest instruction that satisfies it, and there
//! is no backtracking.
//!
//! # Available Matchers
//!
//! | Matcher | Description |
//! |---------|-------------|
//! | [`OpcodeMatcher`] | Match by mnemonic, optionally ignoring the short/long form |
//! | [`FlowMatcher`] | Match by control-flow class |
//! | [`LocalMatcher`] | Match loads or stores of a local slot |
//! | [`ArgumentMatcher`] | Match loads of an argument |
//! | [`ConstantMatcher`] | Match an integer constant |
//! | [`CallMatcher`] | Match calls by declaring type, name and/or return type |
//! | [`FieldAccessMatcher`] | Match field loads and stores by name |
//! | [`AnyMatcher`] | Match any instruction |
//! | [`PredicateMatcher`] | Match with a closure |
//!
//! # Examples
//!
//! ```rust
//! use cilsplice::patch::{CallMatcher, LocalMatcher, Pattern};
//!
//! // the first store into any local, followed later by a call to Game.Score::Add
//! let pattern = Pattern::new()
//!     .then(LocalMatcher::store())
//!     .eventually(CallMatcher::new().type_name("Game.Score").method_name("Add"));
//! assert_eq!(pattern.len(), 2);
//! assert_eq!(pattern.description(), "stloc(*) ... call(type=Game.Score, method=Add)");
//! ```

use std::{fmt, sync::Arc};

use crate::{
    assembly::{long_form, FlowType, Instruction, InstructionSequence},
    metadata::{image::TokenResolver, typesystem::TypeDescriptor},
};

/// Type alias for closure-based matchers.
pub type InstructionPredicate = dyn Fn(&Instruction, &dyn TokenResolver) -> bool + Send + Sync;

/// Decides whether a single instruction satisfies one step of a [`Pattern`].
///
/// Matchers see the instruction and a [`TokenResolver`] for the image the body belongs
/// to, so token operands can be compared by name instead of by row number.
///
/// # Implementing Custom Matchers
///
/// ```rust
/// use cilsplice::{assembly::Instruction, metadata::image::TokenResolver, patch::InstructionMatcher};
///
/// struct Nop;
///
/// impl InstructionMatcher for Nop {
///     fn matches(&self, instruction: &Instruction, _resolver: &dyn TokenResolver) -> bool {
///         instruction.mnemonic == "nop"
///     }
///
///     fn description(&self) -> String {
///         "nop".to_string()
///     }
/// }
/// ```
///
/// # Identity
///
/// The description becomes part of a patch's identity, so it must describe every
/// criterion the matcher checks.
pub trait InstructionMatcher: Send + Sync {
    /// Checks if `instruction` satisfies this matcher.
    fn matches(&self, instruction: &Instruction, resolver: &dyn TokenResolver) -> bool;

    /// Stable, human-readable description of the criterion.
    fn description(&self) -> String;
}

/// Matches instructions by mnemonic.
#[derive(Clone, Debug)]
pub struct OpcodeMatcher {
    mnemonic: String,
    any_form: bool,
}

impl OpcodeMatcher {
    /// Match exactly `mnemonic`.
    #[must_use]
    pub fn new(mnemonic: impl Into<String>) -> Self {
        OpcodeMatcher {
            mnemonic: mnemonic.into(),
            any_form: false,
        }
    }

    /// Match `mnemonic` in both its short and long encoding, e.g. `br` and `br.s`.
    #[must_use]
    pub fn any_form(mnemonic: impl Into<String>) -> Self {
        OpcodeMatcher {
            mnemonic: mnemonic.into(),
            any_form: true,
        }
    }
}

impl InstructionMatcher for OpcodeMatcher {
    fn matches(&self, instruction: &Instruction, _resolver: &dyn TokenResolver) -> bool {
        if instruction.mnemonic == self.mnemonic {
            return true;
        }
        self.any_form
            && (long_form(instruction.mnemonic) == Some(self.mnemonic.as_str())
                || long_form(&self.mnemonic) == Some(instruction.mnemonic))
    }

    fn description(&self) -> String {
        if self.any_form {
            format!("{}(any form)", self.mnemonic)
        } else {
            self.mnemonic.clone()
        }
    }
}

/// Matches instructions by control-flow class.
#[derive(Clone, Copy, Debug)]
pub struct FlowMatcher(pub FlowType);

impl InstructionMatcher for FlowMatcher {
    fn matches(&self, instruction: &Instruction, _resolver: &dyn TokenResolver) -> bool {
        instruction.flow_type == self.0
    }

    fn description(&self) -> String {
        format!("flow={:?}", self.0)
    }
}

/// Whether a [`LocalMatcher`] looks for loads or stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalAccess {
    /// `ldloc*`
    Load,
    /// `stloc*`
    Store,
}

/// Matches loads or stores of a local slot, in any encoding.
#[derive(Clone, Copy, Debug)]
pub struct LocalMatcher {
    access: LocalAccess,
    index: Option<u16>,
}

impl LocalMatcher {
    /// Any `ldloc*`.
    #[must_use]
    pub fn load() -> Self {
        LocalMatcher {
            access: LocalAccess::Load,
            index: None,
        }
    }

    /// Any `stloc*`.
    #[must_use]
    pub fn store() -> Self {
        LocalMatcher {
            access: LocalAccess::Store,
            index: None,
        }
    }

    /// Restrict the match to local `index`.
    #[must_use]
    pub fn index(mut self, index: u16) -> Self {
        self.index = Some(index);
        self
    }
}

impl InstructionMatcher for LocalMatcher {
    fn matches(&self, instruction: &Instruction, _resolver: &dyn TokenResolver) -> bool {
        let accessed = match self.access {
            LocalAccess::Load => instruction.loaded_local(),
            LocalAccess::Store => instruction.stored_local(),
        };
        accessed.is_some_and(|index| self.index.is_none_or(|wanted| wanted == index))
    }

    fn description(&self) -> String {
        let op = match self.access {
            LocalAccess::Load => "ldloc",
            LocalAccess::Store => "stloc",
        };
        match self.index {
            Some(index) => format!("{op}({index})"),
            None => format!("{op}(*)"),
        }
    }
}

/// Matches loads of an argument, in any encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArgumentMatcher {
    index: Option<u16>,
}

impl ArgumentMatcher {
    /// Any `ldarg*`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the match to argument `index`.
    #[must_use]
    pub fn index(mut self, index: u16) -> Self {
        self.index = Some(index);
        self
    }
}

impl InstructionMatcher for ArgumentMatcher {
    fn matches(&self, instruction: &Instruction, _resolver: &dyn TokenResolver) -> bool {
        instruction
            .loaded_argument()
            .is_some_and(|index| self.index.is_none_or(|wanted| wanted == index))
    }

    fn description(&self) -> String {
        match self.index {
            Some(index) => format!("ldarg({index})"),
            None => "ldarg(*)".to_string(),
        }
    }
}

/// Matches an integer constant load, in any encoding.
#[derive(Clone, Copy, Debug)]
pub struct ConstantMatcher(pub i64);

impl InstructionMatcher for ConstantMatcher {
    fn matches(&self, instruction: &Instruction, _resolver: &dyn TokenResolver) -> bool {
        instruction.constant() == Some(self.0)
    }

    fn description(&self) -> String {
        format!("ldc({})", self.0)
    }
}

/// Matches `call` and `callvirt` by callee.
///
/// Each criterion is optional; unset criteria match anything.
#[derive(Clone, Debug, Default)]
pub struct CallMatcher {
    type_name: Option<String>,
    method_name: Option<String>,
    returns: Option<Option<TypeDescriptor>>,
}

impl CallMatcher {
    /// A matcher for any call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the callee's declaring type to be `name`.
    #[must_use]
    pub fn type_name(mut self, name: impl Into<String>) -> Self {
        self.type_name = Some(name.into());
        self
    }

    /// Require the callee to be called `name`.
    #[must_use]
    pub fn method_name(mut self, name: impl Into<String>) -> Self {
        self.method_name = Some(name.into());
        self
    }

    /// Require the callee to return `returns`, `None` for `void`.
    #[must_use]
    pub fn returns(mut self, returns: Option<TypeDescriptor>) -> Self {
        self.returns = Some(returns);
        self
    }
}

impl InstructionMatcher for CallMatcher {
    fn matches(&self, instruction: &Instruction, resolver: &dyn TokenResolver) -> bool {
        if !matches!(instruction.mnemonic, "call" | "callvirt") {
            return false;
        }
        let Some(signature) = instruction
            .token()
            .and_then(|token| resolver.method_signature(token))
        else {
            return false;
        };

        self.type_name
            .as_ref()
            .is_none_or(|name| *name == signature.type_name)
            && self
                .method_name
                .as_ref()
                .is_none_or(|name| *name == signature.name)
            && self
                .returns
                .as_ref()
                .is_none_or(|returns| *returns == signature.returns)
    }

    fn description(&self) -> String {
        let mut parts = Vec::new();
        if let Some(name) = &self.type_name {
            parts.push(format!("type={name}"));
        }
        if let Some(name) = &self.method_name {
            parts.push(format!("method={name}"));
        }
        if let Some(returns) = &self.returns {
            match returns {
                Some(ty) => parts.push(format!("returns={ty}")),
                None => parts.push("returns=void".to_string()),
            }
        }
        if parts.is_empty() {
            "call(*)".to_string()
        } else {
            format!("call({})", parts.join(", "))
        }
    }
}

/// Which field accesses a [`FieldAccessMatcher`] accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldAccess {
    /// `ldfld`, `ldsfld`, `ldflda`, `ldsflda`
    Load,
    /// `stfld`, `stsfld`
    Store,
    /// Either
    Any,
}

/// Matches field accesses by field name and optionally declaring type.
#[derive(Clone, Debug)]
pub struct FieldAccessMatcher {
    access: FieldAccess,
    field: String,
    type_name: Option<String>,
}

impl FieldAccessMatcher {
    /// Match `access` of any field called `field`.
    #[must_use]
    pub fn new(access: FieldAccess, field: impl Into<String>) -> Self {
        FieldAccessMatcher {
            access,
            field: field.into(),
            type_name: None,
        }
    }

    /// Require the field to be declared by `name`.
    #[must_use]
    pub fn type_name(mut self, name: impl Into<String>) -> Self {
        self.type_name = Some(name.into());
        self
    }
}

impl InstructionMatcher for FieldAccessMatcher {
    fn matches(&self, instruction: &Instruction, resolver: &dyn TokenResolver) -> bool {
        let kind = match instruction.mnemonic {
            "ldfld" | "ldsfld" | "ldflda" | "ldsflda" => FieldAccess::Load,
            "stfld" | "stsfld" => FieldAccess::Store,
            _ => return false,
        };
        if self.access != FieldAccess::Any && self.access != kind {
            return false;
        }

        instruction
            .token()
            .and_then(|token| resolver.field_signature(token))
            .is_some_and(|field| {
                field.name == self.field
                    && self
                        .type_name
                        .as_ref()
                        .is_none_or(|name| *name == field.type_name)
            })
    }

    fn description(&self) -> String {
        let access = match self.access {
            FieldAccess::Load => "load",
            FieldAccess::Store => "store",
            FieldAccess::Any => "access",
        };
        match &self.type_name {
            Some(name) => format!("field-{access}({name}.{})", self.field),
            None => format!("field-{access}({})", self.field),
        }
    }
}

/// Matches every instruction.
#[derive(Clone, Copy, Debug)]
pub struct AnyMatcher;

impl InstructionMatcher for AnyMatcher {
    fn matches(&self, _instruction: &Instruction, _resolver: &dyn TokenResolver) -> bool {
        true
    }

    fn description(&self) -> String {
        "*".to_string()
    }
}

/// Matches with a closure.
///
/// The description is supplied by the caller and stands in for the closure when the
/// patch identity is computed.
#[derive(Clone)]
pub struct PredicateMatcher {
    description: String,
    predicate: Arc<InstructionPredicate>,
}

impl PredicateMatcher {
    /// Wrap `predicate`, described as `description`.
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Instruction, &dyn TokenResolver) -> bool + Send + Sync + 'static,
    {
        PredicateMatcher {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl InstructionMatcher for PredicateMatcher {
    fn matches(&self, instruction: &Instruction, resolver: &dyn TokenResolver) -> bool {
        (self.predicate)(instruction, resolver)
    }

    fn description(&self) -> String {
        format!("where({})", self.description)
    }
}

/// Where a step may match relative to the previous step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gap {
    /// Immediately after the previous step
    Adjacent,
    /// At the first satisfying instruction anywhere after the previous step
    Eventually,
}

/// One step of a [`Pattern`].
#[derive(Clone)]
pub struct PatternStep {
    /// Placement relative to the previous step, ignored for the first step
    pub gap: Gap,
    /// The criterion
    pub matcher: Arc<dyn InstructionMatcher>,
}

/// Instruction indices matched by each step of a [`Pattern`], in step order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternMatch {
    positions: Vec<usize>,
}

impl PatternMatch {
    /// Index of the instruction matched by the first step.
    #[must_use]
    pub fn start(&self) -> usize {
        self.positions.first().copied().unwrap_or_default()
    }

    /// One past the index of the instruction matched by the last step.
    #[must_use]
    pub fn end(&self) -> usize {
        self.positions.last().map_or(0, |last| last + 1)
    }

    /// Index matched by `step`.
    #[must_use]
    pub fn position(&self, step: usize) -> Option<usize> {
        self.positions.get(step).copied()
    }

    /// All matched indices.
    #[must_use]
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }
}

/// An ordered sequence of instruction matchers.
#[derive(Clone, Default)]
pub struct Pattern {
    steps: Vec<PatternStep>,
}

impl Pattern {
    /// An empty pattern, which never matches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step that must match directly after the previous one.
    #[must_use]
    pub fn then(self, matcher: impl InstructionMatcher + 'static) -> Self {
        self.step(Gap::Adjacent, matcher)
    }

    /// Append a step that may match anywhere after the previous one.
    #[must_use]
    pub fn eventually(self, matcher: impl InstructionMatcher + 'static) -> Self {
        self.step(Gap::Eventually, matcher)
    }

    /// Append a step with an explicit gap.
    #[must_use]
    pub fn step(mut self, gap: Gap, matcher: impl InstructionMatcher + 'static) -> Self {
        self.steps.push(PatternStep {
            gap,
            matcher: Arc::new(matcher),
        });
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the pattern has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The steps, in order.
    #[must_use]
    pub fn steps(&self) -> &[PatternStep] {
        &self.steps
    }

    /// Canonical description: step descriptions joined by `" "` for adjacent steps and
    /// `" ... "` for eventual ones.
    #[must_use]
    pub fn description(&self) -> String {
        let mut out = String::new();
        for (index, step) in self.steps.iter().enumerate() {
            if index > 0 {
                out.push_str(match step.gap {
                    Gap::Adjacent => " ",
                    Gap::Eventually => " ... ",
                });
            }
            out.push_str(&step.matcher.description());
        }
        out
    }

    /// Find the first match starting at or after instruction `from`.
    #[must_use]
    pub fn find(
        &self,
        code: &InstructionSequence,
        from: usize,
        resolver: &dyn TokenResolver,
    ) -> Option<PatternMatch> {
        let (first, rest) = self.steps.split_first()?;
        let instructions = code.instructions();

        'start: for start in from..instructions.len() {
            if !first.matcher.matches(&instructions[start], resolver) {
                continue;
            }

            let mut positions = Vec::with_capacity(self.steps.len());
            positions.push(start);
            let mut previous = start;

            for step in rest {
                let candidate = match step.gap {
                    Gap::Adjacent => instructions
                        .get(previous + 1)
                        .filter(|instruction| step.matcher.matches(instruction, resolver))
                        .map(|_| previous + 1),
                    Gap::Eventually => (previous + 1..instructions.len())
                        .find(|&index| step.matcher.matches(&instructions[index], resolver)),
                };

                match candidate {
                    Some(index) => {
                        positions.push(index);
                        previous = index;
                    }
                    None => continue 'start,
                }
            }

            return Some(PatternMatch { positions });
        }
        None
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{
            image::{AssemblyImage, FieldAttributes, FieldDefinition, TypeAttributes},
            token::{TableId, Token},
        },
        test::body,
    };
    use uguid::guid;

    fn image() -> (AssemblyImage, Token, Token) {
        let mut image = AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-0000000000aa"));
        image.add_type("Game", "Score", TypeAttributes::PUBLIC).unwrap();
        let add = image.add_member_ref(
            "Game.Score",
            "Add",
            false,
            vec![TypeDescriptor::int32()],
            Some(TypeDescriptor::int32()),
        );
        let field = Token::from_parts(TableId::Field, 1);
        image
            .find_type_mut("Game.Score")
            .unwrap()
            .fields
            .push(FieldDefinition {
                token: field,
                name: "total".to_string(),
                field_type: TypeDescriptor::int32(),
                flags: FieldAttributes::PUBLIC | FieldAttributes::STATIC,
                offset: None,
            });
        (image, add, field)
    }

    #[test]
    fn adjacent_steps() {
        let (image, _, _) = image();
        let code = body(&["ldc.i4.1", "stloc.0", "ldloc.0", "stloc.1", "ret"]);

        let pattern = Pattern::new()
            .then(LocalMatcher::load())
            .then(LocalMatcher::store().index(1));
        let found = pattern.find(&code, 0, &image).unwrap();
        assert_eq!(found.positions(), &[2, 3]);
        assert_eq!(found.end(), 4);

        assert!(pattern.find(&code, 3, &image).is_none());
    }

    #[test]
    fn eventually_is_greedy_first_match() {
        let (image, add, _) = image();
        let mut code = body(&["ldc.i4.2", "stloc.0", "ldc.i4.3", "stloc.0"]);
        code.push(Instruction::ldloc(0).unwrap());
        code.push(Instruction::call(add).unwrap());
        code.push(Instruction::simple("ret").unwrap());

        let pattern = Pattern::new()
            .then(LocalMatcher::store().index(0))
            .eventually(CallMatcher::new().method_name("Add").returns(Some(TypeDescriptor::int32())));
        let found = pattern.find(&code, 0, &image).unwrap();
        assert_eq!(found.positions(), &[1, 5]);

        let wrong_type = Pattern::new().then(CallMatcher::new().type_name("Game.Other"));
        assert!(wrong_type.find(&code, 0, &image).is_none());
    }

    #[test]
    fn constants_and_forms() {
        let (image, _, field) = image();
        let mut code = body(&["ldc.i4.s 100", "br.s 0"]);
        code.push(Instruction::with_token("stsfld", field).unwrap());

        assert!(Pattern::new()
            .then(ConstantMatcher(100))
            .find(&code, 0, &image)
            .is_some());
        assert!(Pattern::new()
            .then(OpcodeMatcher::any_form("br"))
            .find(&code, 0, &image)
            .is_some());
        assert!(Pattern::new()
            .then(OpcodeMatcher::new("br"))
            .find(&code, 0, &image)
            .is_none());
        assert!(Pattern::new()
            .then(FieldAccessMatcher::new(FieldAccess::Store, "total").type_name("Game.Score"))
            .find(&code, 0, &image)
            .is_some());
        assert!(Pattern::new()
            .then(FieldAccessMatcher::new(FieldAccess::Load, "total"))
            .find(&code, 0, &image)
            .is_none());
    }

    #[test]
    fn predicate_and_description() {
        let (image, _, _) = image();
        let code = body(&["nop", "dup", "pop", "ret"]);

        let pattern = Pattern::new()
            .then(PredicateMatcher::new("dup", |i, _| i.mnemonic == "dup"))
            .eventually(FlowMatcher(FlowType::Return));
        assert_eq!(pattern.find(&code, 0, &image).unwrap().positions(), &[1, 3]);
        assert_eq!(pattern.description(), "where(dup) ... flow=Return");
        assert!(Pattern::new().find(&code, 0, &image).is_none());
    }
}
