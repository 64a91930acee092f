//! Declarative patch descriptions and their identities.
//!
//! A [`PatchDescriptor`] says what to change without touching any image. The coordinator
//! applies descriptors in order and uses each one's [`DescriptorId`] to decide whether it
//! has already been applied to a module.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::{
    metadata::typesystem::TypeDescriptor,
    patch::{action::PatchAction, pattern::Pattern},
};

/// SHA-1 over a descriptor's canonical description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub [u8; 20]);

impl DescriptorId {
    /// Lowercase hex form, used as the ledger marker name.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    /// Parse the form produced by [`DescriptorId::to_hex`].
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0_u8; 20];
        for (index, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[index * 2..index * 2 + 2], 16).ok()?;
        }
        Some(DescriptorId(bytes))
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DescriptorId({})", &self.to_hex()[..12])
    }
}

/// Where a patch applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    /// Full name of the type
    pub type_name: String,
    /// Method name, for instruction patches
    pub method: Option<String>,
}

impl fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(method) => write!(f, "{}::{}", self.type_name, method),
            None => write!(f, "{}", self.type_name),
        }
    }
}

/// A field to add.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: TypeDescriptor,
    /// Per-type instead of per-instance storage
    pub is_static: bool,
    /// Explicit byte offset, for explicit-layout types
    pub offset: Option<u32>,
}

impl FieldSpec {
    /// An instance field without explicit offset.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: TypeDescriptor) -> Self {
        FieldSpec {
            name: name.into(),
            field_type,
            is_static: false,
            offset: None,
        }
    }

    /// Make the field static.
    #[must_use]
    pub fn static_field(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Place the field at `offset`.
    #[must_use]
    pub fn at_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// The kind of change a descriptor makes.
#[derive(Debug, Clone)]
pub enum PatchKind {
    /// Add a field to the target type
    FieldInjection(FieldSpec),
    /// Edit the target method at the first match of `pattern`
    InstructionPatch {
        /// What to look for
        pattern: Pattern,
        /// What to do there
        action: PatchAction,
    },
}

/// A named, declarative patch.
#[derive(Debug, Clone)]
pub struct PatchDescriptor {
    /// Human-readable name, used in reports and logs
    pub name: String,
    /// Where to apply
    pub target: PatchTarget,
    /// What to do
    pub kind: PatchKind,
}

impl PatchDescriptor {
    /// Describe a field injection into `type_name`.
    #[must_use]
    pub fn inject_field(name: impl Into<String>, type_name: impl Into<String>, field: FieldSpec) -> Self {
        PatchDescriptor {
            name: name.into(),
            target: PatchTarget {
                type_name: type_name.into(),
                method: None,
            },
            kind: PatchKind::FieldInjection(field),
        }
    }

    /// Describe an instruction patch of `type_name::method`.
    #[must_use]
    pub fn instruction_patch(
        name: impl Into<String>,
        type_name: impl Into<String>,
        method: impl Into<String>,
        pattern: Pattern,
        action: PatchAction,
    ) -> Self {
        PatchDescriptor {
            name: name.into(),
            target: PatchTarget {
                type_name: type_name.into(),
                method: Some(method.into()),
            },
            kind: PatchKind::InstructionPatch { pattern, action },
        }
    }

    /// Canonical description of what the patch does. The name is not part of it, so
    /// renaming a patch does not make it apply twice.
    #[must_use]
    pub fn canonical(&self) -> String {
        match &self.kind {
            PatchKind::FieldInjection(field) => {
                let mut out = format!(
                    "field {} {}.{}",
                    field.field_type, self.target.type_name, field.name
                );
                if field.is_static {
                    out.push_str(" static");
                }
                if let Some(offset) = field.offset {
                    out.push_str(&format!(" @{offset}"));
                }
                out
            }
            PatchKind::InstructionPatch { pattern, action } => format!(
                "code {} match [{}] {}",
                self.target,
                pattern.description(),
                action.description()
            ),
        }
    }

    /// Identity of this patch.
    #[must_use]
    pub fn identity(&self) -> DescriptorId {
        let mut hasher = Sha1::new();
        hasher.update(self.canonical().as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0_u8; 20];
        bytes.copy_from_slice(&digest);
        DescriptorId(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{action::CallbackRef, pattern::LocalMatcher};

    #[test]
    fn identity_ignores_name() {
        let a = PatchDescriptor::inject_field("a", "Game.Player", FieldSpec::new("hp", TypeDescriptor::int32()));
        let b = PatchDescriptor::inject_field("b", "Game.Player", FieldSpec::new("hp", TypeDescriptor::int32()));
        let c = PatchDescriptor::inject_field(
            "a",
            "Game.Player",
            FieldSpec::new("hp", TypeDescriptor::int32()).static_field(),
        );
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
        assert_eq!(c.canonical(), "field int32 Game.Player.hp static");
    }

    #[test]
    fn identity_covers_pattern_and_action() {
        let patch = |index| {
            PatchDescriptor::instruction_patch(
                "p",
                "Game.Calc",
                "Compute",
                Pattern::new().then(LocalMatcher::store().index(index)),
                PatchAction::WrapWithDelegate {
                    callback: CallbackRef::new("Hooks", "Wrap"),
                },
            )
        };
        assert_ne!(patch(0).identity(), patch(1).identity());
        assert_eq!(
            patch(0).canonical(),
            "code Game.Calc::Compute match [stloc(0)] wrap void Hooks::Wrap()"
        );
    }

    #[test]
    fn hex_roundtrip() {
        let id = PatchDescriptor::inject_field("x", "T", FieldSpec::new("f", TypeDescriptor::boolean())).identity();
        assert_eq!(DescriptorId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(DescriptorId::from_hex("zz"), None);
    }
}
