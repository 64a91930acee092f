//! Ordered application of patch descriptors, offline or at load time.
//!
//! The [`PatchCoordinator`] is the single place that decides whether a descriptor still
//! needs applying. It keeps an in-memory ledger of applied [`DescriptorId`]s per module
//! version id and, unless disabled in [`PatchConfig`], records each applied id as a static
//! marker field on a sentinel type inside the image itself:
//!
//! ```text
//! <CilSplice>.PatchLedger
//!     static bool 3f2a...   one marker per applied descriptor, named by its id
//! ```
//!
//! A module written by one pass therefore carries its own history, and a later pass
//! (possibly from another process) skips what is already there.
//!
//! Failures to resolve a target are expected when the host module changes between
//! versions. So are actions that no longer fit the matched code. Both are recorded in
//! the [`ApplyReport`] and logged, and the pass goes on. A body that fails verification
//! after editing aborts the pass with [`Error::InvalidInstructionStream`] and nothing is
//! written or installed.
//!
//! The in-memory ledger only learns about a pass once its result is kept: when
//! [`PatchCoordinator::apply_all`] returns `Ok`, after [`PatchCoordinator::patch_file`]
//! wrote its output, or after [`PatchCoordinator::install`] installed the image.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};

use log::{debug, error, info, warn};
use uguid::Guid;

use crate::{
    metadata::{
        image::{AssemblyImage, TypeAttributes},
        typesystem::TypeDescriptor,
    },
    patch::{
        action::PatchAction,
        config::PatchConfig,
        descriptor::{DescriptorId, FieldSpec, PatchDescriptor, PatchKind},
        injector::inject_field,
        patcher::{apply_patch, PatchResult},
        pattern::Pattern,
    },
    runtime::Runtime,
    Error, Result,
};

/// Namespace of the ledger type
pub const LEDGER_NAMESPACE: &str = "<CilSplice>";
/// Name of the ledger type
pub const LEDGER_TYPE: &str = "PatchLedger";

/// Why a descriptor was not applied although nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The ledger shows the descriptor was applied before
    AlreadyApplied,
    /// The field to inject already exists with the requested type and storage
    FieldPresent,
}

/// Why a descriptor could not be applied.
#[derive(Debug)]
pub enum FailureReason {
    /// The target method exists but the pattern did not match
    PatternNotFound,
    /// The pattern matched but the action cannot be carried out there
    NotApplicable(String),
    /// Resolution or injection failed
    Error(Error),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PatternNotFound => write!(f, "pattern not found"),
            FailureReason::NotApplicable(reason) => write!(f, "action not applicable: {reason}"),
            FailureReason::Error(error) => write!(f, "{error}"),
        }
    }
}

/// A descriptor that was applied.
#[derive(Debug, Clone)]
pub struct AppliedPatch {
    /// Descriptor name
    pub name: String,
    /// Descriptor identity
    pub id: DescriptorId,
    /// First matched instruction, for instruction patches
    pub position: Option<usize>,
}

/// A descriptor that was skipped.
#[derive(Debug, Clone)]
pub struct SkippedPatch {
    /// Descriptor name
    pub name: String,
    /// Descriptor identity
    pub id: DescriptorId,
    /// Why
    pub reason: SkipReason,
}

/// A descriptor that failed.
#[derive(Debug)]
pub struct FailedPatch {
    /// Descriptor name
    pub name: String,
    /// Why
    pub reason: FailureReason,
}

/// Outcome of one pass over one module.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Module name
    pub module: String,
    /// Applied descriptors, in application order
    pub applied: Vec<AppliedPatch>,
    /// Skipped descriptors
    pub skipped: Vec<SkippedPatch>,
    /// Failed descriptors
    pub failed: Vec<FailedPatch>,
}

impl ApplyReport {
    /// Returns true if no descriptor failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns true if the pass changed the image.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// An input module and where to write its patched form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTarget {
    /// Module to read
    pub input: PathBuf,
    /// Destination of the patched module
    pub output: PathBuf,
}

impl ModuleTarget {
    /// Read `input`, write `output`.
    #[must_use]
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        ModuleTarget {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Patch `path` in place.
    #[must_use]
    pub fn in_place(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        ModuleTarget {
            input: path.clone(),
            output: path,
        }
    }
}

/// Result of patching one [`ModuleTarget`].
#[derive(Debug)]
pub struct ModuleReport {
    /// The module
    pub target: ModuleTarget,
    /// The pass outcome, or the error that stopped it
    pub result: Result<ApplyReport>,
}

/// Applies descriptors to images and remembers what it applied.
///
/// # Examples
///
/// ```rust
/// use cilsplice::{
///     metadata::{image::{AssemblyImage, TypeAttributes}, typesystem::TypeDescriptor},
///     patch::{FieldSpec, PatchCoordinator, PatchDescriptor, SkipReason},
/// };
/// use uguid::guid;
///
/// let mut image = AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-000000000001"));
/// image.add_type("Game", "Player", TypeAttributes::PUBLIC)?;
///
/// let patches = [PatchDescriptor::inject_field(
///     "player-shield",
///     "Game.Player",
///     FieldSpec::new("shield", TypeDescriptor::int32()),
/// )];
///
/// let mut coordinator = PatchCoordinator::new();
/// let first = coordinator.apply_all(&mut image, &patches)?;
/// assert_eq!(first.applied.len(), 1);
///
/// let second = coordinator.apply_all(&mut image, &patches)?;
/// assert_eq!(second.skipped[0].reason, SkipReason::AlreadyApplied);
/// # Ok::<(), cilsplice::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct PatchCoordinator {
    config: PatchConfig,
    ledger: HashMap<Guid, HashSet<DescriptorId>>,
}

impl PatchCoordinator {
    /// A coordinator with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A coordinator with `config`.
    #[must_use]
    pub fn with_config(config: PatchConfig) -> Self {
        PatchCoordinator {
            config,
            ledger: HashMap::new(),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// Returns true if `id` is recorded as applied to `image`.
    #[must_use]
    pub fn is_applied(&self, image: &AssemblyImage, id: DescriptorId) -> bool {
        if ledger_contains(image, id) {
            return true;
        }
        // With persisted markers the image is authoritative: a missing marker means
        // this is an unpatched copy of the module.
        !self.config.record_ledger
            && self
                .ledger
                .get(&image.mvid())
                .is_some_and(|applied| applied.contains(&id))
    }

    /// Apply `descriptors` to `image` in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInstructionStream`] if an edited body fails verification.
    /// The image may already contain earlier patches of this pass and must not be
    /// written. All other problems are reported in the returned [`ApplyReport`].
    pub fn apply_all(
        &mut self,
        image: &mut AssemblyImage,
        descriptors: &[PatchDescriptor],
    ) -> Result<ApplyReport> {
        let (report, pending) = self.run(image, descriptors)?;
        self.commit(image.mvid(), pending);
        Ok(report)
    }

    /// One pass over `image`. Returns the ids to add to the ledger if the result is kept.
    fn run(
        &self,
        image: &mut AssemblyImage,
        descriptors: &[PatchDescriptor],
    ) -> Result<(ApplyReport, HashSet<DescriptorId>)> {
        let mut report = ApplyReport {
            module: image.name().to_string(),
            ..ApplyReport::default()
        };
        let mut pending = HashSet::new();

        for descriptor in descriptors {
            let id = descriptor.identity();
            if pending.contains(&id) || self.is_applied(image, id) {
                debug!("Skipping {} ({}), already applied", descriptor.name, id);
                report.skipped.push(SkippedPatch {
                    name: descriptor.name.clone(),
                    id,
                    reason: SkipReason::AlreadyApplied,
                });
                continue;
            }

            let outcome = match &descriptor.kind {
                PatchKind::FieldInjection(field) => {
                    apply_field(image, &descriptor.target.type_name, field)
                }
                PatchKind::InstructionPatch { pattern, action } => {
                    let method = descriptor.target.method.as_deref().unwrap_or_default();
                    apply_code(image, &descriptor.target.type_name, method, pattern, action)
                }
            };

            match outcome {
                Ok(Outcome::Applied(position)) => {
                    debug!("Applied {} to {}", descriptor.name, descriptor.target);
                    self.mark(image, id)?;
                    pending.insert(id);
                    report.applied.push(AppliedPatch {
                        name: descriptor.name.clone(),
                        id,
                        position,
                    });
                }
                Ok(Outcome::Skipped(reason)) => {
                    warn!("Skipping {}: {:?}", descriptor.name, reason);
                    self.mark(image, id)?;
                    pending.insert(id);
                    report.skipped.push(SkippedPatch {
                        name: descriptor.name.clone(),
                        id,
                        reason,
                    });
                }
                Ok(Outcome::Failed(reason)) => {
                    warn!(
                        "Could not apply {} to {}: {}",
                        descriptor.name, descriptor.target, reason
                    );
                    report.failed.push(FailedPatch {
                        name: descriptor.name.clone(),
                        reason,
                    });
                    if self.config.stop_on_failure {
                        break;
                    }
                }
                Err(error) => {
                    error!("Aborting pass over {}: {}", image.name(), error);
                    return Err(error);
                }
            }
        }

        info!(
            "Patched {}: {} applied, {} skipped, {} failed",
            report.module,
            report.applied.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok((report, pending))
    }

    /// Patch the module at `input` and write the result to `output`.
    ///
    /// `input` and `output` may be the same path; the input is fully read before
    /// anything is written. If descriptors failed and the configuration disallows
    /// writing on failure, nothing is written.
    ///
    /// # Errors
    ///
    /// Returns I/O and parse errors, and [`Error::InvalidInstructionStream`] from
    /// [`PatchCoordinator::apply_all`], in which case nothing is written.
    pub fn patch_file(
        &mut self,
        input: &Path,
        output: &Path,
        descriptors: &[PatchDescriptor],
    ) -> Result<ApplyReport> {
        let mut image = AssemblyImage::from_file(input)?;
        let (report, pending) = self.run(&mut image, descriptors)?;

        if report.is_clean() || self.config.write_on_failure {
            image.write_to_file(output)?;
            self.commit(image.mvid(), pending);
        } else {
            warn!(
                "Not writing {}: {} patches failed",
                output.display(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Patch several modules one after another.
    ///
    /// Each module is handled independently: an error in one does not stop the others.
    pub fn patch_modules(
        &mut self,
        targets: &[ModuleTarget],
        descriptors: &[PatchDescriptor],
    ) -> Vec<ModuleReport> {
        targets
            .iter()
            .map(|target| {
                let result = self.patch_file(&target.input, &target.output, descriptors);
                if let Err(error) = &result {
                    error!("Failed to patch {}: {}", target.input.display(), error);
                }
                ModuleReport {
                    target: target.clone(),
                    result,
                }
            })
            .collect()
    }

    /// Patch the loaded module `module` and install the result into `runtime`.
    ///
    /// The runtime's metadata snapshot for the module is replaced and every method body
    /// the pass changed is installed into the live method table. Methods already
    /// running keep executing their old body; subsequent calls see the new one. There
    /// is no rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if the module is not loaded, and
    /// [`Error::InvalidInstructionStream`] from [`PatchCoordinator::apply_all`], in which
    /// case nothing is installed.
    pub fn install(
        &mut self,
        runtime: &Runtime,
        module: &str,
        descriptors: &[PatchDescriptor],
    ) -> Result<ApplyReport> {
        let mut image = (*runtime.image(module)?).clone();
        let mvid = image.mvid();
        let (report, pending) = self.run(&mut image, descriptors)?;

        if report.changed() {
            let installed = runtime.install_image(image)?;
            info!("Installed {} patched bodies into {}", installed, module);
        }
        self.commit(mvid, pending);
        Ok(report)
    }

    fn commit(&mut self, mvid: Guid, pending: HashSet<DescriptorId>) {
        if !pending.is_empty() {
            self.ledger.entry(mvid).or_default().extend(pending);
        }
    }

    /// Persist `id` as a marker field when the configuration asks for it.
    fn mark(&self, image: &mut AssemblyImage, id: DescriptorId) -> Result<()> {
        if !self.config.record_ledger || ledger_contains(image, id) {
            return Ok(());
        }

        let ledger = format!("{LEDGER_NAMESPACE}.{LEDGER_TYPE}");
        if image.find_type(&ledger).is_none() {
            image.add_type(
                LEDGER_NAMESPACE,
                LEDGER_TYPE,
                TypeAttributes::ABSTRACT | TypeAttributes::SEALED | TypeAttributes::SPECIAL_NAME,
            )?;
        }
        inject_field(image, &ledger, &id.to_hex(), TypeDescriptor::boolean(), true, None)?;
        Ok(())
    }
}

/// Descriptor ids recorded in the image's ledger type.
#[must_use]
pub fn recorded_ids(image: &AssemblyImage) -> Vec<DescriptorId> {
    image
        .find_type(&format!("{LEDGER_NAMESPACE}.{LEDGER_TYPE}"))
        .map(|ledger| {
            ledger
                .fields
                .iter()
                .filter_map(|field| DescriptorId::from_hex(&field.name))
                .collect()
        })
        .unwrap_or_default()
}

fn ledger_contains(image: &AssemblyImage, id: DescriptorId) -> bool {
    image
        .find_type(&format!("{LEDGER_NAMESPACE}.{LEDGER_TYPE}"))
        .is_some_and(|ledger| ledger.field(&id.to_hex()).is_some())
}

enum Outcome {
    Applied(Option<usize>),
    Skipped(SkipReason),
    Failed(FailureReason),
}

fn apply_field(image: &mut AssemblyImage, type_name: &str, field: &FieldSpec) -> Result<Outcome> {
    match inject_field(
        image,
        type_name,
        &field.name,
        field.field_type.clone(),
        field.is_static,
        field.offset,
    ) {
        Ok(_) => Ok(Outcome::Applied(None)),
        Err(Error::FieldNameCollision {
            type_name,
            field: name,
            existing,
        }) => {
            let compatible = image
                .find_type(&type_name)
                .and_then(|ty| ty.field(&name))
                .is_some_and(|present| {
                    present.field_type == field.field_type && present.is_static() == field.is_static
                });
            if compatible {
                Ok(Outcome::Skipped(SkipReason::FieldPresent))
            } else {
                Ok(Outcome::Failed(FailureReason::Error(Error::FieldNameCollision {
                    type_name,
                    field: name,
                    existing,
                })))
            }
        }
        Err(error) => Ok(Outcome::Failed(FailureReason::Error(error))),
    }
}

fn apply_code(
    image: &mut AssemblyImage,
    type_name: &str,
    method_name: &str,
    pattern: &Pattern,
    action: &PatchAction,
) -> Result<Outcome> {
    let mut working = match image.find_method(type_name, method_name) {
        Ok(method) => method.clone(),
        Err(error) => return Ok(Outcome::Failed(FailureReason::Error(error))),
    };

    // binding adds member references, so only bind once the pattern is known to match
    let matched = working
        .body
        .as_ref()
        .is_some_and(|body| pattern.find(&body.code, 0, image).is_some());
    if !matched {
        warn!(
            "Pattern [{}] not found in {}::{}",
            pattern.description(),
            type_name,
            method_name
        );
        return Ok(Outcome::Failed(FailureReason::PatternNotFound));
    }

    // references added by binding are dropped again unless the edit is kept
    let refs = image.member_refs().len();
    let bound = action.bind(image)?;
    let outcome = match apply_patch(&mut working, pattern, &bound, image) {
        Ok(PatchResult::Applied { position }) => {
            *image.find_method_mut(type_name, method_name)? = working;
            return Ok(Outcome::Applied(Some(position)));
        }
        Ok(PatchResult::NotFound) => Ok(Outcome::Failed(FailureReason::PatternNotFound)),
        Ok(PatchResult::NotApplicable(reason)) => {
            Ok(Outcome::Failed(FailureReason::NotApplicable(reason)))
        }
        Err(error) => Err(error),
    };
    image.truncate_member_refs(refs);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Instruction,
        metadata::{
            method::{MethodAttributes, MethodBody, MethodDefinition},
            token::Token,
        },
        patch::{action::CallbackRef, pattern::OpcodeMatcher},
        test::body,
    };
    use uguid::guid;

    fn host() -> AssemblyImage {
        let mut image = AssemblyImage::new("Host", guid!("00000000-0000-0000-0000-0000000000ff"));
        image.add_type("Game", "Player", TypeAttributes::PUBLIC).unwrap();
        image
            .add_method(
                "Game.Player",
                MethodDefinition {
                    token: Token::new(0),
                    name: "Tick".to_string(),
                    flags: MethodAttributes::PUBLIC | MethodAttributes::STATIC,
                    params: vec![],
                    returns: None,
                    body: Some(MethodBody::new(1, vec![], body(&["nop", "ret"]))),
                },
            )
            .unwrap();
        image
    }

    fn shield() -> PatchDescriptor {
        PatchDescriptor::inject_field(
            "shield",
            "Game.Player",
            FieldSpec::new("shield", TypeDescriptor::int32()),
        )
    }

    fn tick_hook() -> PatchDescriptor {
        PatchDescriptor::instruction_patch(
            "tick-hook",
            "Game.Player",
            "Tick",
            Pattern::new().then(OpcodeMatcher::new("ret")),
            PatchAction::InsertBefore(vec![CallbackRef::new("Hooks", "OnTick").into()]),
        )
    }

    #[test]
    fn ledger_survives_in_image() {
        let mut image = host();
        let report = PatchCoordinator::new()
            .apply_all(&mut image, &[shield(), tick_hook()])
            .unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.applied[1].position, Some(1));
        assert_eq!(recorded_ids(&image).len(), 2);

        // a fresh coordinator relies on the markers alone
        let bytes = image.to_bytes().unwrap();
        let mut reloaded = AssemblyImage::from_mem(&bytes).unwrap();
        let again = PatchCoordinator::new()
            .apply_all(&mut reloaded, &[shield(), tick_hook()])
            .unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(again.skipped.len(), 2);
        assert_eq!(reloaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn in_memory_ledger_without_markers() {
        let mut coordinator = PatchCoordinator::with_config(PatchConfig::in_memory());
        let mut image = host();

        coordinator.apply_all(&mut image, &[tick_hook()]).unwrap();
        assert!(recorded_ids(&image).is_empty());
        assert!(coordinator.is_applied(&image, tick_hook().identity()));

        let report = coordinator.apply_all(&mut image, &[tick_hook()]).unwrap();
        assert_eq!(report.skipped[0].reason, SkipReason::AlreadyApplied);
        assert_eq!(image.find_method("Game.Player", "Tick").unwrap().body.as_ref().unwrap().code.len(), 3);
    }

    #[test]
    fn existing_field_is_skipped_or_failed() {
        let mut image = host();
        inject_field(&mut image, "Game.Player", "shield", TypeDescriptor::int32(), false, None).unwrap();
        inject_field(&mut image, "Game.Player", "armor", TypeDescriptor::boolean(), false, None).unwrap();

        let armor = PatchDescriptor::inject_field(
            "armor",
            "Game.Player",
            FieldSpec::new("armor", TypeDescriptor::int32()),
        );
        let report = PatchCoordinator::new()
            .apply_all(&mut image, &[shield(), armor])
            .unwrap();

        assert_eq!(report.skipped[0].reason, SkipReason::FieldPresent);
        assert!(matches!(
            report.failed[0].reason,
            FailureReason::Error(Error::FieldNameCollision { .. })
        ));
    }

    #[test]
    fn resolution_failures_do_not_stop_the_pass() {
        let missing = PatchDescriptor::inject_field(
            "missing",
            "Game.Enemy",
            FieldSpec::new("hp", TypeDescriptor::int32()),
        );
        let no_match = PatchDescriptor::instruction_patch(
            "no-match",
            "Game.Player",
            "Tick",
            Pattern::new().then(OpcodeMatcher::new("dup")),
            PatchAction::InsertBefore(vec![Instruction::simple("nop").unwrap().into()]),
        );

        let mut image = host();
        let report = PatchCoordinator::new()
            .apply_all(&mut image, &[missing.clone(), no_match.clone(), shield()])
            .unwrap();
        assert_eq!(report.failed.len(), 2);
        assert!(matches!(report.failed[1].reason, FailureReason::PatternNotFound));
        assert_eq!(report.applied.len(), 1);
        // no member reference was added for the unmatched patch
        assert!(image.member_refs().is_empty());

        let mut image = host();
        let report = PatchCoordinator::with_config(PatchConfig::strict())
            .apply_all(&mut image, &[missing, shield()])
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.applied.is_empty());
    }

    #[test]
    fn aborted_pass_leaves_in_memory_ledger_alone() {
        let broken = PatchDescriptor::instruction_patch(
            "broken",
            "Game.Player",
            "Tick",
            Pattern::new().then(OpcodeMatcher::new("ret")),
            PatchAction::InsertBefore(vec![Instruction::ldc_i4(1).unwrap().into()]),
        );
        let mut coordinator = PatchCoordinator::with_config(PatchConfig::in_memory());

        let mut image = host();
        assert!(coordinator.apply_all(&mut image, &[shield(), broken]).is_err());
        assert!(!coordinator.is_applied(&host(), shield().identity()));

        let mut image = host();
        let report = coordinator.apply_all(&mut image, &[shield()]).unwrap();
        assert_eq!(report.applied.len(), 1);
    }

    #[test]
    fn duplicate_descriptor_in_one_pass_is_skipped() {
        let mut image = host();
        let report = PatchCoordinator::with_config(PatchConfig::in_memory())
            .apply_all(&mut image, &[tick_hook(), tick_hook()])
            .unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.skipped[0].reason, SkipReason::AlreadyApplied);
    }

    #[test]
    fn invalid_stream_aborts() {
        let broken = PatchDescriptor::instruction_patch(
            "broken",
            "Game.Player",
            "Tick",
            Pattern::new().then(OpcodeMatcher::new("ret")),
            PatchAction::InsertBefore(vec![Instruction::ldc_i4(1).unwrap().into()]),
        );
        let mut image = host();
        let result = PatchCoordinator::new().apply_all(&mut image, &[broken]);
        assert!(matches!(result, Err(Error::InvalidInstructionStream { .. })));
        assert_eq!(image.find_method("Game.Player", "Tick").unwrap().body.as_ref().unwrap().code.len(), 2);
    }
}
