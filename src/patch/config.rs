//! Patch pass configuration.

/// Controls how [`crate::patch::PatchCoordinator`] runs a pass.
///
/// # Presets
///
/// | Setting | `default` / `lenient` | `strict` | `in_memory` |
/// |---------|-----------------------|----------|-------------|
/// | `record_ledger` | true | true | false |
/// | `stop_on_failure` | false | true | false |
/// | `write_on_failure` | true | false | true |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct PatchConfig {
    /// Record applied descriptors as marker fields on the ledger type inside the image,
    /// so a later pass over the written module recognises them.
    ///
    /// Without it only the coordinator's in-memory ledger remembers applied patches.
    pub record_ledger: bool,

    /// Stop applying further descriptors after the first failed one.
    pub stop_on_failure: bool,

    /// Write the module back even if some descriptors failed to resolve.
    ///
    /// Verification failures never write, regardless of this setting.
    pub write_on_failure: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            record_ledger: true,
            stop_on_failure: false,
            write_on_failure: true,
        }
    }
}

impl PatchConfig {
    /// Apply what resolves, skip the rest.
    #[must_use]
    pub fn lenient() -> Self {
        Self::default()
    }

    /// All descriptors must apply or the module is not written.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            record_ledger: true,
            stop_on_failure: true,
            write_on_failure: false,
        }
    }

    /// Leave no ledger marks in the image; for load-time patching of modules that are
    /// never written back.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            record_ledger: false,
            ..Self::default()
        }
    }
}
