//! Execution limits for the runtime host.
//!
//! [`RuntimeLimits`] bounds every [`crate::runtime::Runtime::invoke`] call. Patched code
//! comes from a module the patch author does not control, so a body that loops or
//! recurses forever must end in [`crate::Error::LimitExceeded`] rather than hang the
//! host.
//!
//! # Examples
//!
//! ```rust
//! use cilsplice::runtime::RuntimeLimits;
//!
//! let limits = RuntimeLimits::new()
//!     .with_max_instructions(50_000)
//!     .with_max_call_depth(64);
//! assert_eq!(limits.max_call_depth, 64);
//!
//! // Presets
//! let strict = RuntimeLimits::strict();
//! assert!(strict.max_instructions < RuntimeLimits::default().max_instructions);
//! ```

/// Limits enforced by the interpreter.
///
/// # Default Values
///
/// | Limit | Default Value |
/// |-------|---------------|
/// | `max_instructions` | 10,000,000 |
/// | `max_call_depth` | 1,000 |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// Maximum instructions executed by one invocation.
    ///
    /// Set to 0 for unlimited execution.
    pub max_instructions: u64,

    /// Maximum nesting of managed calls.
    ///
    /// Native calls do not count towards this limit.
    pub max_call_depth: usize,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        RuntimeLimits {
            max_instructions: 10_000_000,
            max_call_depth: 1_000,
        }
    }
}

impl RuntimeLimits {
    /// Creates limits with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tight limits for running untrusted or freshly patched code in tests.
    #[must_use]
    pub fn strict() -> Self {
        RuntimeLimits {
            max_instructions: 1_000_000,
            max_call_depth: 128,
        }
    }

    /// No instruction limit and a deep call stack.
    #[must_use]
    pub fn lenient() -> Self {
        RuntimeLimits {
            max_instructions: 0,
            max_call_depth: 10_000,
        }
    }

    /// Sets the maximum instruction count (0 for unlimited).
    #[must_use]
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }

    /// Sets the maximum call depth.
    #[must_use]
    pub fn with_max_call_depth(mut self, max: usize) -> Self {
        self.max_call_depth = max;
        self
    }

    pub(crate) fn instructions_exceeded(&self, executed: u64) -> bool {
        self.max_instructions != 0 && executed > self.max_instructions
    }
}
