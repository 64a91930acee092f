//! Method attribute flags (ECMA-335 §II.23.1.10).

use bitflags::bitflags;

/// Bitmask for member access extraction
pub const METHOD_ACCESS_MASK: u16 = 0x0007;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Method attributes stored with every method definition
    pub struct MethodAttributes: u16 {
        /// Accessible only within the declaring type
        const PRIVATE = 0x0001;
        /// Accessible within the module
        const ASSEM = 0x0003;
        /// Accessible to anyone
        const PUBLIC = 0x0006;
        /// Defined on the type, no `this` argument
        const STATIC = 0x0010;
        /// Cannot be overridden
        const FINAL = 0x0020;
        /// Dispatched through the vtable
        const VIRTUAL = 0x0040;
        /// Hidden by name and signature
        const HIDE_BY_SIG = 0x0080;
        /// Name has special meaning to tools (`.ctor`, property accessors)
        const SPECIAL_NAME = 0x0800;
        /// Name has special meaning to the runtime
        const RT_SPECIAL_NAME = 0x1000;
    }
}

impl MethodAttributes {
    /// Access bits of these flags.
    #[must_use]
    pub fn access(self) -> u16 {
        self.bits() & METHOD_ACCESS_MASK
    }

    /// Flags for an instance constructor.
    #[must_use]
    pub fn constructor() -> Self {
        MethodAttributes::PUBLIC
            | MethodAttributes::HIDE_BY_SIG
            | MethodAttributes::SPECIAL_NAME
            | MethodAttributes::RT_SPECIAL_NAME
    }
}
