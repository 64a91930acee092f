use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! execution_error {
    ($fmt:expr $(, $arg:expr)* $(,)?) => {
        crate::Error::Execution(format!($fmt $(, $arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into four groups, matching the stages a module goes through:
///
/// ## Image parsing and serialization
/// - [`Error::Malformed`] - Corrupted or invalid image structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of the input
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// ## Patch target resolution
/// - [`Error::TypeNotFound`] - The target type is absent from this build of the module
/// - [`Error::MethodNotFound`] - The target method is absent from this build of the module
/// - [`Error::FieldNameCollision`] - The field to inject already exists
/// - [`Error::LayoutMismatch`] - Explicit offset requested on a type without explicit layout
///
/// ## Instruction streams
/// - [`Error::InvalidInstructionStream`] - Post-patch verification failed (hard failure)
/// - [`Error::InvalidMnemonic`], [`Error::WrongOperandType`], [`Error::UnexpectedOperand`]
/// - [`Error::UndefinedLabel`], [`Error::InvalidBranch`]
///
/// ## Runtime host and capability slots
/// - [`Error::CapabilityMissing`] - A capability slot refers to storage that was never injected
/// - [`Error::SlotTypeMismatch`] - A capability slot was bound with an incompatible Rust type
/// - [`Error::ModuleNotLoaded`] - No module of that name was loaded into the runtime
/// - [`Error::NativeNotFound`] - A member reference has no native implementation registered
/// - [`Error::Execution`] - The interpreter hit an invalid state
/// - [`Error::LimitExceeded`] - Execution exceeded the configured [`crate::runtime::RuntimeLimits`]
/// - [`Error::LockError`] - Object storage lock was poisoned
///
/// Resolution errors are expected whenever the host module's version diverges from what a
/// patch assumes. The [`crate::patch::PatchCoordinator`] records them in its report instead of
/// propagating them; only [`Error::InvalidInstructionStream`] aborts a patch pass.
///
/// # Examples
///
/// ```rust,no_run
/// use cilsplice::{Error, metadata::image::AssemblyImage};
/// use std::path::Path;
///
/// match AssemblyImage::from_file(Path::new("Host.img")) {
///     Ok(image) => println!("Loaded {} types", image.types().len()),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed image: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The image is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected
    /// for debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the input.
    #[error("Out of Bound read would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The requested type does not exist in the image.
    ///
    /// This is the dominant real-world failure mode: the host module changes shape
    /// between versions and a patch still names the old type.
    #[error("Type not found in image - {0}")]
    TypeNotFound(String),

    /// The requested method does not exist on the target type.
    #[error("Method not found - {type_name}::{method}")]
    MethodNotFound {
        /// Full name of the type that was searched
        type_name: String,
        /// Name of the missing method
        method: String,
    },

    /// The target type already declares a field with this name.
    #[error("Field '{field}' already exists on {type_name}")]
    FieldNameCollision {
        /// Full name of the target type
        type_name: String,
        /// The colliding field name
        field: String,
        /// Token of the field that is already present
        existing: Token,
    },

    /// An explicit offset was requested on a type that does not use an explicit or
    /// sequential layout.
    #[error("Type {0} does not use explicit or sequential layout")]
    LayoutMismatch(String),

    /// A method body failed verification after a patch was applied.
    ///
    /// This is the one hard failure of the patch pipeline: a corrupted method body
    /// can crash the host long after the fact, so the write-back of the affected image
    /// is aborted instead.
    #[error("Invalid instruction stream in {method}: {reason}")]
    InvalidInstructionStream {
        /// Name of the method whose body failed verification
        method: String,
        /// Description of the first violation found
        reason: String,
    },

    /// The mnemonic does not name a supported instruction.
    #[error("Invalid instruction mnemonic - {0}")]
    InvalidMnemonic(String),

    /// The operand provided does not match the instruction's operand type.
    #[error("Wrong operand type - expected {expected}")]
    WrongOperandType {
        /// Description of the operand the instruction expects
        expected: String,
    },

    /// An operand was provided for an instruction that takes none.
    #[error("Unexpected operand provided for instruction that takes no operand")]
    UnexpectedOperand,

    /// A branch references a label that was never placed.
    #[error("Undefined label referenced - {0}")]
    UndefinedLabel(u32),

    /// A branch could not be encoded or decoded.
    #[error("Invalid branch - {0}")]
    InvalidBranch(String),

    /// A capability slot refers to a field that does not exist in the loaded layout.
    #[error("Capability {type_name}.{field} is not present - was the module patched?")]
    CapabilityMissing {
        /// Full name of the owning type
        type_name: String,
        /// Name of the missing field
        field: String,
    },

    /// A capability slot was bound with a Rust type that cannot represent the field type.
    #[error("Capability {field} has type {actual}, which cannot be accessed as {requested}")]
    SlotTypeMismatch {
        /// Name of the field
        field: String,
        /// Declared type of the field
        actual: String,
        /// Name of the Rust type the slot was bound with
        requested: &'static str,
    },

    /// The runtime has no module of this name.
    #[error("Module not loaded - {0}")]
    ModuleNotLoaded(String),

    /// No native implementation is registered for a member reference.
    #[error("No native implementation registered for {0}")]
    NativeNotFound(String),

    /// The interpreter encountered an invalid state.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Execution exceeded a configured limit.
    #[error("Execution limit exceeded: {0}")]
    LimitExceeded(String),

    /// Failed to lock target.
    ///
    /// This error occurs when a lock guarding object storage was poisoned by a
    /// panicking writer.
    #[error("Failed to lock target")]
    LockError,
}
