//! Error types. `RuntimeError` covers embedder-facing setup mistakes
//! (bad imports, quota denial, malformed JIT objects); `Trap` is the
//! value carried across the invoke boundary when executing Wasm code
//! fails (§4.6/§6.4).

use std::fmt;
use std::sync::Arc;

use rt_environ::{ExternDescriptor, FunctionTypeEncoding};

use crate::exception::ExceptionType;

/// Errors raised while setting up the runtime object graph: creating
/// compartments/memories/tables, instantiating modules, loading JIT
/// objects. Never raised while a Wasm function is executing — that's a
/// [`Trap`].
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("resource quota exceeded for {resource}: requested {requested}, available {available}")]
    QuotaExceeded {
        resource: &'static str,
        requested: u64,
        available: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("import `{module}.{name}` expected {expected:?}, found a different type")]
    ImportTypeMismatch {
        module: String,
        name: String,
        expected: ExternDescriptor,
    },

    #[error("duplicate export name `{0}`")]
    DuplicateId(String),

    #[error("object does not belong to this compartment")]
    ObjectNotInCompartment,

    #[error("missing import `{module}.{name}`")]
    MissingImport { module: String, name: String },

    #[error("malformed JIT object: {0}")]
    MalformedJitObject(String),

    #[error("undefined symbol `{0}` in JIT object")]
    UndefinedSymbol(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// The reason a Wasm computation stopped abnormally. Produced either by
/// an explicit trap intrinsic (`unreachable`, bounds checks emitted by
/// the compiler) or by [`crate::exception::catch_runtime_exceptions`]
/// translating a hardware fault or host panic. Cheap to clone: carried
/// by value up through every `invoke_*` return path.
#[derive(Clone, Debug)]
pub enum Trap {
    Unreachable,
    OutOfBoundsMemoryAccess { memory_name: Arc<str>, address: u64 },
    OutOfBoundsTableAccess { table_name: Arc<str>, index: u64 },
    OutOfBoundsDataSegmentAccess { instance_name: Arc<str>, segment_index: u32, size: u64 },
    OutOfBoundsElemSegmentAccess { instance_name: Arc<str>, segment_index: u32, index: u64 },
    UninitializedTableElement { table_name: Arc<str>, index: u64 },
    IndirectCallSignatureMismatch {
        expected: FunctionTypeEncoding,
        actual: FunctionTypeEncoding,
    },
    /// `invokeFunction` was asked to run a function with an argument list
    /// that doesn't match its declared arity (§4.9 step 1). Distinct from
    /// [`Trap::IndirectCallSignatureMismatch`], which is a `call_indirect`
    /// callee-type mismatch rather than a host-invoke arity mismatch.
    InvokeSignatureMismatch { expected_arity: usize, actual_arity: usize },
    IntegerDivideByZeroOrOverflow,
    InvalidFloatToIntConversion,
    StackOverflow,
    /// A `memory.grow`/`table.grow` called from compiled code that was
    /// asked to go past its declared maximum (the intrinsic itself
    /// returns `-1` to Wasm; this variant exists for host-level APIs
    /// that choose to trap on it instead).
    OutOfMemory,
    /// A user-defined exception (Wasm exception-handling `throw`) that
    /// propagated past the outermost `invoke` boundary uncaught, with the
    /// call stack captured at the point it was thrown (§3 Data Model).
    UncaughtException {
        ty: Arc<ExceptionType>,
        arguments: Vec<crate::vmcontext::UntaggedValue>,
        call_stack: Vec<String>,
    },
    /// A signal (SIGSEGV/SIGFPE/SIGILL on unix, the matching vectored
    /// exception on windows) caught by
    /// [`crate::exception::catch_runtime_exceptions`] that didn't
    /// match any of the above and is re-raised as a generic trap.
    Signal(&'static str),
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::Unreachable => write!(f, "unreachable instruction executed"),
            Trap::OutOfBoundsMemoryAccess { memory_name, address } => {
                write!(f, "out of bounds memory access: {memory_name} at address {address:#x}")
            }
            Trap::OutOfBoundsTableAccess { table_name, index } => {
                write!(f, "out of bounds table access: {table_name} at index {index}")
            }
            Trap::OutOfBoundsDataSegmentAccess { instance_name, segment_index, size } => {
                write!(f, "out of bounds data segment access: {instance_name} segment {segment_index} (size {size})")
            }
            Trap::OutOfBoundsElemSegmentAccess { instance_name, segment_index, index } => {
                write!(f, "out of bounds element segment access: {instance_name} segment {segment_index}[{index}]")
            }
            Trap::UninitializedTableElement { table_name, index } => {
                write!(f, "uninitialized table element: {table_name}[{index}]")
            }
            Trap::IndirectCallSignatureMismatch { expected, actual } => write!(
                f,
                "indirect call signature mismatch: expected {:?}, found {:?}",
                expected.0, actual.0
            ),
            Trap::InvokeSignatureMismatch { expected_arity, actual_arity } => write!(
                f,
                "invoke signature mismatch: expected {expected_arity} argument(s), got {actual_arity}"
            ),
            Trap::IntegerDivideByZeroOrOverflow => write!(f, "integer divide by zero or overflow"),
            Trap::InvalidFloatToIntConversion => write!(f, "invalid conversion to integer"),
            Trap::StackOverflow => write!(f, "call stack exhausted"),
            Trap::OutOfMemory => write!(f, "out of memory"),
            Trap::UncaughtException { ty, .. } => write!(f, "uncaught exception: {}", ty.header.debug_name),
            Trap::Signal(name) => write!(f, "runtime trap ({name})"),
        }
    }
}

impl std::error::Error for Trap {}
