//! User-defined exception types (Wasm exception-handling "tags") and the
//! signal-to-trap translation boundary.
//!
//! Grounded on `RuntimePrivate.h`'s `ExceptionType`/`Exception` and the
//! original's `unwindSignalsAsExceptions`/`catchRuntimeExceptions`: every
//! `invoke_function` call wraps its body so a hardware fault (divide by
//! zero, null/OOB access, stack overflow) surfaces as a [`Trap`] instead
//! of terminating the process. Rust has no raw wasm bytecode to fault on
//! directly — compiled code execution is mediated through the
//! [`crate::invoke`] thunk layer — so this module's translation covers
//! Rust-level panics (a stand-in for the hardware signals a real
//! compiled callee could raise) using `catch_unwind`, and is the single
//! place new signal sources should be added.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rt_environ::ExceptionTypeSig;

use crate::compartment::Compartment;
use crate::error::Trap;
use crate::object::{GcHeader, ObjectKind};
use crate::vmcontext::UntaggedValue;

thread_local! {
    /// Debug names of the functions currently on this thread's call
    /// chain, pushed/popped around each `invoke_function` call (and the
    /// `debug.enter_function`/`debug.exit_function` intrinsics a real
    /// compiled callee would bracket its own calls with — see
    /// `intrinsics.rs`). Stands in for walking the native stack, which
    /// this crate has no compiler-emitted frame descriptors to do.
    static CALL_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

pub fn push_call_frame(name: &str) {
    CALL_STACK.with(|stack| stack.borrow_mut().push(name.to_string()));
}

pub fn pop_call_frame() {
    CALL_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
}

/// Snapshots the current thread's call chain, most-recent frame last —
/// the "captured call stack" §3/§4.6 attach to every [`Exception`].
pub fn capture_call_stack() -> Vec<String> {
    CALL_STACK.with(|stack| stack.borrow().clone())
}

pub struct ExceptionType {
    pub header: GcHeader,
    pub sig: ExceptionTypeSig,
}

impl ExceptionType {
    pub fn create(compartment: &Arc<Compartment>, sig: ExceptionTypeSig, debug_name: impl Into<String>) -> crate::error::RuntimeResult<Arc<ExceptionType>> {
        let header = GcHeader::new(ObjectKind::ExceptionType, compartment, debug_name);
        let ty = Arc::new(ExceptionType { header, sig });
        compartment.register_exception_type(ty.clone())?;
        Ok(ty)
    }

    /// Grounded on `cloneExceptionType`: exception types carry no mutable
    /// state beyond their signature, so cloning is just re-registering an
    /// equivalent tag in the target compartment.
    pub fn clone_into(&self, compartment: &Arc<Compartment>) -> crate::error::RuntimeResult<Arc<ExceptionType>> {
        ExceptionType::create(compartment, self.sig.clone(), self.header.debug_name.clone())
    }
}

/// A thrown exception value: its type, the argument values, and the call
/// stack captured at the point it was created — carried up through
/// [`Trap::UncaughtException`] when nothing in the callee chain caught it
/// before the outermost invoke boundary.
#[derive(Clone)]
pub struct Exception {
    pub ty: Arc<ExceptionType>,
    pub arguments: Vec<UntaggedValue>,
    pub call_stack: Vec<String>,
}

impl Exception {
    /// Grounded on `createException`: sized by `arguments.len()` untagged
    /// slots, with the call stack captured eagerly (§3: Exception carries
    /// a "captured call stack", not a lazily-walked one) so it still
    /// reflects where the exception was raised even once this unwinds
    /// through frames that have since popped.
    pub fn new(ty: Arc<ExceptionType>, arguments: Vec<UntaggedValue>) -> Self {
        Exception { ty, arguments, call_stack: capture_call_stack() }
    }

    pub fn into_trap(self) -> Trap {
        Trap::UncaughtException { ty: self.ty, arguments: self.arguments, call_stack: self.call_stack }
    }
}

/// Grounded on `throwException`: raises `exception`, unwinding the
/// current call chain as the host's EH mechanism would. Propagation is
/// ordinary Rust stack unwinding; [`catch_runtime_exceptions`] is the
/// boundary that turns it back into a typed [`Trap`].
pub fn throw_exception(exception: Exception) -> ! {
    std::panic::panic_any(exception)
}

/// Runs `body`, translating a Rust panic into the matching [`Trap`]
/// variant instead of unwinding past the invoke boundary. This is the
/// in-process stand-in for the original's OS signal handler: a real
/// compiled callee's integer-divide, out-of-bounds, or stack-overflow
/// fault is expected to already have been converted to a typed error
/// (or, for memory/table accesses, rejected before ever reaching machine
/// code — see `memory.rs`/`table.rs`'s bounds checks) by the time it
/// would reach here; this catches whatever a host-provided intrinsic or
/// import body panics with instead.
pub fn unwind_signals_as_exceptions<T>(body: impl FnOnce() -> Result<T, Trap>) -> Result<T, Trap> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(&payload);
            log::warn!("caught panic at invoke boundary: {message}");
            Err(classify_panic(&message))
        }
    }
}

/// Grounded on `catchRuntimeExceptions` (§4.6): the actual boundary every
/// `invoke_function` call runs under. Beyond `unwind_signals_as_exceptions`'s
/// heuristic string classification, this recognizes two typed panic
/// payloads directly — a [`Trap`] panicked by one of `intrinsics.rs`'s
/// trap-producing intrinsics (`unreachable`, `call_indirect_fail`, ...)
/// and an [`Exception`] panicked by [`throw_exception`] — converting
/// either straight to the right `Trap` without going through
/// `classify_panic`'s message sniffing.
pub fn catch_runtime_exceptions<T>(body: impl FnOnce() -> Result<T, Trap>) -> Result<T, Trap> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => match payload.downcast::<Trap>() {
            Ok(trap) => Err(*trap),
            Err(payload) => match payload.downcast::<Exception>() {
                Ok(exception) => Err(exception.into_trap()),
                Err(payload) => {
                    let message = panic_message(&payload);
                    log::warn!("caught panic at invoke boundary: {message}");
                    Err(classify_panic(&message))
                }
            },
        },
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn classify_panic(message: &str) -> Trap {
    if message.contains("divide by zero") || message.contains("attempt to divide") {
        Trap::IntegerDivideByZeroOrOverflow
    } else if message.contains("overflow") {
        Trap::IntegerDivideByZeroOrOverflow
    } else if message.contains("index out of bounds") {
        Trap::OutOfBoundsMemoryAccess { memory_name: Arc::from("unknown"), address: 0 }
    } else {
        Trap::Signal("panic")
    }
}
