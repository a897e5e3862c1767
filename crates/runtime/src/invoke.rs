//! The host-facing call boundary (§4.9): validates a call's argument
//! shape, marshals `Value`s through the uniform untagged-value ABI,
//! wraps the call so hardware/panic faults surface as [`Trap`]s, and
//! unmarshals the results.
//!
//! Grounded on the original's invoke-thunk cache: per-type thunks (here,
//! the marshalling logic in `value.rs`, since this crate has no compiler
//! emitting per-type native thunks) are stable and reused across calls,
//! so [`ThunkCache`] only exists to make that reuse visible to callers
//! that care (tests, and any future compiler integration that wants to
//! avoid redundant codegen for a type it has already seen).

use std::collections::HashSet;
use std::sync::Mutex;

use rt_environ::FunctionTypeEncoding;
use smallvec::SmallVec;

use crate::context::Context;
use crate::error::{RuntimeError, RuntimeResult, Trap};
use crate::exception::{catch_runtime_exceptions, pop_call_frame, push_call_frame};
use crate::function::Function;
use crate::value::Value;

/// Tracks which function-type encodings an invoke thunk has already been
/// produced for. With no compiler in this crate to actually generate
/// per-type machine code, membership here is purely informational (it
/// never gates whether a call can proceed); a real compiler-backed
/// loader would consult it before emitting a new thunk.
#[derive(Default)]
pub struct ThunkCache {
    seen: Mutex<HashSet<FunctionTypeEncoding>>,
}

impl ThunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that an invoke thunk for `encoding` now exists, returning
    /// whether this was the first time.
    pub fn record(&self, encoding: FunctionTypeEncoding) -> bool {
        self.seen.lock().unwrap().insert(encoding)
    }
}

/// Calls `function` with `args`, validating arity up front and wrapping
/// the call so a hardware fault or host-intrinsic panic comes back as a
/// [`Trap`] rather than unwinding past this boundary.
pub fn invoke_function(context: &Context, function: &Function, args: &[Value]) -> Result<Vec<Value>, Trap> {
    if args.len() != function.ty.params.len() {
        log::warn!(
            "invoke_function arity mismatch for {}: expected {}, got {}",
            function.debug_name(),
            function.ty.params.len(),
            args.len()
        );
        return Err(Trap::InvokeSignatureMismatch {
            expected_arity: function.ty.params.len(),
            actual_arity: args.len(),
        });
    }

    let raw_args: SmallVec<[crate::vmcontext::UntaggedValue; 4]> = args.iter().map(Value::encode).collect();

    push_call_frame(function.debug_name());
    let raw_results = catch_runtime_exceptions(|| function.call_raw(context, &raw_args));
    pop_call_frame();
    let raw_results = raw_results?;

    let results = function
        .ty
        .results
        .iter()
        .zip(raw_results.into_iter())
        .map(|(ty, raw)| unsafe { Value::decode(raw, *ty) })
        .collect();
    Ok(results)
}

/// Embedder-facing wrapper that also translates setup-time errors
/// (function not found, compartment mismatch) into the same `anyhow`
/// surface the rest of the public API uses.
pub fn invoke_function_checked(context: &Context, function: &Function, args: &[Value]) -> anyhow::Result<Vec<Value>> {
    if !std::ptr::eq(
        context.compartment.as_ref() as *const _,
        function
            .header
            .compartment
            .upgrade()
            .ok_or_else(|| RuntimeError::ObjectNotInCompartment)?
            .as_ref() as *const _,
    ) {
        return Err(RuntimeError::ObjectNotInCompartment.into());
    }
    Ok(invoke_function(context, function, args)?)
}
