//! Callable objects: both Wasm-defined functions loaded from a JIT
//! module and host/intrinsic functions share one `Function` type so
//! tables, `call_indirect`, and imports don't need to distinguish them.
//!
//! Grounded on `RuntimeData.h`'s `FunctionInstance`/`FunctionMutableData`
//! pair (an immutable header plus a pointer to compiler-owned debug
//! metadata) and on the uniform "array of untagged values in, array of
//! untagged values out" calling convention implied by §4.9's invoke
//! thunk signature — which doubles here as the ABI native Wasm code is
//! expected to export, since this crate has no compiler of its own to
//! pick a register-based convention instead.

use std::sync::Arc;

use rt_environ::{FunctionType, FunctionTypeEncoding};
use smallvec::SmallVec;

use crate::context::Context;
use crate::error::Trap;
use crate::jit::loader::JitModule;
use crate::object::{GcHeader, ObjectKind};
use crate::vmcontext::{ContextRuntimeData, UntaggedValue};

/// The native entry point signature every loaded Wasm function and every
/// thunk generated over it must share (§6.1's `functionDefMutableDatas`
/// binding implies the loader already knows each function's address;
/// this is the signature it's called through).
pub type RawEntry =
    unsafe extern "C" fn(ctx: *mut ContextRuntimeData, args: *const UntaggedValue, results: *mut UntaggedValue);

pub type NativeBody =
    dyn Fn(&Context, &[UntaggedValue]) -> Result<SmallVec<[UntaggedValue; 4]>, Trap> + Send + Sync;

pub enum FunctionBody {
    /// A function loaded from a JIT-compiled module: `jit_module` keeps
    /// the mapped code alive and `entry` is its address within it.
    Compiled { jit_module: Arc<JitModule>, entry: RawEntry },
    /// A host intrinsic or an import binding supplied directly as a Rust
    /// closure.
    Native(Arc<NativeBody>),
}

/// Mirrors the original's `FunctionMutableData`: the small amount of
/// per-function metadata that exists even though the function's code
/// itself is immutable once loaded.
pub struct FunctionMutableData {
    pub num_code_bytes: usize,
}

pub struct Function {
    pub header: GcHeader,
    pub ty: FunctionType,
    pub encoded_type: FunctionTypeEncoding,
    pub module_instance_id: Option<u32>,
    pub mutable_data: FunctionMutableData,
    body: FunctionBody,
}

impl Function {
    pub fn new_native(
        compartment: &Arc<crate::compartment::Compartment>,
        ty: FunctionType,
        debug_name: impl Into<String>,
        body: Arc<NativeBody>,
    ) -> Arc<Function> {
        let encoded_type = ty.encode();
        Arc::new(Function {
            header: GcHeader::new(ObjectKind::Function, compartment, debug_name),
            ty,
            encoded_type,
            module_instance_id: None,
            mutable_data: FunctionMutableData { num_code_bytes: 0 },
            body: FunctionBody::Native(body),
        })
    }

    pub fn new_compiled(
        compartment: &Arc<crate::compartment::Compartment>,
        ty: FunctionType,
        debug_name: impl Into<String>,
        module_instance_id: u32,
        jit_module: Arc<JitModule>,
        entry: RawEntry,
        num_code_bytes: usize,
    ) -> Arc<Function> {
        let encoded_type = ty.encode();
        Arc::new(Function {
            header: GcHeader::new(ObjectKind::Function, compartment, debug_name),
            ty,
            encoded_type,
            module_instance_id: Some(module_instance_id),
            mutable_data: FunctionMutableData { num_code_bytes },
            body: FunctionBody::Compiled { jit_module, entry },
        })
    }

    /// Invokes this function with already-marshalled argument values,
    /// producing its results or a trap. Called by [`crate::invoke::invoke_function`]
    /// after argument-count/type validation; `Function` itself trusts its
    /// caller to have checked `args.len()`/types against `self.ty`.
    pub(crate) fn call_raw(&self, context: &Context, args: &[UntaggedValue]) -> Result<SmallVec<[UntaggedValue; 4]>, Trap> {
        match &self.body {
            FunctionBody::Native(f) => f(context, args),
            FunctionBody::Compiled { entry, .. } => {
                let mut scratch = [UntaggedValue::ZERO; 16];
                let num_results = self.ty.results.len();
                debug_assert!(num_results <= scratch.len());
                unsafe {
                    (entry)(context.runtime_data_ptr(), args.as_ptr(), scratch.as_mut_ptr());
                }
                Ok(scratch[..num_results].iter().copied().collect())
            }
        }
    }

    pub fn debug_name(&self) -> &str {
        &self.header.debug_name
    }
}
