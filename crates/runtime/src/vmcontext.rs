//! Fixed layout shared with compiled code: `CompartmentRuntimeData`,
//! `ContextRuntimeData`, and the untagged value representation used for
//! globals and thunk argument/result marshalling.
//!
//! Grounded directly on `Include/WAVM/Runtime/RuntimeData.h`: a
//! compartment owns one power-of-two-aligned reservation so that
//! `context_ptr & !(alignment - 1)` recovers the compartment base from
//! any context pointer handed to compiled code.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of bytes `ContextRuntimeData` reserves for thunk argument and
/// return marshalling ahead of the mutable-globals array. Matches the
/// original's `maxThunkArgAndReturnBytes`.
pub const MAX_THUNK_ARG_AND_RETURN_BYTES: usize = 256;

/// Total size of one `ContextRuntimeData`, page-aligned so an array of
/// them can be packed densely inside the compartment reservation.
pub const CONTEXT_RUNTIME_DATA_SIZE: usize = 4096;

/// Size of the back-pointer to the owning [`crate::context::Context`]
/// that §3/§6.2 place between the thunk scratch area and
/// `mutable_globals`.
pub const CONTEXT_BACK_POINTER_BYTES: usize = 8;

pub const MAX_GLOBAL_BYTES: usize = CONTEXT_RUNTIME_DATA_SIZE - MAX_THUNK_ARG_AND_RETURN_BYTES - CONTEXT_BACK_POINTER_BYTES;

/// `MAX_GLOBAL_BYTES` isn't an exact multiple of `sizeof(UntaggedValue)`
/// (3832 / 16 = 239.5); the remainder pads the struct back out to
/// [`CONTEXT_RUNTIME_DATA_SIZE`] so the static size assertion holds.
pub const MAX_MUTABLE_GLOBALS: usize = MAX_GLOBAL_BYTES / size_of::<UntaggedValue>();
const GLOBALS_PADDING_BYTES: usize = MAX_GLOBAL_BYTES - MAX_MUTABLE_GLOBALS * size_of::<UntaggedValue>();

/// A 16-byte untagged value slot: the representation used for mutable
/// global storage and thunk argument/result marshalling (§6.2). Byte
/// based rather than a Rust union so that accessors stay entirely safe.
#[derive(Clone, Copy)]
pub struct UntaggedValue(pub [u8; 16]);

impl UntaggedValue {
    pub const ZERO: UntaggedValue = UntaggedValue([0; 16]);

    pub fn from_i32(v: i32) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&v.to_ne_bytes());
        UntaggedValue(bytes)
    }
    pub fn from_i64(v: i64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&v.to_ne_bytes());
        UntaggedValue(bytes)
    }
    pub fn from_f32(v: f32) -> Self {
        Self::from_i32(v.to_bits() as i32)
    }
    pub fn from_f64(v: f64) -> Self {
        Self::from_i64(v.to_bits() as i64)
    }
    pub fn from_v128(v: [u8; 16]) -> Self {
        UntaggedValue(v)
    }

    pub fn as_i32(&self) -> i32 {
        i32::from_ne_bytes(self.0[..4].try_into().unwrap())
    }
    pub fn as_i64(&self) -> i64 {
        i64::from_ne_bytes(self.0[..8].try_into().unwrap())
    }
    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.as_i32() as u32)
    }
    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.as_i64() as u64)
    }
    pub fn as_v128(&self) -> [u8; 16] {
        self.0
    }
}

impl std::fmt::Debug for UntaggedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UntaggedValue({:x?})", self.0)
    }
}

/// An atomic mutable-global slot. Real globals are narrower (i32/i64/f32/
/// f64/v128/funcref/externref) but are always stored in one 16-byte slot;
/// we back it with two `AtomicU64` halves so cross-thread `global.set`
/// visibility matches the acquire/release discipline used for memory and
/// table growth.
#[derive(Default)]
pub struct AtomicGlobalSlot {
    lo: AtomicU64,
    hi: AtomicU64,
}

impl AtomicGlobalSlot {
    pub fn load(&self) -> UntaggedValue {
        let lo = self.lo.load(Ordering::Acquire);
        let hi = self.hi.load(Ordering::Acquire);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&lo.to_ne_bytes());
        bytes[8..].copy_from_slice(&hi.to_ne_bytes());
        UntaggedValue(bytes)
    }

    pub fn store(&self, value: UntaggedValue) {
        let lo = u64::from_ne_bytes(value.0[..8].try_into().unwrap());
        let hi = u64::from_ne_bytes(value.0[8..].try_into().unwrap());
        self.lo.store(lo, Ordering::Release);
        self.hi.store(hi, Ordering::Release);
    }
}

/// Per-context scratch space compiled code addresses directly: thunk
/// argument/return bytes, a back-pointer to the owning Context, then the
/// dense mutable-globals array. Exactly [`CONTEXT_RUNTIME_DATA_SIZE`]
/// bytes, matching the original's static assertion.
#[repr(C, align(4096))]
pub struct ContextRuntimeData {
    pub thunk_arg_and_return_data: [u8; MAX_THUNK_ARG_AND_RETURN_BYTES],
    context_back_pointer: AtomicU64,
    pub mutable_globals: [AtomicGlobalSlot; MAX_MUTABLE_GLOBALS],
    _reserved: [u8; GLOBALS_PADDING_BYTES],
}

impl ContextRuntimeData {
    pub const MAX_MUTABLE_GLOBALS: usize = MAX_MUTABLE_GLOBALS;

    pub fn new() -> Box<Self> {
        Box::new(ContextRuntimeData {
            thunk_arg_and_return_data: [0; MAX_THUNK_ARG_AND_RETURN_BYTES],
            context_back_pointer: AtomicU64::new(0),
            mutable_globals: std::array::from_fn(|_| AtomicGlobalSlot::default()),
            _reserved: [0; GLOBALS_PADDING_BYTES],
        })
    }

    /// Stores the address of the owning [`crate::context::Context`],
    /// mirroring the original's `ContextRuntimeData::context` field so
    /// the mask-to-base idiom (`compartment_base_of`) has a documented
    /// counterpart for recovering the Context itself, not just the
    /// compartment.
    pub fn set_context_back_pointer(&self, context: *const ()) {
        self.context_back_pointer.store(context as u64, Ordering::Release);
    }

    pub fn context_back_pointer(&self) -> *const () {
        self.context_back_pointer.load(Ordering::Acquire) as *const ()
    }
}

const _: () = assert!(size_of::<ContextRuntimeData>() == CONTEXT_RUNTIME_DATA_SIZE);

/// Mask applied to a context pointer to recover its owning compartment's
/// reservation base, given the compartment's configured alignment.
pub fn compartment_base_of(context_ptr: *const ContextRuntimeData, alignment_log2: u32) -> *const u8 {
    let mask = !((1u64 << alignment_log2) - 1);
    (context_ptr as u64 & mask) as *const u8
}
