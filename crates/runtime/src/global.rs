//! Module-level globals.
//!
//! Grounded on `RuntimePrivate.h`'s `Global : GCObject { type,
//! mutableGlobalIndex }`: a `Global` is a thin handle onto a slot of
//! `ContextRuntimeData::mutable_globals`, not a value holder itself.
//!
//! Simplification from the original: WAVM gives immutable globals no
//! slot at all (their value is baked into compiled code as a constant),
//! since this crate has no compiler to do that inlining every global —
//! mutable or not — occupies a slot, keeping a single storage path and
//! a 1:1 mapping between a module's global index space and its slot
//! numbers (`instance.rs` relies on this when binding `global<N>`
//! symbols). `ty.mutable` still gates whether `set_value` is reachable
//! from Wasm code.
use std::sync::Arc;

use rt_environ::GlobalType;

use crate::compartment::Compartment;
use crate::context::Context;
use crate::error::RuntimeResult;
use crate::object::{GcHeader, ObjectKind};
use crate::vmcontext::UntaggedValue;

pub struct Global {
    pub header: GcHeader,
    pub ty: GlobalType,
    slot: u32,
}

impl Global {
    pub fn create(
        compartment: &Arc<Compartment>,
        ty: GlobalType,
        initial_value: UntaggedValue,
        debug_name: impl Into<String>,
    ) -> RuntimeResult<Arc<Global>> {
        let header = GcHeader::new(ObjectKind::Global, compartment, debug_name);
        let slot = compartment.alloc_mutable_global_slot(initial_value)?;
        let global = Arc::new(Global { header, ty, slot });
        compartment.register_global(global.clone())?;
        Ok(global)
    }

    pub fn is_mutable(&self) -> bool {
        self.ty.mutable
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn get_value(&self, context: &Context) -> UntaggedValue {
        context.load_global(self.slot)
    }

    /// Panics (a host programming error, not a trap) if called on an
    /// immutable global; callers validate mutability against `self.ty`
    /// before reaching here, mirroring the original's debug-only assert.
    pub fn set_value(&self, context: &Context, value: UntaggedValue) {
        debug_assert!(self.ty.mutable, "attempted to set an immutable global");
        context.store_global(self.slot, value);
    }

    /// Grounded on `cloneGlobal`: a fresh `Global` in `compartment`
    /// seeded with `value` (the caller reads it from whichever `Context`
    /// it wants to snapshot, since a global's "current" value is only
    /// meaningful relative to one).
    pub fn clone_into(&self, compartment: &Arc<Compartment>, value: UntaggedValue) -> RuntimeResult<Arc<Global>> {
        Global::create(compartment, self.ty, value, self.header.debug_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use rt_environ::ValType;

    #[test]
    fn distinct_globals_get_distinct_slots() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let ty = GlobalType { content: ValType::I32, mutable: true };
        let a = Global::create(&compartment, ty, UntaggedValue::from_i32(1), "a").unwrap();
        let b = Global::create(&compartment, ty, UntaggedValue::from_i32(2), "b").unwrap();
        assert_ne!(a.slot(), b.slot());
    }

    #[test]
    fn set_and_get_round_trip_through_a_context() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let ty = GlobalType { content: ValType::I64, mutable: true };
        let global = Global::create(&compartment, ty, UntaggedValue::from_i64(0), "g").unwrap();
        let context = Context::create(&compartment).unwrap();
        global.set_value(&context, UntaggedValue::from_i64(-5));
        assert_eq!(global.get_value(&context).as_i64(), -5);
    }

    #[test]
    fn immutable_global_reports_its_mutability() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let ty = GlobalType { content: ValType::F64, mutable: false };
        let global = Global::create(&compartment, ty, UntaggedValue::from_f64(1.5), "g").unwrap();
        assert!(!global.is_mutable());
    }
}
