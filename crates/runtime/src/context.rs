//! Per-thread execution state: a pointer compiled code treats as its
//! `vmctx`, backed by a slot inside the owning compartment's reservation
//! (§4.1, §4.9).
//!
//! Grounded on `RuntimePrivate.h`'s `Context` (an id plus a
//! `ContextRuntimeData*`) and `RuntimeData.h`'s requirement that every
//! context's mutable-globals array starts out as a copy of the
//! compartment's `initialContextMutableGlobals`.

use std::sync::Arc;

use crate::compartment::Compartment;
use crate::vmcontext::{ContextRuntimeData, UntaggedValue};

pub struct Context {
    pub id: u32,
    pub compartment: Arc<Compartment>,
    runtime_data: *mut ContextRuntimeData,
}

// `runtime_data` points into the compartment's own reservation, which
// outlives every `Context` created against it (the `Arc<Compartment>`
// field keeps it alive); safe to send/share like any other handle into
// that reservation.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    pub fn create(compartment: &Arc<Compartment>) -> crate::error::RuntimeResult<Arc<Context>> {
        let (id, runtime_data) = compartment.alloc_context_slot()?;
        let context = Arc::new(Context { id, compartment: compartment.clone(), runtime_data });
        context.runtime_data().set_context_back_pointer(Arc::as_ptr(&context) as *const ());
        context.reset_mutable_globals();
        compartment.register_context(id, context.clone());
        Ok(context)
    }

    /// A new context (and a cloned one, per `cloneContext`) starts every
    /// mutable global at the value the owning global had when it was
    /// created, exactly as the original copies
    /// `initialContextMutableGlobals`.
    fn reset_mutable_globals(&self) {
        for (slot, value) in self.compartment.all_initial_global_values().into_iter().enumerate() {
            self.runtime_data().mutable_globals[slot].store(value);
        }
    }

    pub fn clone_context(&self) -> crate::error::RuntimeResult<Arc<Context>> {
        let cloned = Context::create(&self.compartment)?;
        for slot in 0..ContextRuntimeData::MAX_MUTABLE_GLOBALS {
            let value = self.runtime_data().mutable_globals[slot].load();
            cloned.runtime_data().mutable_globals[slot].store(value);
        }
        Ok(cloned)
    }

    pub fn runtime_data(&self) -> &ContextRuntimeData {
        unsafe { &*self.runtime_data }
    }

    pub fn runtime_data_ptr(&self) -> *mut ContextRuntimeData {
        self.runtime_data
    }

    pub fn load_global(&self, slot: u32) -> UntaggedValue {
        self.runtime_data().mutable_globals[slot as usize].load()
    }

    pub fn store_global(&self, slot: u32, value: UntaggedValue) {
        self.runtime_data().mutable_globals[slot as usize].store(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::Global;
    use rt_environ::{GlobalType, ValType};

    #[test]
    fn new_context_seeds_globals_from_compartment_initial_values() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let ty = GlobalType { content: ValType::I32, mutable: true };
        let global = Global::create(&compartment, ty, UntaggedValue::from_i32(42), "g").unwrap();
        let context = Context::create(&compartment).unwrap();
        assert_eq!(global.get_value(&context).as_i32(), 42);
    }

    #[test]
    fn clone_context_copies_current_global_values_not_initial_ones() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let ty = GlobalType { content: ValType::I32, mutable: true };
        let global = Global::create(&compartment, ty, UntaggedValue::from_i32(1), "g").unwrap();
        let context = Context::create(&compartment).unwrap();
        global.set_value(&context, UntaggedValue::from_i32(7));
        let cloned = context.clone_context().unwrap();
        assert_eq!(global.get_value(&cloned).as_i32(), 7);
    }

    #[test]
    fn contexts_are_independent() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let ty = GlobalType { content: ValType::I32, mutable: true };
        let global = Global::create(&compartment, ty, UntaggedValue::from_i32(0), "g").unwrap();
        let a = Context::create(&compartment).unwrap();
        let b = Context::create(&compartment).unwrap();
        global.set_value(&a, UntaggedValue::from_i32(99));
        assert_eq!(global.get_value(&b).as_i32(), 0);
    }
}
