//! Tables of function or external references.
//!
//! Grounded on `Lib/Runtime/Table.cpp`'s three-state element model: a
//! slot is either a value (`funcref`/`externref`, possibly null), or one
//! of two sentinels — *uninitialized* (never written) and *out of
//! bounds* (index past the current size). The original represents both
//! sentinels as special biased pointer values so a single unbiased
//! pointer compare tells them apart without a separate bounds check;
//! this crate has no compiler emitting code that walks raw table memory,
//! so elements are stored in a lock-guarded `Vec` instead (see the note
//! in `compartment.rs`), but the three-state read/write contract and the
//! traps it produces (`UninitializedTableElement` vs
//! `OutOfBoundsTableAccess`) are preserved exactly.

use std::sync::{Arc, RwLock};

use rt_environ::{FunctionTypeEncoding, RefType, TableType};

use crate::error::Trap;
use crate::function::Function;
use crate::object::{Foreign, GcHeader, ObjectKind};

/// A resolved table element: a null reference, a function, or an opaque
/// host object (what `externref` tables hold in this implementation's
/// simplified object model, see `object.rs`).
#[derive(Clone)]
pub enum TableElementRef {
    Null,
    Func(Arc<Function>),
    Extern(Arc<Foreign>),
}

impl TableElementRef {
    pub fn as_func(&self) -> Option<&Arc<Function>> {
        match self {
            TableElementRef::Func(f) => Some(f),
            _ => None,
        }
    }
}

#[derive(Clone)]
enum TableSlot {
    Uninitialized,
    Value(TableElementRef),
}

pub struct Table {
    pub header: GcHeader,
    pub ty: TableType,
    elements: RwLock<Vec<TableSlot>>,
    resource_quota: Arc<crate::resource_quota::ResourceQuota>,
}

impl Table {
    pub fn create(
        compartment: &Arc<crate::compartment::Compartment>,
        ty: TableType,
        debug_name: impl Into<String>,
    ) -> crate::error::RuntimeResult<Arc<Table>> {
        let header = GcHeader::new(ObjectKind::Table, compartment, debug_name);
        let table = Arc::new(Table {
            header,
            ty,
            elements: RwLock::new(Vec::new()),
            resource_quota: compartment.resource_quota.clone(),
        });
        // The element `Vec` reallocates on growth, so there is no stable
        // base pointer to publish; `register_table`'s base-pointer slot
        // is a vestige of the original's inline layout (see
        // `compartment.rs`) and unused by anything in this crate.
        compartment.register_table(table.clone(), std::ptr::null_mut())?;
        if ty.limits.min > 0 {
            table.grow_internal(ty.limits.min, TableElementRef::Null)?;
        }
        Ok(table)
    }

    pub fn num_elements(&self) -> u64 {
        self.elements.read().unwrap().len() as u64
    }

    pub fn max_elements(&self) -> u64 {
        self.ty.limits.max_or(u32::MAX as u64)
    }

    fn grow_internal(&self, delta: u64, init: TableElementRef) -> crate::error::RuntimeResult<u64> {
        let mut elements = self.elements.write().unwrap();
        let previous = elements.len() as u64;
        let new_total = previous
            .checked_add(delta)
            .ok_or(crate::error::RuntimeError::OutOfMemory)?;
        if new_total > self.max_elements() {
            return Err(crate::error::RuntimeError::QuotaExceeded {
                resource: "table elements",
                requested: new_total,
                available: self.max_elements(),
            });
        }
        self.resource_quota.allocate_table_elements(delta)?;
        elements.resize(new_total as usize, TableSlot::Value(init));
        Ok(previous)
    }

    pub fn grow(&self, delta: u64, init: TableElementRef) -> crate::error::RuntimeResult<u64> {
        let previous = self.grow_internal(delta, init)?;
        log::trace!("table grew from {previous} to {} elements", previous + delta);
        Ok(previous)
    }

    /// `table.grow` as the Wasm intrinsic sees it.
    pub fn try_grow(&self, delta: u64, init: TableElementRef) -> i64 {
        match self.grow(delta, init) {
            Ok(previous) => previous as i64,
            Err(_) => -1,
        }
    }

    fn oob_trap(&self, index: u64) -> Trap {
        Trap::OutOfBoundsTableAccess { table_name: Arc::from(self.header.debug_name.as_str()), index }
    }

    fn uninitialized_trap(&self, index: u64) -> Trap {
        Trap::UninitializedTableElement { table_name: Arc::from(self.header.debug_name.as_str()), index }
    }

    /// Grounded on `getTableElement`: an out-of-bounds index traps;
    /// anything else — including a never-initialized slot, per §4.3 —
    /// reads back as `null`. Only indirect-call dispatch
    /// ([`Table::get_function_checked`]) treats a null/uninitialized
    /// callee as a trap.
    pub fn get(&self, index: u64) -> Result<TableElementRef, Trap> {
        let elements = self.elements.read().unwrap();
        match elements.get(index as usize) {
            None => Err(self.oob_trap(index)),
            Some(TableSlot::Uninitialized) => Ok(TableElementRef::Null),
            Some(TableSlot::Value(v)) => Ok(v.clone()),
        }
    }

    pub fn set(&self, index: u64, value: TableElementRef) -> Result<(), Trap> {
        let mut elements = self.elements.write().unwrap();
        let len = elements.len();
        match elements.get_mut(index as usize) {
            None => Err(self.oob_trap_with_len(index, len)),
            Some(slot) => {
                *slot = TableSlot::Value(value);
                Ok(())
            }
        }
    }

    fn oob_trap_with_len(&self, index: u64, _len: usize) -> Trap {
        self.oob_trap(index)
    }

    /// `table.fill`.
    pub fn fill(&self, dest: u64, value: TableElementRef, len: u64) -> Result<(), Trap> {
        let end = dest.checked_add(len).ok_or_else(|| self.oob_trap(dest))?;
        if end > self.num_elements() {
            return Err(self.oob_trap(dest));
        }
        let mut elements = self.elements.write().unwrap();
        for i in dest..end {
            elements[i as usize] = TableSlot::Value(value.clone());
        }
        Ok(())
    }

    /// `table.copy`. Overlap-safe: copies in descending order when the
    /// regions could alias with `source < dest`, matching the original's
    /// aliasing-safety comment.
    pub fn copy(&self, dest: u64, src: u64, len: u64) -> Result<(), Trap> {
        if len == 0 {
            return Ok(());
        }
        let dest_end = dest.checked_add(len).ok_or_else(|| self.oob_trap(dest))?;
        let src_end = src.checked_add(len).ok_or_else(|| self.oob_trap(src))?;
        let num = self.num_elements();
        if dest_end > num {
            return Err(self.oob_trap(dest));
        }
        if src_end > num {
            return Err(self.oob_trap(src));
        }
        let mut elements = self.elements.write().unwrap();
        if src < dest {
            for i in (0..len).rev() {
                elements[(dest + i) as usize] = elements[(src + i) as usize].clone();
            }
        } else {
            for i in 0..len {
                elements[(dest + i) as usize] = elements[(src + i) as usize].clone();
            }
        }
        Ok(())
    }

    /// Materializes an already-resolved range of elements (e.g. from
    /// `table.init`/an active element segment) starting at `dest`.
    /// `instance_name`/`segment_index` identify the segment in the trap
    /// §4.3/§4.6 require (`outOfBoundsElemSegmentAccess(instance, segIdx,
    /// sourceIndex)`).
    pub fn init_from(&self, instance_name: &str, segment_index: u32, dest: u64, source: &[TableElementRef], src_offset: u64, len: u64) -> Result<(), Trap> {
        let num_source_indices = source.len() as u64;
        let src_end = src_offset.checked_add(len);
        if src_end.map_or(true, |end| end > num_source_indices) {
            return Err(Trap::OutOfBoundsElemSegmentAccess {
                instance_name: Arc::from(instance_name),
                segment_index,
                index: src_offset.max(num_source_indices),
            });
        }
        let src_end = src_end.unwrap();
        let dest_end = dest.checked_add(len).ok_or_else(|| self.oob_trap(dest))?;
        if dest_end > self.num_elements() {
            return Err(self.oob_trap(dest));
        }
        let mut elements = self.elements.write().unwrap();
        for (i, src_i) in (src_offset..src_end).enumerate() {
            elements[(dest + i as u64) as usize] = TableSlot::Value(source[src_i as usize].clone());
        }
        Ok(())
    }

    /// Grounded on `callIndirectFail`: distinguishes the three ways an
    /// indirect call can fail to reach a valid callee of the expected
    /// type, rather than lumping them into one generic trap.
    pub fn get_function_checked(&self, index: u64, expected: FunctionTypeEncoding) -> Result<Arc<Function>, Trap> {
        debug_assert_eq!(self.ty.element, RefType::Func);
        let element = self.get(index)?;
        match element {
            TableElementRef::Func(f) => {
                if f.encoded_type != expected {
                    return Err(Trap::IndirectCallSignatureMismatch { expected, actual: f.encoded_type });
                }
                Ok(f)
            }
            TableElementRef::Null | TableElementRef::Extern(_) => Err(self.uninitialized_trap(index)),
        }
    }

    /// Grounded on `cloneTable`: a fresh `Table` of the same type and size
    /// in `compartment`, with every element's `TableElementRef` cloned
    /// (an `Arc` bump for `Func`/`Extern` entries, so cloned tables still
    /// reference the *same* function/foreign objects as the original —
    /// `cloneTable` never deep-copies the functions a table points to).
    pub fn clone_into(&self, compartment: &Arc<crate::compartment::Compartment>) -> crate::error::RuntimeResult<Arc<Table>> {
        let cloned = Table::create(compartment, self.ty, self.header.debug_name.clone())?;
        let elements = self.elements.read().unwrap();
        let current = elements.len() as u64;
        if current > cloned.num_elements() {
            cloned.grow(current - cloned.num_elements(), TableElementRef::Null)?;
        }
        {
            let mut cloned_elements = cloned.elements.write().unwrap();
            for (i, slot) in elements.iter().enumerate() {
                cloned_elements[i] = slot.clone();
            }
        }
        drop(elements);
        Ok(cloned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::Compartment;
    use rt_environ::Limits;

    fn ty(min: u64, max: Option<u64>) -> TableType {
        TableType {
            element: RefType::Func,
            index_type: rt_environ::IndexType::I32,
            is_shared: false,
            limits: Limits { min, max },
        }
    }

    #[test]
    fn fresh_elements_are_initialized_to_null_not_uninitialized() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let table = Table::create(&compartment, ty(2, Some(8)), "t").unwrap();
        assert!(matches!(table.get(0).unwrap(), TableElementRef::Null));
        assert!(matches!(table.get(1).unwrap(), TableElementRef::Null));
    }

    #[test]
    fn out_of_bounds_get_and_set_trap() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let table = Table::create(&compartment, ty(1, Some(1)), "t").unwrap();
        assert!(matches!(table.get(1), Err(Trap::OutOfBoundsTableAccess { .. })));
        assert!(matches!(table.set(1, TableElementRef::Null), Err(Trap::OutOfBoundsTableAccess { .. })));
    }

    #[test]
    fn grow_extends_with_requested_init_value() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let table = Table::create(&compartment, ty(0, Some(4)), "t").unwrap();
        let previous = table.grow(2, TableElementRef::Null).unwrap();
        assert_eq!(previous, 0);
        assert_eq!(table.num_elements(), 2);
        assert_eq!(table.try_grow(10, TableElementRef::Null), -1);
    }

    #[test]
    fn fill_and_copy_move_values() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let table = Table::create(&compartment, ty(4, Some(4)), "t").unwrap();
        table.set(0, TableElementRef::Null).unwrap();
        table.fill(0, TableElementRef::Null, 4).unwrap();
        table.copy(2, 0, 2).unwrap();
        assert!(matches!(table.get(2).unwrap(), TableElementRef::Null));
    }

    #[test]
    fn init_from_out_of_bounds_source_traps() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let table = Table::create(&compartment, ty(4, Some(4)), "t").unwrap();
        let source = vec![TableElementRef::Null; 2];
        assert!(matches!(
            table.init_from("inst", 0, 0, &source, 0, 4),
            Err(Trap::OutOfBoundsElemSegmentAccess { .. })
        ));
        assert!(table.init_from("inst", 0, 0, &source, 0, 2).is_ok());
    }
}
