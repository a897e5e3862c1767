//! Linear memories.
//!
//! Grounded on `Lib/Runtime/Memory.cpp`: reserve the full address range
//! up front (`memory_reservation_bytes`, default 8 GiB), commit/decommit
//! whole 64 KiB Wasm pages as `memory.grow`/`memory.shrink`-equivalents
//! run, and expose the saturating bounds-check helpers
//! (`getValidatedMemoryOffsetRange`) that let compiled code's bounds
//! check degenerate into a single guard-page-backed comparison.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rt_environ::MemoryType;

use crate::compartment::Compartment;
use crate::error::Trap;
use crate::object::{GcHeader, ObjectKind};

pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

pub struct Memory {
    pub header: GcHeader,
    pub ty: MemoryType,
    reservation: crate::mmap::Mmap,
    /// Number of committed Wasm pages; `Acquire`/`Release` ordered so a
    /// reader on another thread that observes a larger `num_pages` is
    /// guaranteed to see the newly committed bytes (the original's
    /// comment on `growMemory` calls this out explicitly).
    num_pages: AtomicU64,
    /// Serializes concurrent `grow`/`shrink` calls; reads never take it.
    resizing: RwLock<()>,
    resource_quota: Arc<crate::resource_quota::ResourceQuota>,
}

impl Memory {
    pub fn create(compartment: &Arc<Compartment>, ty: MemoryType, debug_name: impl Into<String>) -> crate::error::RuntimeResult<Arc<Memory>> {
        let reservation_bytes = compartment.config.memory_reservation_bytes;
        let reservation = crate::mmap::Mmap::reserve(reservation_bytes as usize)
            .map_err(|_| crate::error::RuntimeError::OutOfMemory)?;
        let header = GcHeader::new(ObjectKind::Memory, compartment, debug_name);
        let memory = Arc::new(Memory {
            header,
            ty,
            reservation,
            num_pages: AtomicU64::new(0),
            resizing: RwLock::new(()),
            resource_quota: compartment.resource_quota.clone(),
        });
        let base = memory.reservation.as_mut_ptr();
        let id = compartment.register_memory(memory.clone(), base)?;
        let _ = id;
        if ty.limits.min > 0 {
            memory.grow(ty.limits.min)?;
        }
        Ok(memory)
    }

    pub fn base_address(&self) -> *mut u8 {
        self.reservation.as_mut_ptr()
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages.load(Ordering::Acquire)
    }

    pub fn max_pages(&self) -> u64 {
        self.ty.limits.max_or(self.reservation.len() as u64 / WASM_PAGE_SIZE)
    }

    /// Grows the memory by `delta_pages`, returning the previous page
    /// count. Grounded on `growMemory`: validate against the declared
    /// maximum and the resource quota *before* committing, commit new
    /// pages, then publish the new count with `Release` ordering.
    pub fn grow(&self, delta_pages: u64) -> crate::error::RuntimeResult<u64> {
        let _guard = self.resizing.write().unwrap();
        let previous = self.num_pages.load(Ordering::Relaxed);
        let new_total = previous
            .checked_add(delta_pages)
            .ok_or(crate::error::RuntimeError::OutOfMemory)?;
        if new_total > self.max_pages() {
            return Err(crate::error::RuntimeError::QuotaExceeded {
                resource: "memory pages",
                requested: new_total,
                available: self.max_pages(),
            });
        }
        self.resource_quota.allocate_memory_pages(delta_pages)?;
        let byte_offset = previous * WASM_PAGE_SIZE;
        let byte_len = delta_pages * WASM_PAGE_SIZE;
        if let Err(e) = unsafe { self.reservation.commit(byte_offset as usize, byte_len as usize) } {
            self.resource_quota.free_memory_pages(delta_pages);
            log::warn!("memory.grow failed to commit {delta_pages} pages: {e}");
            return Err(crate::error::RuntimeError::OutOfMemory);
        }
        self.num_pages.store(new_total, Ordering::Release);
        log::trace!("memory grew from {previous} to {new_total} pages");
        Ok(previous)
    }

    /// `memory.grow` as the Wasm intrinsic sees it: `-1` instead of a
    /// trap on failure.
    pub fn try_grow(&self, delta_pages: u64) -> i64 {
        match self.grow(delta_pages) {
            Ok(previous) => previous as i64,
            Err(_) => -1,
        }
    }

    /// Not part of core Wasm (no `memory.shrink` instruction exists) but
    /// retained from the original's API for embedder-driven memory
    /// reclamation; decommits the tail pages, returning their bytes to
    /// the OS while keeping the reservation intact.
    pub fn shrink(&self, new_num_pages: u64) -> crate::error::RuntimeResult<u64> {
        let _guard = self.resizing.write().unwrap();
        let previous = self.num_pages.load(Ordering::Relaxed);
        if new_num_pages > previous {
            return Err(crate::error::RuntimeError::InvalidArgument("shrink target exceeds current size".into()));
        }
        let byte_offset = new_num_pages * WASM_PAGE_SIZE;
        let byte_len = (previous - new_num_pages) * WASM_PAGE_SIZE;
        unsafe {
            self.reservation
                .decommit(byte_offset as usize, byte_len as usize)
                .map_err(|_| crate::error::RuntimeError::InvalidArgument("decommit failed".into()))?;
        }
        self.resource_quota.free_memory_pages(previous - new_num_pages);
        self.num_pages.store(new_num_pages, Ordering::Release);
        Ok(previous)
    }

    pub fn is_address_owned(&self, addr: *const u8) -> bool {
        let base = self.base_address() as usize;
        let a = addr as usize;
        a >= base && a < base + self.reservation.len()
    }

    /// The full reserved range as `&[u8]`/`&mut [u8]` are never handed
    /// out directly (pages past `num_pages` are `PROT_NONE`); callers go
    /// through [`Memory::validated_range`] instead.
    fn committed_len(&self) -> u64 {
        self.num_pages() * WASM_PAGE_SIZE
    }

    /// Grounded on `getValidatedMemoryOffsetRange`: returns a byte slice
    /// for `[base+address, base+address+num_bytes)` if and only if the
    /// whole range lies within committed pages; otherwise a trap carrying
    /// the out-of-bounds address for diagnostics.
    pub fn validated_range(&self, address: u64, num_bytes: u64) -> Result<&[u8], Trap> {
        let end = address.checked_add(num_bytes).ok_or_else(|| self.oob_trap(address))?;
        if end > self.committed_len() {
            return Err(self.oob_trap(address));
        }
        let slice = unsafe { std::slice::from_raw_parts(self.base_address().add(address as usize), num_bytes as usize) };
        Ok(slice)
    }

    pub fn validated_range_mut(&self, address: u64, num_bytes: u64) -> Result<&mut [u8], Trap> {
        let end = address.checked_add(num_bytes).ok_or_else(|| self.oob_trap(address))?;
        if end > self.committed_len() {
            return Err(self.oob_trap(address));
        }
        let slice = unsafe { std::slice::from_raw_parts_mut(self.base_address().add(address as usize), num_bytes as usize) };
        Ok(slice)
    }

    fn oob_trap(&self, address: u64) -> Trap {
        Trap::OutOfBoundsMemoryAccess { memory_name: Arc::from(self.header.debug_name.as_str()), address }
    }

    /// Grounded on `getReservedMemoryOffsetRange`: the saturating
    /// counterpart to [`Memory::validated_range`] — bounds-checks against
    /// the full 8 GiB *reservation* rather than the committed prefix, the
    /// way compiled code's single guard-page-backed bounds check would
    /// (§4.2, §8 universal property #1). Returns a raw pointer rather
    /// than a slice: bytes past the committed prefix are `PROT_NONE`, so
    /// a safe `&[u8]` over them would be unsound even though the address
    /// arithmetic itself is in range.
    pub fn reserved_range(&self, address: u64, num_bytes: u64) -> Result<*const u8, Trap> {
        let reserved = self.reservation.len() as u64;
        let clamped_len = num_bytes.min(reserved);
        let clamped_address = address.min(reserved - clamped_len);
        if clamped_address != address || clamped_len != num_bytes {
            return Err(self.oob_trap(address));
        }
        Ok(unsafe { self.base_address().add(clamped_address as usize) })
    }

    /// `memory.copy`: overlap-safe via `copy_within` semantics.
    pub fn copy_within(&self, dest: u64, src: u64, len: u64) -> Result<(), Trap> {
        if len == 0 {
            // Zero-length copies never trap even with an out-of-bounds
            // base, matching the bulk-memory spec.
            if dest > self.committed_len() || src > self.committed_len() {
                return Ok(());
            }
        }
        let _ = self.validated_range(dest, len)?;
        let _ = self.validated_range(src, len)?;
        unsafe {
            let base = self.base_address();
            std::ptr::copy(base.add(src as usize), base.add(dest as usize), len as usize);
        }
        Ok(())
    }

    pub fn fill(&self, dest: u64, value: u8, len: u64) -> Result<(), Trap> {
        let dst = self.validated_range_mut(dest, len)?;
        dst.fill(value);
        Ok(())
    }

    /// `memory.init`/an active data segment: copies `len` bytes from
    /// `source[src_offset..]` into `[dest, dest+len)`. `instance_name`/
    /// `segment_index` identify the segment in the trap the spec
    /// requires (§4.6's `outOfBoundsDataSegmentAccess(instance, segIdx,
    /// size)`) without `Memory` itself needing to know about instances.
    pub fn init_from(&self, instance_name: &str, segment_index: u32, dest: u64, source: &[u8], src_offset: u64, len: u64) -> Result<(), Trap> {
        let src_end = src_offset.checked_add(len);
        if src_end.map_or(true, |end| end > source.len() as u64) {
            return Err(Trap::OutOfBoundsDataSegmentAccess {
                instance_name: Arc::from(instance_name),
                segment_index,
                size: source.len() as u64,
            });
        }
        let dst = self.validated_range_mut(dest, len)?;
        dst.copy_from_slice(&source[src_offset as usize..src_end.unwrap() as usize]);
        Ok(())
    }

    /// Grounded on `cloneMemory`: a deep copy of the current committed
    /// bytes into a fresh `Memory` of the same type in `compartment`.
    pub fn clone_into(&self, compartment: &Arc<Compartment>) -> crate::error::RuntimeResult<Arc<Memory>> {
        let cloned = Memory::create(compartment, self.ty, self.header.debug_name.clone())?;
        let current = self.num_pages();
        if current > cloned.num_pages() {
            cloned.grow(current - cloned.num_pages())?;
        }
        let len = (current * WASM_PAGE_SIZE) as usize;
        if len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(self.base_address(), cloned.base_address(), len);
            }
        }
        Ok(cloned)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        self.resource_quota.free_memory_pages(self.num_pages());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::Compartment;
    use rt_environ::{IndexType, Limits};

    fn ty(min: u64, max: Option<u64>) -> MemoryType {
        MemoryType { index_type: IndexType::I32, is_shared: false, limits: Limits { min, max } }
    }

    #[test]
    fn grow_commits_pages_and_reports_previous_size() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let memory = Memory::create(&compartment, ty(1, Some(4)), "m").unwrap();
        assert_eq!(memory.num_pages(), 1);
        let previous = memory.grow(2).unwrap();
        assert_eq!(previous, 1);
        assert_eq!(memory.num_pages(), 3);
    }

    #[test]
    fn grow_past_max_fails_without_changing_size() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let memory = Memory::create(&compartment, ty(0, Some(1)), "m").unwrap();
        assert_eq!(memory.try_grow(2), -1);
        assert_eq!(memory.num_pages(), 0);
    }

    #[test]
    fn out_of_bounds_access_traps() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let memory = Memory::create(&compartment, ty(1, Some(1)), "m").unwrap();
        assert!(memory.validated_range(0, WASM_PAGE_SIZE).is_ok());
        assert!(matches!(
            memory.validated_range(WASM_PAGE_SIZE - 1, 2),
            Err(Trap::OutOfBoundsMemoryAccess { .. })
        ));
    }

    #[test]
    fn reserved_range_saturates_instead_of_trapping_within_the_reservation() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let memory = Memory::create(&compartment, ty(1, Some(1)), "m").unwrap();
        let reserved = compartment.config.memory_reservation_bytes;
        // Entirely within the reservation (even though far past committed
        // pages) never traps.
        assert!(memory.reserved_range(reserved - 8, 8).is_ok());
        // A request that would cross the reservation boundary traps.
        assert!(matches!(memory.reserved_range(reserved - 4, 8), Err(Trap::OutOfBoundsMemoryAccess { .. })));
        assert!(matches!(memory.reserved_range(reserved + 1, 1), Err(Trap::OutOfBoundsMemoryAccess { .. })));
    }

    #[test]
    fn fill_and_copy_within_bounds() {
        let compartment = Compartment::create(crate::config::Config::default()).unwrap();
        let memory = Memory::create(&compartment, ty(1, Some(1)), "m").unwrap();
        memory.fill(0, 0xab, 16).unwrap();
        memory.copy_within(16, 0, 16).unwrap();
        let range = memory.validated_range(16, 16).unwrap();
        assert!(range.iter().all(|&b| b == 0xab));
    }
}
