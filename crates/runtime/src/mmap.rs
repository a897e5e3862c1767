//! Virtual-memory reservation for linear memories and tables.
//!
//! Grounded on the reservation strategy described for both memories and
//! tables (§4.4/§4.5): reserve the full address range up front
//! (cheap — no physical backing) and commit/decommit pages as
//! `memory.grow`/`table.grow`/instance teardown require. The actual
//! syscalls mirror what `wasmtime`'s platform `Mmap` wrapper does
//! (`mmap`/`mprotect`/`munmap` on unix, `VirtualAlloc`/`VirtualFree` on
//! windows) — this module only needs the reserve/commit/decommit subset.

use std::io;

/// A page-granular virtual memory reservation. `reserve` maps `len`
/// bytes with no access rights (or, on windows, reserves without
/// committing); `commit`/`decommit` toggle read/write access over a
/// sub-range without touching the reservation itself.
pub struct Mmap {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn page_size() -> usize {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
            } else {
                4096
            }
        }
    }

    pub fn reserve(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Ok(Mmap { ptr: std::ptr::null_mut(), len: 0 });
        }
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unsafe {
                    let ptr = libc::mmap(
                        std::ptr::null_mut(),
                        len,
                        libc::PROT_NONE,
                        libc::MAP_PRIVATE | libc::MAP_ANON,
                        -1,
                        0,
                    );
                    if ptr == libc::MAP_FAILED {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(Mmap { ptr: ptr.cast(), len })
                }
            } else if #[cfg(windows)] {
                use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESERVE, PAGE_NOACCESS};
                unsafe {
                    let ptr = VirtualAlloc(std::ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS);
                    if ptr.is_null() {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(Mmap { ptr: ptr.cast(), len })
                }
            } else {
                compile_error!("unsupported platform: no virtual memory reservation backend");
            }
        }
    }

    /// Grants read/write access to `[offset, offset+len)`, which must lie
    /// within the reservation and be page-aligned.
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        debug_assert!(offset + len <= self.len);
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                let rc = libc::mprotect(
                    self.ptr.add(offset).cast(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                );
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            } else if #[cfg(windows)] {
                use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, PAGE_READWRITE};
                let ptr = VirtualAlloc(self.ptr.add(offset).cast(), len, MEM_COMMIT, PAGE_READWRITE);
                if ptr.is_null() {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
        }
    }

    /// Revokes access and returns physical pages to the OS without
    /// releasing the virtual address reservation; re-`commit`ting the
    /// same range reads back as zero, matching `memory.grow`'s
    /// zero-initialization guarantee and the table's "decommitted pages
    /// read as the out-of-bounds sentinel" invariant.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        debug_assert!(offset + len <= self.len);
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                let rc = libc::mprotect(self.ptr.add(offset).cast(), len, libc::PROT_NONE);
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::madvise(self.ptr.add(offset).cast(), len, libc::MADV_DONTNEED);
                Ok(())
            } else if #[cfg(windows)] {
                use windows_sys::Win32::System::Memory::{VirtualFree, MEM_DECOMMIT};
                let rc = VirtualFree(self.ptr.add(offset).cast(), len, MEM_DECOMMIT);
                if rc == 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unsafe {
                    libc::munmap(self.ptr.cast(), self.len);
                }
            } else if #[cfg(windows)] {
                use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
                unsafe {
                    VirtualFree(self.ptr.cast(), 0, MEM_RELEASE);
                }
            }
        }
    }
}
