//! Parses a compiler-produced relocatable object, resolves every symbol
//! named in §6.1's binding ABI against the running compartment, applies
//! relocations, and publishes the result as executable code.
//!
//! This is the one piece of the runtime that talks to the (otherwise
//! out-of-scope) compiler: everything here assumes the object was
//! produced by something honoring the binding-table contract in
//! `symbols.rs`, the way `wasmtime-jit`'s loader assumes its input came
//! from `wasmtime-cranelift`.

use std::collections::HashMap;

use object::read::elf::ElfFile64;
use object::{Endianness, Object, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget};
use rt_environ::FunctionTypeEncoding;

use crate::error::{RuntimeError, RuntimeResult};
use crate::function::RawEntry;
use crate::jit::code_memory::CodeMemory;
use crate::jit::symbols::BoundSymbol;

/// Addresses and offsets the loader binds undefined symbols against,
/// supplied by `Instance::instantiate` (§4.8) once it knows the
/// compartment layout the module is being linked into.
pub struct Bindings<'a> {
    pub type_ids: &'a [FunctionTypeEncoding],
    pub function_imports: &'a [usize],
    pub table_offsets: &'a [usize],
    pub memory_offsets: &'a [usize],
    /// Byte offset within `ContextRuntimeData::mutable_globals` of each
    /// global the module references.
    pub globals: &'a [u32],
    pub biased_exception_type_ids: &'a [u32],
    pub biased_instance_id: u32,
    pub function_def_mutable_data: &'a [usize],
    pub resolve_intrinsic: &'a dyn Fn(&str) -> Option<usize>,
}

/// The loaded, executable form of one `CompiledModule::object_code`
/// blob. Kept alive for as long as any [`crate::function::Function`] it
/// defines is reachable.
pub struct JitModule {
    code: CodeMemory,
    /// Defined-function symbol name -> (byte offset within `code`, size).
    functions: HashMap<String, (usize, usize)>,
    /// Sorted by start offset, for `instruction_source_by_address`.
    address_map: Vec<(usize, usize, String)>,
}

impl JitModule {
    pub fn load(object_code: &[u8], bindings: &Bindings<'_>) -> RuntimeResult<JitModule> {
        let (mut code, section_start_by_index) = CodeMemory::new(object_code)?;

        let elf = ElfFile64::<Endianness>::parse(object_code)
            .map_err(|e| RuntimeError::MalformedJitObject(e.to_string()))?;

        let mut functions = HashMap::new();
        let mut address_map = Vec::new();
        for symbol in elf.symbols() {
            if !symbol.is_definition() || symbol.kind() != object::SymbolKind::Text {
                continue;
            }
            let Some(section_index) = symbol.section_index() else { continue };
            let Some(section_range) = section_start_by_index.get(&section_index.0) else { continue };
            let name = symbol.name().unwrap_or("").to_string();
            let offset = section_range.start + symbol.address() as usize;
            let size = symbol.size() as usize;
            address_map.push((offset, offset + size.max(1), name.clone()));
            functions.insert(name, (offset, size));
        }
        address_map.sort_by_key(|(start, ..)| *start);

        for section in elf.sections() {
            let Some(section_range) = section_start_by_index.get(&section.index().0) else { continue };
            for (reloc_offset, relocation) in section.relocations() {
                let target_addr = match relocation.target() {
                    RelocationTarget::Symbol(sym_index) => {
                        let symbol = elf
                            .symbol_by_index(sym_index)
                            .map_err(|e| RuntimeError::MalformedJitObject(e.to_string()))?;
                        resolve_symbol_address(&symbol, &section_start_by_index, bindings)?
                    }
                    RelocationTarget::Section(sec_index) => {
                        let base = section_start_by_index
                            .get(&sec_index.0)
                            .ok_or_else(|| RuntimeError::MalformedJitObject("relocation against unknown section".into()))?;
                        code.as_ptr() as i64 + base.start as i64
                    }
                    _ => return Err(RuntimeError::MalformedJitObject("unsupported relocation target".into())),
                };

                let patch_addr = section_range.start + reloc_offset as usize;
                let addend = relocation.addend();
                apply_relocation(&code, patch_addr, relocation.kind(), target_addr + addend, reloc_offset as i64 + section_range.start as i64)?;
            }
        }

        code.publish()?;

        Ok(JitModule { code, functions, address_map })
    }

    /// Looks up a loaded function's entry point by the symbol name the
    /// compiler gave it.
    pub fn entry_point(&self, symbol: &str) -> Option<(RawEntry, usize)> {
        let (offset, size) = *self.functions.get(symbol)?;
        let ptr = unsafe { self.code.as_ptr().add(offset) };
        let entry: RawEntry = unsafe { std::mem::transmute::<*const u8, RawEntry>(ptr) };
        Some((entry, size))
    }

    /// Grounded on the original's lazy `getInstructionSourceByAddress`:
    /// maps an address back to the defined function symbol containing
    /// it, without a full DWARF line-table parse (out of scope).
    pub fn instruction_source_by_address(&self, addr: *const u8) -> Option<&str> {
        let offset = (addr as usize).checked_sub(self.code.as_ptr() as usize)?;
        let idx = self
            .address_map
            .binary_search_by(|(start, end, _)| {
                if offset < *start {
                    std::cmp::Ordering::Greater
                } else if offset >= *end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()?;
        Some(&self.address_map[idx].2)
    }
}

fn resolve_symbol_address<'d>(
    symbol: &impl ObjectSymbol<'d>,
    section_start_by_index: &HashMap<usize, std::ops::Range<usize>>,
    bindings: &Bindings<'_>,
) -> RuntimeResult<i64> {
    if symbol.is_definition() {
        let section_index = symbol
            .section_index()
            .ok_or_else(|| RuntimeError::MalformedJitObject("defined symbol has no section".into()))?;
        let range = section_start_by_index
            .get(&section_index.0)
            .ok_or_else(|| RuntimeError::MalformedJitObject("symbol section not loaded".into()))?;
        return Ok((range.start + symbol.address() as usize) as i64);
    }

    let name = symbol.name().unwrap_or("");
    let bound = BoundSymbol::parse(name).ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))?;
    let value = match bound {
        BoundSymbol::Intrinsic(n) => (bindings.resolve_intrinsic)(n).ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))? as i64,
        BoundSymbol::TypeId(i) => bindings
            .type_ids
            .get(i as usize)
            .ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))?
            .0 as i64,
        BoundSymbol::FunctionImport(i) => *bindings
            .function_imports
            .get(i as usize)
            .ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))? as i64,
        BoundSymbol::TableOffset(i) => *bindings
            .table_offsets
            .get(i as usize)
            .ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))? as i64,
        BoundSymbol::MemoryOffset(i) => *bindings
            .memory_offsets
            .get(i as usize)
            .ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))? as i64,
        BoundSymbol::Global(i) => *bindings
            .globals
            .get(i as usize)
            .ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))? as i64,
        BoundSymbol::BiasedExceptionTypeId(i) => *bindings
            .biased_exception_type_ids
            .get(i as usize)
            .ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))? as i64,
        BoundSymbol::BiasedInstanceId => bindings.biased_instance_id as i64,
        BoundSymbol::TableReferenceBias => 0,
        BoundSymbol::FunctionDefMutableData(i) => *bindings
            .function_def_mutable_data
            .get(i as usize)
            .ok_or_else(|| RuntimeError::UndefinedSymbol(name.to_string()))? as i64,
    };
    Ok(value)
}

fn apply_relocation(code: &CodeMemory, patch_offset: usize, kind: RelocationKind, target_addr: i64, pc: i64) -> RuntimeResult<()> {
    let patch_ptr = unsafe { code.as_mut_ptr().add(patch_offset) };
    match kind {
        RelocationKind::Absolute => unsafe {
            std::ptr::write_unaligned(patch_ptr.cast::<i64>(), target_addr);
        },
        RelocationKind::Relative | RelocationKind::PltRelative => unsafe {
            let value = (target_addr - pc) as i32;
            std::ptr::write_unaligned(patch_ptr.cast::<i32>(), value);
        },
        other => {
            return Err(RuntimeError::MalformedJitObject(format!("unsupported relocation kind {other:?}")));
        }
    }
    Ok(())
}
