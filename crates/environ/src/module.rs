//! `ModuleIr`: the validated, not-yet-compiled shape of a module, and
//! `CompiledModule`: that shape plus the compiler's relocatable object code.
//!
//! Producing these is explicitly out of scope for this crate (see
//! `spec.md` §1); this module defines only the container shape the runtime
//! is handed.

use crate::segment::{DataSegment, ElemSegment};
use crate::types::{ExportDescriptor, ExternDescriptor, FunctionType, GlobalType, ImportDescriptor, MemoryType, TableType};

/// The validated IR of one module: its import/export surface, the types
/// and initializers of everything it defines, and its segments. Entity
/// indices (`defined_functions[i]` etc.) are module-local and distinct
/// from the "biased" ids the runtime assigns objects within a compartment.
#[derive(Clone, Debug, Default)]
pub struct ModuleIr {
    pub imports: Vec<ImportDescriptor>,
    pub exports: Vec<ExportDescriptor>,

    /// Function types for every function in the module's function index
    /// space (imports first, then defined functions), mirroring
    /// `wasmtime_environ::Module`'s layout.
    pub function_types: Vec<FunctionType>,
    pub num_imported_functions: u32,

    pub defined_tables: Vec<TableType>,
    pub num_imported_tables: u32,

    pub defined_memories: Vec<MemoryType>,
    pub num_imported_memories: u32,

    pub defined_globals: Vec<(GlobalType, crate::segment::ConstExpr)>,
    pub num_imported_globals: u32,

    pub defined_exception_types: Vec<crate::types::ExceptionTypeSig>,
    pub num_imported_exception_types: u32,

    pub data_segments: Vec<DataSegment>,
    pub elem_segments: Vec<ElemSegment>,

    /// Index (in the function index space) of the start function, if any.
    pub start_function: Option<u32>,

    pub name: Option<String>,
}

impl ModuleIr {
    pub fn num_defined_functions(&self) -> u32 {
        self.function_types.len() as u32 - self.num_imported_functions
    }
}

/// A compiled module: a module's IR plus the compiler's relocatable
/// object-code blob and the data bytes referenced by its data segments.
///
/// `object_code` is treated as opaque by everything except
/// `rt_runtime::jit`, which parses it as an ELF relocatable object
/// following the symbol-binding ABI in `spec.md` §6.1.
#[derive(Clone)]
pub struct CompiledModule {
    pub ir: ModuleIr,
    pub object_code: Vec<u8>,
    /// Concatenated data-segment bytes; `DataSegment::data_range` indexes
    /// into this.
    pub data: Vec<u8>,
}

impl CompiledModule {
    pub fn new(ir: ModuleIr, object_code: Vec<u8>, data: Vec<u8>) -> Self {
        Self { ir, object_code, data }
    }

    pub fn segment_bytes(&self, range: core::ops::Range<u32>) -> &[u8] {
        &self.data[range.start as usize..range.end as usize]
    }
}
