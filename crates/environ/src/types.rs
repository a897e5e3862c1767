//! Value and entity types shared between a module's compiler and the
//! execution engine.
//!
//! None of this module performs validation: by the time a [`ModuleIr`]
//! reaches the runtime it is assumed to have already been checked by an
//! external parser/validator (out of scope for this crate).

use core::fmt;

/// A WebAssembly value type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    Ref(RefType),
}

impl ValType {
    /// Size in bytes of the untagged value representation used in
    /// `ContextRuntimeData::mutable_globals` slots and thunk scratch space.
    pub const fn untagged_size(self) -> usize {
        16
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
            ValType::V128 => write!(f, "v128"),
            ValType::Ref(r) => write!(f, "{r}"),
        }
    }
}

/// A reference type: either a function reference or an opaque external
/// reference (`externref`/"foreign").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefType {
    Func,
    Extern,
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefType::Func => write!(f, "funcref"),
            RefType::Extern => write!(f, "externref"),
        }
    }
}

/// Whether a table/memory index space uses 32- or 64-bit indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    I32,
    I64,
}

/// A WebAssembly function type, plus a compact encoding used as the
/// type-identity value threaded through the JIT binding table (`typeId<N>`
/// in the symbol ABI) and compared at `call_indirect` sites.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FunctionType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        Self { params, results }
    }

    /// A stable, order-sensitive encoding of this type's shape. Two
    /// `FunctionType`s with the same encoding are considered the same Wasm
    /// calling-convention type; `call_indirect` traps with
    /// `IndirectCallSignatureMismatch` when the loaded function's encoding
    /// doesn't match the instruction's declared encoding.
    pub fn encode(&self) -> FunctionTypeEncoding {
        let mut hash: u64 = 0xcbf29ce484222325;
        let mix = |hash: &mut u64, tag: u8| {
            *hash ^= u64::from(tag);
            *hash = hash.wrapping_mul(0x100000001b3);
        };
        for p in &self.params {
            mix(&mut hash, val_type_tag(*p));
        }
        mix(&mut hash, 0xff);
        for r in &self.results {
            mix(&mut hash, val_type_tag(*r));
        }
        FunctionTypeEncoding(hash)
    }
}

fn val_type_tag(v: ValType) -> u8 {
    match v {
        ValType::I32 => 0,
        ValType::I64 => 1,
        ValType::F32 => 2,
        ValType::F64 => 3,
        ValType::V128 => 4,
        ValType::Ref(RefType::Func) => 5,
        ValType::Ref(RefType::Extern) => 6,
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> (")?;
        for (i, r) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, ")")
    }
}

/// Opaque, comparable encoding of a [`FunctionType`]'s shape. This is the
/// value bound to `typeId<N>` symbols and stashed in a `Function`'s
/// immutable header so `call_indirect` can compare encodings without
/// dereferencing the full `FunctionType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FunctionTypeEncoding(pub u64);

/// Min/max bounds shared by table and memory types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Limits {
    pub min: u64,
    pub max: Option<u64>,
}

impl Limits {
    pub fn max_or(self, default: u64) -> u64 {
        self.max.unwrap_or(default)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableType {
    pub element: RefType,
    pub index_type: IndexType,
    pub is_shared: bool,
    pub limits: Limits,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryType {
    pub index_type: IndexType,
    pub is_shared: bool,
    pub limits: Limits,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

/// The parameter tuple of an exception type (a "tag" in newer Wasm
/// terminology); WAVM calls this an `ExceptionType` signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExceptionTypeSig {
    pub params: Vec<ValType>,
}

/// Superset tag shared between compile-time `IR::ObjectKind` and the
/// runtime's object model; §6.2 requires the two to have identical
/// discriminant values for the standard (importable/exportable) kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExternKind {
    Function = 0,
    Table = 1,
    Memory = 2,
    Global = 3,
    ExceptionType = 4,
}

/// A description of one import: the two-part (module, name) path and the
/// type the import site expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub module: String,
    pub name: String,
    pub ty: ExternDescriptor,
}

/// A description of one export: the name it's visible under and which
/// already-instantiated entity it names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportDescriptor {
    pub name: String,
    pub index: ExternIndex,
}

/// The type half of an import/export descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternDescriptor {
    Function(FunctionType),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
    ExceptionType(ExceptionTypeSig),
}

impl ExternDescriptor {
    pub fn kind(&self) -> ExternKind {
        match self {
            ExternDescriptor::Function(_) => ExternKind::Function,
            ExternDescriptor::Table(_) => ExternKind::Table,
            ExternDescriptor::Memory(_) => ExternKind::Memory,
            ExternDescriptor::Global(_) => ExternKind::Global,
            ExternDescriptor::ExceptionType(_) => ExternKind::ExceptionType,
        }
    }
}

/// An index into one of a module's *own* entity spaces (defined or
/// imported, the two are not distinguished in the index space itself,
/// matching how `wasmtime-environ`'s `EntityIndex` is defined).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExternIndex {
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
    ExceptionType(u32),
}
