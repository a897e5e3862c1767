//! Shared IR types for a sandboxed WebAssembly execution core.
//!
//! This crate holds the passive data describing a module's shape —
//! value/function/table/memory/global/exception types, import/export
//! descriptors, data/elem segments, and the compiled-module container — so
//! that an (out-of-scope) compiler crate and `rt-runtime` can agree on a
//! wire shape without the runtime depending on the compiler.

mod module;
mod segment;
mod types;

pub use module::{CompiledModule, ModuleIr};
pub use segment::{ConstExpr, DataSegment, ElemContents, ElemExpr, ElemSegment, ElemSegmentKind, SegmentKind};
pub use types::{
    ExceptionTypeSig, ExportDescriptor, ExternDescriptor, ExternIndex, ExternKind, FunctionType,
    FunctionTypeEncoding, GlobalType, ImportDescriptor, IndexType, Limits, MemoryType, RefType,
    TableType, ValType,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_type_encoding_is_shape_sensitive() {
        let a = FunctionType::new(vec![ValType::I32], vec![ValType::I64]);
        let b = FunctionType::new(vec![ValType::I32], vec![ValType::I32]);
        let c = FunctionType::new(vec![ValType::I32], vec![ValType::I64]);
        assert_ne!(a.encode(), b.encode());
        assert_eq!(a.encode(), c.encode());
    }
}
