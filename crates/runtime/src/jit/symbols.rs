//! The fixed symbol-binding ABI a compiler-produced relocatable object
//! must follow (§6.1). Every undefined symbol referenced by the object
//! is one of these forms; [`BoundSymbol::parse`] is the inverse of
//! whatever the (out-of-scope) compiler used to name them.

/// One entry of the binding table the loader must resolve before a
/// JIT-compiled object's relocations can be applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundSymbol<'a> {
    /// A named intrinsic function (`memory.grow`, `table.get`, ...),
    /// resolved against the runtime's own intrinsic table
    /// (`intrinsics.rs`).
    Intrinsic(&'a str),
    /// The compact [`rt_environ::FunctionTypeEncoding`] of the `N`th
    /// function type the module references, used at `call_indirect`
    /// sites.
    TypeId(u32),
    /// The `N`th function import in the module's function index space.
    FunctionImport(u32),
    /// Byte offset, from the compartment's runtime-data base, of the
    /// `N`th table the module references (imported or defined).
    TableOffset(u32),
    /// Byte offset of the `N`th memory the module references.
    MemoryOffset(u32),
    /// Byte offset, within `ContextRuntimeData::mutable_globals`, of the
    /// `N`th global the module references.
    Global(u32),
    /// The biased id of the `N`th exception type the module references.
    BiasedExceptionTypeId(u32),
    /// The biased id of the instance being instantiated, available to a
    /// module's own code for self-referential intrinsics (e.g.
    /// `ref.func` against its own table).
    BiasedInstanceId,
    /// The constant subtracted from an object's address to produce its
    /// biased table-element representation (§4.3). Kept for ABI parity
    /// even though this crate's table storage (`table.rs`) doesn't use
    /// raw biased pointers internally.
    TableReferenceBias,
    /// Pointer to the `N`th defined function's `FunctionMutableData`.
    FunctionDefMutableData(u32),
}

impl<'a> BoundSymbol<'a> {
    /// Parses a linker symbol name produced by the compiler into its
    /// binding-table meaning, or `None` if `name` isn't one of the
    /// recognized forms (in which case the loader treats it as a
    /// genuinely undefined symbol and fails the load).
    pub fn parse(name: &'a str) -> Option<BoundSymbol<'a>> {
        if let Some(rest) = name.strip_prefix("typeId<") {
            return parse_indexed(rest).map(BoundSymbol::TypeId);
        }
        if let Some(rest) = name.strip_prefix("functionImport<") {
            return parse_indexed(rest).map(BoundSymbol::FunctionImport);
        }
        if let Some(rest) = name.strip_prefix("tableOffset<") {
            return parse_indexed(rest).map(BoundSymbol::TableOffset);
        }
        if let Some(rest) = name.strip_prefix("memoryOffset<") {
            return parse_indexed(rest).map(BoundSymbol::MemoryOffset);
        }
        if let Some(rest) = name.strip_prefix("global<") {
            return parse_indexed(rest).map(BoundSymbol::Global);
        }
        if let Some(rest) = name.strip_prefix("biasedExceptionTypeId<") {
            return parse_indexed(rest).map(BoundSymbol::BiasedExceptionTypeId);
        }
        if let Some(rest) = name.strip_prefix("functionDefMutableDatas<") {
            return parse_indexed(rest).map(BoundSymbol::FunctionDefMutableData);
        }
        if name == "biasedInstanceId" {
            return Some(BoundSymbol::BiasedInstanceId);
        }
        if name == "tableReferenceBias" {
            return Some(BoundSymbol::TableReferenceBias);
        }
        if let Some(rest) = name.strip_prefix("intrinsic:") {
            return Some(BoundSymbol::Intrinsic(rest));
        }
        None
    }
}

fn parse_indexed(rest: &str) -> Option<u32> {
    let digits = rest.strip_suffix('>')?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_indexed_forms() {
        assert_eq!(BoundSymbol::parse("typeId<3>"), Some(BoundSymbol::TypeId(3)));
        assert_eq!(BoundSymbol::parse("memoryOffset<0>"), Some(BoundSymbol::MemoryOffset(0)));
        assert_eq!(BoundSymbol::parse("biasedInstanceId"), Some(BoundSymbol::BiasedInstanceId));
        assert_eq!(BoundSymbol::parse("intrinsic:memory.grow"), Some(BoundSymbol::Intrinsic("memory.grow")));
        assert_eq!(BoundSymbol::parse("not_a_binding"), None);
    }
}
