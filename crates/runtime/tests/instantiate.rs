//! End-to-end instantiation tests that exercise the full
//! `instantiate_module` sequence without depending on a real JIT object:
//! every module here declares zero defined functions and empty
//! `object_code`, so `JitModule::load` is never invoked (the
//! `compiled.object_code.is_empty()` branch in `instance.rs`) while every
//! other step (imports, memories, tables, globals, segments, exports)
//! still runs for real.

use std::sync::Arc;

use rt_environ::{
    ConstExpr, DataSegment, ElemContents, ElemExpr, ElemSegment, ElemSegmentKind, ExportDescriptor, ExternIndex, GlobalType,
    IndexType, Limits, MemoryType, ModuleIr, RefType, SegmentKind, TableType, ValType,
};
use rt_runtime::{instantiate_module, Compartment, Config, Context, Imports};

fn memory_type(min: u64, max: Option<u64>) -> MemoryType {
    MemoryType { index_type: IndexType::I32, is_shared: false, limits: Limits { min, max } }
}

fn table_type(min: u64, max: Option<u64>) -> TableType {
    TableType { element: RefType::Func, index_type: IndexType::I32, is_shared: false, limits: Limits { min, max } }
}

fn compiled_with(ir: ModuleIr, data: Vec<u8>) -> rt_environ::CompiledModule {
    rt_environ::CompiledModule::new(ir, Vec::new(), data)
}

#[test]
fn instantiates_memory_global_and_exports_them() {
    let compartment = Compartment::create(Config::default()).unwrap();
    let context = Context::create(&compartment).unwrap();

    let mut ir = ModuleIr::default();
    ir.defined_memories.push(memory_type(1, Some(2)));
    ir.defined_globals.push((GlobalType { content: ValType::I32, mutable: true }, ConstExpr::I32(7)));
    ir.exports.push(ExportDescriptor { name: "mem".into(), index: ExternIndex::Memory(0) });
    ir.exports.push(ExportDescriptor { name: "g".into(), index: ExternIndex::Global(0) });

    let compiled = compiled_with(ir, Vec::new());
    let instance = instantiate_module(&compartment, &context, &compiled, Imports::default(), &rt_runtime::intrinsics::resolve_intrinsic).unwrap();

    let memory = instance.memory_by_export("mem").unwrap();
    assert_eq!(memory.num_pages(), 1);

    let global = match instance.exports.get("g").unwrap() {
        rt_runtime::instance::ExternValue::Global(g) => g.clone(),
        _ => panic!("expected a global export"),
    };
    assert_eq!(global.get_value(&context).as_i32(), 7);
}

#[test]
fn active_data_segment_is_materialized_during_instantiation() {
    let compartment = Compartment::create(Config::default()).unwrap();
    let context = Context::create(&compartment).unwrap();

    let mut ir = ModuleIr::default();
    ir.defined_memories.push(memory_type(1, Some(1)));
    ir.data_segments.push(DataSegment {
        kind: SegmentKind::Active { memory_index: 0, offset: ConstExpr::I32(0) },
        data_range: 0..4,
    });
    ir.exports.push(ExportDescriptor { name: "mem".into(), index: ExternIndex::Memory(0) });

    let compiled = compiled_with(ir, vec![1, 2, 3, 4]);
    let instance = instantiate_module(&compartment, &context, &compiled, Imports::default(), &rt_runtime::intrinsics::resolve_intrinsic).unwrap();

    let memory = instance.memory_by_export("mem").unwrap();
    let bytes = memory.validated_range(0, 4).unwrap();
    assert_eq!(bytes, &[1, 2, 3, 4]);
}

#[test]
fn passive_data_segment_is_consumed_by_memory_init_then_traps_after_drop() {
    let compartment = Compartment::create(Config::default()).unwrap();
    let context = Context::create(&compartment).unwrap();

    let mut ir = ModuleIr::default();
    ir.defined_memories.push(memory_type(1, Some(1)));
    ir.data_segments.push(DataSegment { kind: SegmentKind::Passive, data_range: 0..2 });

    let compiled = compiled_with(ir, vec![0xaa, 0xbb]);
    let instance = instantiate_module(&compartment, &context, &compiled, Imports::default(), &rt_runtime::intrinsics::resolve_intrinsic).unwrap();

    instance.memory_init(0, 0, 10, 0, 2).unwrap();
    assert_eq!(instance.memories[0].validated_range(10, 2).unwrap(), &[0xaa, 0xbb]);

    instance.data_drop(0);
    assert!(instance.memory_init(0, 0, 0, 0, 2).is_err());
}

#[test]
fn active_elem_segment_populates_table_and_table_init_respects_elem_drop() {
    let compartment = Compartment::create(Config::default()).unwrap();
    let context = Context::create(&compartment).unwrap();

    let mut ir = ModuleIr::default();
    ir.defined_tables.push(table_type(4, Some(4)));
    ir.elem_segments.push(ElemSegment {
        kind: ElemSegmentKind::Active { table_index: 0, offset: ConstExpr::I32(0) },
        contents: ElemContents::Exprs(vec![ElemExpr::RefNull, ElemExpr::RefNull]),
    });
    ir.elem_segments.push(ElemSegment {
        kind: ElemSegmentKind::Passive,
        contents: ElemContents::Exprs(vec![ElemExpr::RefNull]),
    });
    ir.exports.push(ExportDescriptor { name: "t".into(), index: ExternIndex::Table(0) });

    let compiled = compiled_with(ir, Vec::new());
    let instance = instantiate_module(&compartment, &context, &compiled, Imports::default(), &rt_runtime::intrinsics::resolve_intrinsic).unwrap();

    let table = instance.table_by_export("t").unwrap();
    assert_eq!(table.num_elements(), 4);

    instance.table_init(0, 1, 2, 0, 1).unwrap();
    instance.elem_drop(1);
    assert!(instance.table_init(0, 1, 3, 0, 1).is_err());
}

#[test]
fn uninitialized_table_element_traps_distinctly_from_out_of_bounds() {
    let compartment = Compartment::create(Config::default()).unwrap();
    let context = Context::create(&compartment).unwrap();

    let mut ir = ModuleIr::default();
    ir.defined_tables.push(table_type(2, Some(2)));
    let compiled = compiled_with(ir, Vec::new());
    let instance = instantiate_module(&compartment, &context, &compiled, Imports::default(), &rt_runtime::intrinsics::resolve_intrinsic).unwrap();

    // Defined tables are grown with `TableElementRef::Null`, not left
    // uninitialized (see `Table::create`), so a fresh slot reads back as
    // a null reference rather than trapping.
    assert!(matches!(instance.tables[0].get(0).unwrap(), rt_runtime::TableElementRef::Null));
    assert!(instance.tables[0].get(5).is_err());
}

#[test]
fn missing_required_import_is_rejected_before_any_object_is_created() {
    let compartment = Compartment::create(Config::default()).unwrap();
    let context = Context::create(&compartment).unwrap();

    let mut ir = ModuleIr::default();
    ir.imports.push(rt_environ::ImportDescriptor {
        module: "env".into(),
        name: "mem".into(),
        ty: rt_environ::ExternDescriptor::Memory(memory_type(1, None)),
    });
    ir.num_imported_memories = 1;

    let compiled = compiled_with(ir, Vec::new());
    let err = instantiate_module(&compartment, &context, &compiled, Imports::default(), &rt_runtime::intrinsics::resolve_intrinsic).unwrap_err();
    assert!(err.to_string().contains("env.mem"));
}

#[test]
fn duplicate_export_names_are_rejected() {
    let compartment = Compartment::create(Config::default()).unwrap();
    let context = Context::create(&compartment).unwrap();

    let mut ir = ModuleIr::default();
    ir.defined_memories.push(memory_type(1, Some(1)));
    ir.defined_memories.push(memory_type(1, Some(1)));
    ir.exports.push(ExportDescriptor { name: "dup".into(), index: ExternIndex::Memory(0) });
    ir.exports.push(ExportDescriptor { name: "dup".into(), index: ExternIndex::Memory(1) });

    let compiled = compiled_with(ir, Vec::new());
    let err = instantiate_module(&compartment, &context, &compiled, Imports::default(), &rt_runtime::intrinsics::resolve_intrinsic).unwrap_err();
    assert!(err.to_string().contains("dup"));
}

#[test]
fn imported_memory_is_shared_between_two_instances() {
    let compartment = Compartment::create(Config::default()).unwrap();
    let context = Context::create(&compartment).unwrap();
    let shared_memory = rt_runtime::Memory::create(&compartment, memory_type(1, Some(4)), "shared").unwrap();

    let mut ir = ModuleIr::default();
    ir.imports.push(rt_environ::ImportDescriptor {
        module: "env".into(),
        name: "mem".into(),
        ty: rt_environ::ExternDescriptor::Memory(memory_type(1, Some(4))),
    });
    ir.num_imported_memories = 1;
    ir.exports.push(ExportDescriptor { name: "mem".into(), index: ExternIndex::Memory(0) });

    let compiled = compiled_with(ir, Vec::new());
    let imports = Imports { memories: vec![shared_memory.clone()], ..Imports::default() };
    let instance = instantiate_module(&compartment, &context, &compiled, imports, &rt_runtime::intrinsics::resolve_intrinsic).unwrap();

    shared_memory.fill(0, 0x42, 8).unwrap();
    let exported = instance.memory_by_export("mem").unwrap();
    assert!(Arc::ptr_eq(exported, &shared_memory));
    assert_eq!(exported.validated_range(0, 8).unwrap(), &[0x42; 8]);
}
