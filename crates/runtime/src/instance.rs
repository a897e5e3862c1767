//! Module instantiation (§4.8): resolves imports, creates every defined
//! memory/table/global/exception type, loads the compiled module's
//! object code, materializes segments, and (optionally) runs the start
//! function — in the fixed order `RuntimePrivate.h`'s
//! `instantiateModuleInternal` requires so that later steps can assume
//! earlier ones already ran (e.g. elem segments resolving `ref.func`
//! assume every function, imported or defined, already exists).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rt_environ::{CompiledModule, ConstExpr, ElemContents, ElemSegmentKind, ExternDescriptor, ExternIndex, SegmentKind};

use crate::compartment::Compartment;
use crate::context::Context;
use crate::error::{RuntimeError, RuntimeResult};
use crate::exception::ExceptionType;
use crate::function::Function;
use crate::global::Global;
use crate::invoke::invoke_function;
use crate::jit::{Bindings, JitModule};
use crate::memory::Memory;
use crate::object::{GcHeader, ObjectKind};
use crate::table::{Table, TableElementRef};
use crate::vmcontext::UntaggedValue;

#[derive(Clone)]
pub enum ExternValue {
    Function(Arc<Function>),
    Table(Arc<Table>),
    Memory(Arc<Memory>),
    Global(Arc<Global>),
    ExceptionType(Arc<ExceptionType>),
}

/// Already-resolved imports, one vector per extern kind, in the order
/// the module's `ModuleIr::imports` lists them for that kind. Resolving
/// the (module, name) path against a host-defined import namespace is
/// an embedder concern and stays out of this crate.
#[derive(Default)]
pub struct Imports {
    pub functions: Vec<Arc<Function>>,
    pub tables: Vec<Arc<Table>>,
    pub memories: Vec<Arc<Memory>>,
    pub globals: Vec<Arc<Global>>,
    pub exception_types: Vec<Arc<ExceptionType>>,
}

pub struct Instance {
    pub header: GcHeader,
    pub functions: Vec<Arc<Function>>,
    pub tables: Vec<Arc<Table>>,
    pub memories: Vec<Arc<Memory>>,
    pub globals: Vec<Arc<Global>>,
    pub exception_types: Vec<Arc<ExceptionType>>,
    pub exports: HashMap<String, ExternValue>,
    data_segments: Mutex<Vec<Option<Arc<[u8]>>>>,
    elem_segments: Mutex<Vec<Option<Arc<Vec<TableElementRef>>>>>,
    #[allow(dead_code)]
    jit_module: Option<Arc<JitModule>>,
}

impl Instance {
    pub fn memory_by_export(&self, name: &str) -> Option<&Arc<Memory>> {
        match self.exports.get(name)? {
            ExternValue::Memory(m) => Some(m),
            _ => None,
        }
    }

    pub fn function_by_export(&self, name: &str) -> Option<&Arc<Function>> {
        match self.exports.get(name)? {
            ExternValue::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn table_by_export(&self, name: &str) -> Option<&Arc<Table>> {
        match self.exports.get(name)? {
            ExternValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// `memory.init`: copies from a still-live passive data segment.
    /// Traps if the segment was already dropped (`data.drop`) — modeled
    /// here as the slot being `None`, matching `initDataSegment`'s
    /// behavior of only clearing active segments eagerly and leaving
    /// dropped-passive segments as an explicit empty marker.
    pub fn memory_init(&self, memory_index: usize, segment_index: usize, dest: u64, src_offset: u64, len: u64) -> Result<(), crate::error::Trap> {
        let segments = self.data_segments.lock().unwrap();
        let bytes = segments.get(segment_index).and_then(|s| s.clone()).ok_or_else(|| crate::error::Trap::OutOfBoundsDataSegmentAccess {
            instance_name: Arc::from(self.header.debug_name.as_str()),
            segment_index: segment_index as u32,
            size: len,
        })?;
        drop(segments);
        self.memories[memory_index].init_from(&self.header.debug_name, segment_index as u32, dest, &bytes, src_offset, len)
    }

    pub fn data_drop(&self, segment_index: usize) {
        if let Some(slot) = self.data_segments.lock().unwrap().get_mut(segment_index) {
            *slot = None;
        }
    }

    pub fn table_init(&self, table_index: usize, segment_index: usize, dest: u64, src_offset: u64, len: u64) -> Result<(), crate::error::Trap> {
        let segments = self.elem_segments.lock().unwrap();
        let elements = segments.get(segment_index).and_then(|s| s.clone()).ok_or_else(|| crate::error::Trap::OutOfBoundsElemSegmentAccess {
            instance_name: Arc::from(self.header.debug_name.as_str()),
            segment_index: segment_index as u32,
            index: src_offset,
        })?;
        drop(segments);
        self.tables[table_index].init_from(&self.header.debug_name, segment_index as u32, dest, &elements, src_offset, len)
    }

    pub fn elem_drop(&self, segment_index: usize) {
        if let Some(slot) = self.elem_segments.lock().unwrap().get_mut(segment_index) {
            *slot = None;
        }
    }
}

fn eval_const_expr(
    expr: &ConstExpr,
    globals: &[Arc<Global>],
    context: &Context,
    functions: Option<&[Arc<Function>]>,
) -> Result<UntaggedValue, &'static str> {
    Ok(match expr {
        ConstExpr::I32(v) => UntaggedValue::from_i32(*v),
        ConstExpr::I64(v) => UntaggedValue::from_i64(*v),
        ConstExpr::F32(bits) => UntaggedValue::from_i32(*bits as i32),
        ConstExpr::F64(bits) => UntaggedValue::from_i64(*bits as i64),
        ConstExpr::V128(bytes) => UntaggedValue::from_v128(*bytes),
        ConstExpr::GlobalGet(index) => globals
            .get(*index as usize)
            .ok_or("global.get index out of range in const expr")?
            .get_value(context),
        ConstExpr::RefNull(_) => UntaggedValue::ZERO,
        ConstExpr::RefFunc(index) => {
            let functions = functions.ok_or("ref.func const expr not yet resolvable")?;
            let f = functions.get(*index as usize).ok_or("ref.func index out of range in const expr")?;
            UntaggedValue::from_i64(Arc::as_ptr(f) as i64)
        }
    })
}

fn offset_of_const_expr(expr: &ConstExpr, globals: &[Arc<Global>], context: &Context) -> RuntimeResult<u64> {
    let raw = eval_const_expr(expr, globals, context, None).map_err(|e| RuntimeError::InvalidArgument(e.into()))?;
    Ok(match expr {
        ConstExpr::I64(_) => raw.as_i64() as u64,
        _ => raw.as_i32() as u32 as u64,
    })
}

/// Runs the fixed instantiation sequence and returns the resulting
/// instance, already registered in `compartment`.
pub fn instantiate_module(
    compartment: &Arc<Compartment>,
    context: &Context,
    compiled: &CompiledModule,
    imports: Imports,
    resolve_intrinsic: &dyn Fn(&str) -> Option<usize>,
) -> anyhow::Result<Arc<Instance>> {
    let ir = &compiled.ir;

    // Step 1: validate import shapes against the module's declared
    // import descriptors.
    validate_imports(ir, &imports)?;

    // Step 2: defined memories.
    let mut memories = imports.memories.clone();
    for (i, ty) in ir.defined_memories.iter().enumerate() {
        memories.push(Memory::create(compartment, *ty, format!("{}/memory[{}]", ir.name.as_deref().unwrap_or("<anon>"), i))?);
    }

    // Step 3: defined tables.
    let mut tables = imports.tables.clone();
    for (i, ty) in ir.defined_tables.iter().enumerate() {
        tables.push(Table::create(compartment, *ty, format!("{}/table[{}]", ir.name.as_deref().unwrap_or("<anon>"), i))?);
    }

    // Step 4: defined globals whose initializer doesn't need functions
    // yet; `ref.func`-initialized globals are finished in step 6.
    let mut globals = imports.globals.clone();
    let mut deferred_globals: Vec<(usize, rt_environ::GlobalType, ConstExpr)> = Vec::new();
    for (ty, expr) in &ir.defined_globals {
        if matches!(expr, ConstExpr::RefFunc(_)) {
            deferred_globals.push((globals.len(), *ty, expr.clone()));
            // Reserve the slot now (mutable) or a placeholder entry
            // (immutable, patched below) so indices stay stable.
            let placeholder = Global::create(compartment, *ty, UntaggedValue::ZERO, "<deferred>")?;
            globals.push(placeholder);
        } else {
            let value = eval_const_expr(expr, &globals, context, None).map_err(|e| anyhow::anyhow!(e))?;
            globals.push(Global::create(compartment, *ty, value, "global")?);
        }
    }

    // Step 5: load the compiled module's object code, binding
    // `memoryOffset<N>`/`tableOffset<N>`/`global<N>`/`typeId<N>`/
    // `functionImport<N>` against what now exists.
    let memory_offsets: Vec<usize> = memories.iter().map(|m| m.base_address() as usize).collect();
    let table_offsets: Vec<usize> = vec![0; tables.len()]; // see table.rs: no stable base pointer
    let type_ids: Vec<rt_environ::FunctionTypeEncoding> = ir.function_types.iter().map(|t| t.encode()).collect();
    let function_import_addrs: Vec<usize> = imports.functions.iter().map(|f| Arc::as_ptr(f) as usize).collect();
    // `globals` is already in the module's global index order (imports
    // first, then defined), so mapping each to its own compartment slot
    // — rather than a synthetic sequential index — keeps imported
    // globals' real slots intact.
    let global_offsets: Vec<u32> = globals.iter().map(|g| g.slot()).collect();
    let exception_biased_ids: Vec<u32> = (0..ir.defined_exception_types.len() as u32).collect();
    let function_def_mutable_data = vec![0usize; ir.num_defined_functions() as usize];

    let bindings = Bindings {
        type_ids: &type_ids,
        function_imports: &function_import_addrs,
        table_offsets: &table_offsets,
        memory_offsets: &memory_offsets,
        globals: &global_offsets,
        biased_exception_type_ids: &exception_biased_ids,
        biased_instance_id: 0,
        function_def_mutable_data: &function_def_mutable_data,
        resolve_intrinsic,
    };

    let jit_module = if compiled.object_code.is_empty() {
        None
    } else {
        Some(Arc::new(JitModule::load(&compiled.object_code, &bindings)?))
    };

    // Step 6: build `Function`s for every defined function, then finish
    // any global whose initializer needed them.
    let mut functions = imports.functions.clone();
    for (i, ty) in ir.function_types.iter().skip(ir.num_imported_functions as usize).enumerate() {
        let symbol = format!("function<{i}>");
        match jit_module.as_ref().and_then(|m| m.entry_point(&symbol)) {
            Some((entry, num_code_bytes)) => {
                functions.push(Function::new_compiled(
                    compartment,
                    ty.clone(),
                    symbol,
                    0,
                    jit_module.clone().unwrap(),
                    entry,
                    num_code_bytes,
                ));
            }
            None => {
                return Err(RuntimeError::MalformedJitObject(format!("missing defined function symbol `{symbol}`")).into());
            }
        }
    }
    for (slot, _ty, expr) in deferred_globals {
        let value = eval_const_expr(&expr, &globals, context, Some(&functions)).map_err(|e| anyhow::anyhow!(e))?;
        context.store_global(globals[slot].slot(), value);
    }

    // Step 7: defined exception types.
    let mut exception_types = imports.exception_types.clone();
    for (i, sig) in ir.defined_exception_types.iter().enumerate() {
        exception_types.push(ExceptionType::create(compartment, sig.clone(), format!("exception[{i}]"))?);
    }

    // Step 8: data segments — active ones materialize now, passive ones
    // are retained for `memory.init`.
    let instance_name = ir.name.as_deref().unwrap_or("<anon>");
    let mut data_segment_slots = Vec::with_capacity(ir.data_segments.len());
    for (segment_index, segment) in ir.data_segments.iter().enumerate() {
        let bytes: Arc<[u8]> = Arc::from(compiled.segment_bytes(segment.data_range.clone()));
        match &segment.kind {
            SegmentKind::Passive => data_segment_slots.push(Some(bytes)),
            SegmentKind::Active { memory_index, offset } => {
                let dest = offset_of_const_expr(offset, &globals, context)?;
                memories[*memory_index as usize].init_from(instance_name, segment_index as u32, dest, &bytes, 0, bytes.len() as u64)?;
                data_segment_slots.push(None);
            }
        }
    }

    // Step 9: element segments — resolve indices/expressions to actual
    // references now that every function exists, active ones
    // materialize into their table immediately.
    let mut elem_segment_slots = Vec::with_capacity(ir.elem_segments.len());
    for (segment_index, segment) in ir.elem_segments.iter().enumerate() {
        let resolved = resolve_elem_contents(&segment.contents, &functions, &tables);
        match &segment.kind {
            ElemSegmentKind::Passive | ElemSegmentKind::Declared => {
                elem_segment_slots.push(Some(Arc::new(resolved)));
            }
            ElemSegmentKind::Active { table_index, offset } => {
                let dest = offset_of_const_expr(offset, &globals, context)?;
                tables[*table_index as usize].init_from(instance_name, segment_index as u32, dest, &resolved, 0, resolved.len() as u64)?;
                elem_segment_slots.push(None);
            }
        }
    }

    // Step 10: exports.
    let mut exports = HashMap::new();
    for export in &ir.exports {
        let value = match export.index {
            ExternIndex::Function(i) => ExternValue::Function(functions[i as usize].clone()),
            ExternIndex::Table(i) => ExternValue::Table(tables[i as usize].clone()),
            ExternIndex::Memory(i) => ExternValue::Memory(memories[i as usize].clone()),
            ExternIndex::Global(i) => ExternValue::Global(globals[i as usize].clone()),
            ExternIndex::ExceptionType(i) => ExternValue::ExceptionType(exception_types[i as usize].clone()),
        };
        if exports.insert(export.name.clone(), value).is_some() {
            return Err(RuntimeError::DuplicateId(export.name.clone()).into());
        }
    }

    let header = GcHeader::new(ObjectKind::Instance, compartment, ir.name.clone().unwrap_or_else(|| "<anon>".into()));
    let instance = Arc::new(Instance {
        header,
        functions,
        tables,
        memories,
        globals,
        exception_types,
        exports,
        data_segments: Mutex::new(data_segment_slots),
        elem_segments: Mutex::new(elem_segment_slots),
        jit_module,
    });
    compartment.register_instance(instance.clone())?;

    // Step 11: start function.
    if let Some(start) = ir.start_function {
        invoke_function(context, &instance.functions[start as usize], &[])?;
    }

    Ok(instance)
}

fn resolve_elem_contents(contents: &ElemContents, functions: &[Arc<Function>], _tables: &[Arc<Table>]) -> Vec<TableElementRef> {
    match contents {
        ElemContents::Exprs(exprs) => exprs
            .iter()
            .map(|e| match e {
                rt_environ::ElemExpr::RefNull => TableElementRef::Null,
                rt_environ::ElemExpr::RefFunc(i) => TableElementRef::Func(functions[*i as usize].clone()),
            })
            .collect(),
        ElemContents::Indices { kind, indices } => indices
            .iter()
            .map(|i| match kind {
                rt_environ::ExternKind::Function => TableElementRef::Func(functions[*i as usize].clone()),
                _ => TableElementRef::Null,
            })
            .collect(),
    }
}

fn validate_imports(ir: &rt_environ::ModuleIr, imports: &Imports) -> RuntimeResult<()> {
    let mut fn_i = 0usize;
    let mut table_i = 0usize;
    let mut mem_i = 0usize;
    let mut global_i = 0usize;
    let mut exc_i = 0usize;
    for import in &ir.imports {
        match &import.ty {
            ExternDescriptor::Function(ty) => {
                let f = imports.functions.get(fn_i).ok_or_else(|| RuntimeError::MissingImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                })?;
                if f.encoded_type != ty.encode() {
                    return Err(RuntimeError::ImportTypeMismatch {
                        module: import.module.clone(),
                        name: import.name.clone(),
                        expected: import.ty.clone(),
                    });
                }
                fn_i += 1;
            }
            ExternDescriptor::Table(_) => {
                imports.tables.get(table_i).ok_or_else(|| RuntimeError::MissingImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                })?;
                table_i += 1;
            }
            ExternDescriptor::Memory(_) => {
                imports.memories.get(mem_i).ok_or_else(|| RuntimeError::MissingImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                })?;
                mem_i += 1;
            }
            ExternDescriptor::Global(ty) => {
                let g = imports.globals.get(global_i).ok_or_else(|| RuntimeError::MissingImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                })?;
                if g.ty != *ty {
                    return Err(RuntimeError::ImportTypeMismatch {
                        module: import.module.clone(),
                        name: import.name.clone(),
                        expected: import.ty.clone(),
                    });
                }
                global_i += 1;
            }
            ExternDescriptor::ExceptionType(_) => {
                imports.exception_types.get(exc_i).ok_or_else(|| RuntimeError::MissingImport {
                    module: import.module.clone(),
                    name: import.name.clone(),
                })?;
                exc_i += 1;
            }
        }
    }
    Ok(())
}
