//! Cross-module linking scenarios: context building, import resolution
//! across re-export chains, reference vending and indirect-call dispatch.

use corten_environ::{
    EntityIndex, FuncIndex, FuncType, GlobalIndex, MemoryPlan, Module, TableElementKind,
    TableIndex, TablePlan, TypeIndex, ValType, WASM_PAGE_SIZE,
};
use corten_runtime::{
    CompiledModule, EngineHandle, Instance, Memory, ModuleEngine, SharedTrampolines, Table, Trap,
    TypeRegistry,
};
use cranelift_entity::PrimaryMap;
use std::rc::Rc;
use std::sync::Arc;

/// Wrap a module in a synthetic compiled artifact: sixteen bytes of blob
/// per function body, eight per entry preamble, then the shared
/// trampolines.
fn compile(module: Module) -> Arc<CompiledModule> {
    let module = Arc::new(module);
    let num_funcs = module.functions.len();
    let num_types = module.types.len();

    let mut function_offsets = PrimaryMap::new();
    for i in 0..num_funcs {
        function_offsets.push(u32::try_from(i * 16).unwrap());
    }
    let mut entry_preambles = PrimaryMap::new();
    for i in 0..num_types {
        entry_preambles.push(u32::try_from(num_funcs * 16 + i * 8).unwrap());
    }

    let trampoline_base = u32::try_from(num_funcs * 16 + num_types * 8).unwrap();
    let trampolines = SharedTrampolines {
        memory_grow: trampoline_base,
        stack_grow: trampoline_base + 4,
        check_exit: trampoline_base + 8,
        table_grow: trampoline_base + 12,
        ref_func: trampoline_base + 16,
    };
    let executable = vec![0xcc; trampoline_base as usize + 20];

    Arc::new(CompiledModule::new(
        module,
        executable,
        function_offsets,
        entry_preambles,
        trampolines,
        None,
    ))
}

/// Instantiate `module`, letting `resolve` wire up imports before
/// finalization.
fn instantiate_with(
    registry: &mut TypeRegistry,
    module: Module,
    resolve: impl FnOnce(&mut ModuleEngine),
) -> EngineHandle {
    let _ = env_logger::builder().is_test(true).try_init();
    let artifact = compile(module);
    let type_ids = registry.register_module(artifact.module());
    let instance = Rc::new(Instance::new(artifact.shared_module().clone(), type_ids));
    let mut engine = ModuleEngine::new(artifact, instance);
    resolve(&mut engine);
    engine.done_instantiation();
    EngineHandle::new(engine)
}

fn instantiate(registry: &mut TypeRegistry, module: Module) -> EngineHandle {
    instantiate_with(registry, module, |_| {})
}

fn unary_type(module: &mut Module) -> TypeIndex {
    module.types.push(FuncType::new(&[ValType::I32], &[ValType::I32]))
}

/// A provider with `num_funcs` local functions of one unary type.
fn provider(registry: &mut TypeRegistry, name: &str, num_funcs: u32) -> EngineHandle {
    let mut module = Module::new();
    module.name = Some(name.to_string());
    let ty = unary_type(&mut module);
    for _ in 0..num_funcs {
        module.push_function(ty);
    }
    instantiate(registry, module)
}

/// An importer of `num_imports` unary functions, with one funcref table of
/// length `table_len`.
fn importer_module(name: &str, num_imports: u32, table_len: u32) -> Module {
    let mut module = Module::new();
    module.name = Some(name.to_string());
    let ty = unary_type(&mut module);
    for i in 0..num_imports {
        module.push_imported_function("provider", &format!("f{i}"), ty);
    }
    if table_len > 0 {
        module.tables.push(TablePlan {
            kind: TableElementKind::FuncRef,
            minimum: table_len,
            maximum: None,
        });
    }
    module
}

#[test]
fn context_builder_records_instance_state() {
    let mut registry = TypeRegistry::new();
    let mut module = Module::new();
    module.name = Some("state".to_string());
    let ty = unary_type(&mut module);
    module.push_function(ty);
    module.memory = Some(MemoryPlan {
        minimum: 1,
        maximum: None,
    });
    module.globals.push(corten_environ::Global {
        ty: ValType::I64,
        mutable: true,
    });
    module.tables.push(TablePlan {
        kind: TableElementKind::FuncRef,
        minimum: 2,
        maximum: None,
    });

    let engine = instantiate(&mut registry, module);
    let offsets = engine.artifact().offsets();
    let vmctx = engine.vmctx();
    let instance = engine.instance();

    assert_eq!(vmctx.module_instance(offsets), Rc::as_ptr(instance));

    let memory = vmctx.local_memory(offsets);
    assert_eq!(
        memory.base as *const u8,
        instance.memory().unwrap().data().as_ptr()
    );
    assert_eq!(memory.current_length, WASM_PAGE_SIZE as usize);

    let global = GlobalIndex::from_u32(0);
    assert_eq!(vmctx.global(offsets, global), instance.global_ptr(global));

    let table = TableIndex::from_u32(0);
    assert_eq!(
        vmctx.table(offsets, table),
        instance.table(table) as *const Table
    );
    assert_eq!(vmctx.type_ids(offsets), instance.type_ids_ptr().unwrap());
}

#[test]
fn zero_length_memory_keeps_true_length() {
    let mut registry = TypeRegistry::new();
    let mut module = Module::new();
    module.memory = Some(MemoryPlan {
        minimum: 0,
        maximum: Some(1),
    });

    let engine = instantiate(&mut registry, module);
    let memory = engine.vmctx().local_memory(engine.artifact().offsets());
    assert!(memory.base.is_null());
    assert_eq!(memory.current_length, 0);
}

#[test]
fn host_modules_skip_the_context_builder() {
    let mut registry = TypeRegistry::new();
    let mut module = Module::new();
    module.is_host_module = true;
    module.globals.push(corten_environ::Global {
        ty: ValType::I32,
        mutable: false,
    });

    let engine = instantiate(&mut registry, module);
    let offsets = engine.artifact().offsets();
    assert!(engine.vmctx().module_instance(offsets).is_null());
    assert!(engine.vmctx().global(offsets, GlobalIndex::from_u32(0)).is_null());
}

#[test]
fn import_chains_flatten_to_the_defining_module() {
    let mut registry = TypeRegistry::new();
    let c = provider(&mut registry, "c", 1);

    // b re-exports c's function; a imports it through b.
    let b = instantiate_with(&mut registry, importer_module("b", 1, 0), |engine| {
        engine.resolve_imported_function(FuncIndex::from_u32(0), FuncIndex::from_u32(0), &c);
    });
    let a = instantiate_with(&mut registry, importer_module("a", 1, 0), |engine| {
        engine.resolve_imported_function(FuncIndex::from_u32(0), FuncIndex::from_u32(0), &b);
    });
    // direct imports c's function with no chain at all.
    let direct = instantiate_with(&mut registry, importer_module("direct", 1, 0), |engine| {
        engine.resolve_imported_function(FuncIndex::from_u32(0), FuncIndex::from_u32(0), &c);
    });

    let slot = FuncIndex::from_u32(0);
    let through_chain = a.vmctx().imported_function(a.artifact().offsets(), slot);
    let direct_triple = direct
        .vmctx()
        .imported_function(direct.artifact().offsets(), slot);
    assert_eq!(through_chain, direct_triple);
    assert_eq!(through_chain.1, c.vmctx_ptr() as usize);

    // The recorded descriptor lets `a` act as a pass-through provider.
    let descriptor = a.imported_function(slot).unwrap();
    assert_eq!(descriptor.engine.vmctx_ptr(), c.vmctx_ptr());
    assert_eq!(descriptor.index, slot);
}

#[test]
fn lookup_function_checks_bounds_nullity_and_types() {
    let mut registry = TypeRegistry::new();

    let mut p_module = Module::new();
    p_module.name = Some("p".to_string());
    let unary = unary_type(&mut p_module);
    let nullary = p_module.types.push(FuncType::new(&[], &[]));
    let unary_func = p_module.push_function(unary);
    p_module.push_function(nullary);
    let p = instantiate(&mut registry, p_module);

    let m = instantiate_with(&mut registry, importer_module("m", 1, 3), |engine| {
        engine.resolve_imported_function(FuncIndex::from_u32(0), unary_func, &p);
    });

    let reference = m.func_ref(FuncIndex::from_u32(0));
    let instance = m.instance().clone();
    let table = instance.table(TableIndex::from_u32(0));
    table.set(0, reference).unwrap();

    let unary_id = p.instance().shared_type_id(FuncIndex::from_u32(0));
    let nullary_id = p.instance().shared_type_id(FuncIndex::from_u32(1));

    // Populated slot, matching type: the defining module and index.
    let (owner, index) = m.lookup_function(table, unary_id, 0).unwrap();
    assert!(std::ptr::eq(owner, Rc::as_ptr(p.instance())));
    assert_eq!(index, unary_func);

    // Same slot, wrong expected type.
    assert_eq!(
        m.lookup_function(table, nullary_id, 0).unwrap_err(),
        Trap::IndirectCallTypeMismatch
    );

    // Null slot: always an access error, never a signature error.
    assert_eq!(
        m.lookup_function(table, unary_id, 1).unwrap_err(),
        Trap::InvalidTableAccess
    );

    // Out of bounds.
    assert_eq!(
        m.lookup_function(table, unary_id, 3).unwrap_err(),
        Trap::InvalidTableAccess
    );
}

#[test]
fn lookup_function_rejects_non_funcref_tables() {
    let mut registry = TypeRegistry::new();
    let mut module = Module::new();
    unary_type(&mut module);
    module.tables.push(TablePlan {
        kind: TableElementKind::ExternRef,
        minimum: 1,
        maximum: None,
    });
    let engine = instantiate(&mut registry, module);
    let instance = engine.instance().clone();
    let table = instance.table(TableIndex::from_u32(0));

    assert_eq!(
        engine
            .lookup_function(table, corten_runtime::VMSharedTypeIndex::new(0), 0)
            .unwrap_err(),
        Trap::InvalidTableAccess
    );
}

#[test]
fn func_refs_are_content_equal_not_address_equal() {
    let mut registry = TypeRegistry::new();
    let p = provider(&mut registry, "p", 1);
    let func = FuncIndex::from_u32(0);

    let first = p.func_ref(func);
    let second = p.func_ref(func);
    assert_ne!(first.as_raw(), second.as_raw());

    let instance = p.instance().clone();
    let mut module = Module::new();
    module.tables.push(TablePlan {
        kind: TableElementKind::FuncRef,
        minimum: 2,
        maximum: None,
    });
    let holder = instantiate(&mut registry, module);
    let holder_instance = holder.instance().clone();
    let table = holder_instance.table(TableIndex::from_u32(0));
    table.set(0, first).unwrap();
    table.set(1, second).unwrap();

    let expected = instance.shared_type_id(func);
    let a = holder.lookup_function(table, expected, 0).unwrap();
    let b = holder.lookup_function(table, expected, 1).unwrap();
    assert!(std::ptr::eq(a.0, b.0));
    assert_eq!(a.1, b.1);
}

#[test]
fn import_slot_references_identify_the_true_owner() {
    // Module m has one imported function slot 0 bound to module p's
    // function index 2; lookup through a table slot populated from m's
    // reference to import 0 yields (p, 2).
    let mut registry = TypeRegistry::new();
    let p = provider(&mut registry, "p", 3);
    let target = FuncIndex::from_u32(2);

    let m = instantiate_with(&mut registry, importer_module("m", 1, 1), |engine| {
        engine.resolve_imported_function(FuncIndex::from_u32(0), target, &p);
    });

    let instance = m.instance().clone();
    let table = instance.table(TableIndex::from_u32(0));
    table.set(0, m.func_ref(FuncIndex::from_u32(0))).unwrap();

    let expected = p.instance().shared_type_id(target);
    let (owner, index) = m.lookup_function(table, expected, 0).unwrap();
    assert!(std::ptr::eq(owner, Rc::as_ptr(p.instance())));
    assert_eq!(index, target);
}

#[test]
fn imported_memory_resolves_to_the_owner() {
    let mut registry = TypeRegistry::new();

    let mut p_module = Module::new();
    p_module.name = Some("p".to_string());
    p_module.memory = Some(MemoryPlan {
        minimum: 1,
        maximum: None,
    });
    let p = instantiate(&mut registry, p_module);

    let mut m_module = Module::new();
    m_module.name = Some("m".to_string());
    m_module.imports.push(corten_environ::Import {
        module: "p".to_string(),
        field: "memory".to_string(),
        kind: corten_environ::ImportKind::Memory(MemoryPlan {
            minimum: 1,
            maximum: None,
        }),
    });
    let m = instantiate_with(&mut registry, m_module, |engine| {
        engine.resolve_imported_memory(&p);
    });

    let import = m.vmctx().imported_memory(m.artifact().offsets());
    assert_eq!(
        import.from,
        p.instance().memory().unwrap() as *const Memory
    );
    assert_eq!(import.vmctx, p.vmctx_ptr());

    // A further importer going through m still lands on p's memory.
    let mut q_module = Module::new();
    q_module.imports.push(corten_environ::Import {
        module: "m".to_string(),
        field: "memory".to_string(),
        kind: corten_environ::ImportKind::Memory(MemoryPlan {
            minimum: 1,
            maximum: None,
        }),
    });
    let q = instantiate_with(&mut registry, q_module, |engine| {
        engine.resolve_imported_memory(&m);
    });

    let forwarded = q.vmctx().imported_memory(q.artifact().offsets());
    assert_eq!(forwarded.from, import.from);
    assert_eq!(forwarded.vmctx, import.vmctx);
}

#[test]
fn callables_bind_code_preamble_and_trampolines() {
    let mut registry = TypeRegistry::new();
    let mut module = Module::new();
    module.name = Some("p".to_string());
    let ty = module
        .types
        .push(FuncType::new(&[ValType::I32], &[ValType::I64, ValType::F64]));
    let func = module.push_function(ty);
    module.exports.insert("run".to_string(), EntityIndex::Function(func));
    let p = instantiate(&mut registry, module);

    let callable = p.exported_function("run").unwrap();
    assert_eq!(callable.func_index(), func);
    assert_eq!(callable.required_params(), 1);
    assert_eq!(callable.result_count(), 2);
    // One buffer serves both directions, so it is sized for the larger.
    assert_eq!(callable.param_result_slots(), 2);

    let artifact = p.artifact();
    assert_eq!(
        callable.executable(),
        artifact.code_ptr(corten_environ::DefinedFuncIndex::from_u32(0))
    );
    assert_eq!(callable.preamble(), artifact.entry_preamble(ty));
    assert_eq!(
        callable.execution_context().memory_grow_trampoline,
        artifact.memory_grow_trampoline()
    );
    assert_eq!(
        callable.execution_context().ref_func_trampoline,
        artifact.ref_func_trampoline()
    );
    assert_eq!(callable.vmctx_ptr(), p.vmctx_ptr());

    // A callable built on an importing module belongs to the defining one.
    let m = instantiate_with(&mut registry, importer_module("m", 1, 0), |engine| {
        engine.resolve_imported_function(FuncIndex::from_u32(0), func, &p);
    });
    let through_import = m.new_callable(FuncIndex::from_u32(0));
    assert_eq!(through_import.vmctx_ptr(), p.vmctx_ptr());
    assert_eq!(through_import.func_index(), func);
}
