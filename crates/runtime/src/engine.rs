//! The per-instantiation module engine.
//!
//! A [`ModuleEngine`] owns the context buffer of one instantiation and
//! performs the linking work around it in two strictly ordered phases:
//!
//! 1. A build phase on `&mut ModuleEngine`: the instantiation orchestrator
//!    resolves every import slot ([`ModuleEngine::resolve_imported_function`],
//!    [`ModuleEngine::resolve_imported_memory`]) and then finalizes the
//!    engine exactly once ([`ModuleEngine::done_instantiation`]), which
//!    runs the context-builder pass for everything knowable from the
//!    module's own instance.
//! 2. A frozen phase behind an [`EngineHandle`]: the buffer is never
//!    written again, and the engine vends function references, callables
//!    and indirect-call lookups from shared references.
//!
//! Because the second phase is only reachable by moving the finished
//! engine into a handle, the write-once contract on the context buffer is
//! part of the API rather than a convention.

use crate::artifact::CompiledModule;
use crate::callable::Callable;
use crate::instance::Instance;
use crate::table::Table;
use crate::traps::Trap;
use crate::vmcontext::{
    OwnedVMContext, Reference, VMContext, VMFuncRef, VMMemoryImport, VMSharedTypeIndex,
};
use corten_environ::{EntityIndex, FuncIndex, Module};
use std::ops::Deref;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

/// Well-formed module graphs are acyclic, but nothing in this layer is
/// structurally prevented from being handed a cyclic one; the walk in
/// `resolve_imported_function` is bounded so that a cycle panics instead
/// of spinning.
const MAX_IMPORT_DEPTH: usize = 1000;

/// Hooks invoked around every call into the module, when the module was
/// compiled with call-hook trampolines.
///
/// The trampolines in the compiled artifact perform the actual dispatch;
/// the engine only retains the hooks so they outlive every call.
pub trait CallHook {
    /// Invoked before a hooked function begins executing.
    fn before_call(&self, instance: &Instance, func: FuncIndex);

    /// Invoked after a hooked function returns.
    fn after_call(&self, instance: &Instance, func: FuncIndex);
}

/// A resolved import slot: the engine that defines the terminal function
/// and the flat function index within it.
///
/// Because resolution collapses re-export chains, the recorded engine is
/// always the defining one, which lets this engine act as a pass-through
/// provider for modules that import from it.
#[derive(Clone)]
pub struct ImportedFunction {
    /// The engine of the defining module.
    pub engine: EngineHandle,
    /// The flat function index within the defining module.
    pub index: FuncIndex,
}

/// The linking state of one module instantiation.
pub struct ModuleEngine {
    artifact: Arc<CompiledModule>,
    instance: Rc<Instance>,
    vmctx: OwnedVMContext,
    imported_functions: Vec<Option<ImportedFunction>>,
    func_refs: Mutex<Vec<Box<VMFuncRef>>>,
    call_hooks: Vec<Rc<dyn CallHook>>,
    finalized: bool,
}

impl ModuleEngine {
    /// Create the engine for one instantiation of `artifact` backed by
    /// `instance`.
    ///
    /// The context buffer starts zeroed; imported fields are filled by the
    /// resolver and everything else by [`Self::done_instantiation`].
    pub fn new(artifact: Arc<CompiledModule>, instance: Rc<Instance>) -> Self {
        let vmctx = OwnedVMContext::new(artifact.offsets());
        let num_imports = artifact.module().num_imported_funcs as usize;
        Self {
            artifact,
            instance,
            vmctx,
            imported_functions: vec![None; num_imports],
            func_refs: Mutex::new(Vec::new()),
            call_hooks: Vec::new(),
            finalized: false,
        }
    }

    /// The static description of the module.
    pub fn module(&self) -> &Module {
        self.artifact.module()
    }

    /// The compiled artifact shared by all instantiations of this module.
    pub fn artifact(&self) -> &Arc<CompiledModule> {
        &self.artifact
    }

    /// The live instance state backing this engine.
    pub fn instance(&self) -> &Rc<Instance> {
        &self.instance
    }

    /// The context buffer of this instantiation.
    pub fn vmctx(&self) -> &OwnedVMContext {
        &self.vmctx
    }

    /// The context-buffer base address handed to compiled code as the
    /// first implicit argument of every entry point.
    pub fn vmctx_ptr(&self) -> *mut VMContext {
        self.vmctx.vmctx_ptr()
    }

    /// Attach call hooks to this instantiation.
    ///
    /// The artifact must have been compiled with call-hook trampolines.
    pub fn set_call_hooks(&mut self, hooks: Vec<Rc<dyn CallHook>>) {
        assert!(
            hooks.is_empty() || self.artifact.has_call_hooks(),
            "module was compiled without call-hook trampolines"
        );
        self.call_hooks = hooks;
    }

    /// The call hooks attached to this instantiation.
    pub fn call_hooks(&self) -> &[Rc<dyn CallHook>] {
        &self.call_hooks
    }

    /// If `index` is an import slot, return its resolved descriptor.
    ///
    /// Panics if the slot has not been resolved yet; the orchestrator
    /// resolves every slot before the engine is used as a provider.
    pub fn imported_function(&self, index: FuncIndex) -> Option<ImportedFunction> {
        if self.module().is_imported_function(index) {
            let resolved = self.imported_functions[index.as_u32() as usize]
                .clone()
                .expect("import slot used before it was resolved");
            Some(resolved)
        } else {
            None
        }
    }

    /// Resolve the imported-function slot `slot` to function
    /// `index_in_provider` of `provider`.
    ///
    /// If the provider's function is itself an import, the already
    /// resolved descriptor chain is followed until the defining module is
    /// reached, so that any depth of re-export collapses to a single
    /// direct (code address, context address, type id) triple in this
    /// engine's context buffer.
    pub fn resolve_imported_function(
        &mut self,
        slot: FuncIndex,
        index_in_provider: FuncIndex,
        provider: &EngineHandle,
    ) {
        assert!(!self.finalized, "imports must be resolved before finalization");
        assert!(
            self.module().is_imported_function(slot),
            "resolving a non-import function index"
        );

        let mut provider = provider.clone();
        let mut index = index_in_provider;
        let mut depth = 0;
        while let Some(forward) = provider.imported_function(index) {
            depth += 1;
            assert!(
                depth <= MAX_IMPORT_DEPTH,
                "import chain longer than {MAX_IMPORT_DEPTH} links; cyclic re-export graph?"
            );
            index = forward.index;
            provider = forward.engine;
        }

        let defined = provider
            .module()
            .defined_func_index(index)
            .expect("terminal provider function is local");
        let code = provider.artifact().code_ptr(defined);
        let type_index = provider.instance().shared_type_id(index);
        log::trace!(
            "resolving import #{} of {:?} to {:?}[{}] (type id {})",
            slot.as_u32(),
            self.module().name,
            provider.module().name,
            index.as_u32(),
            type_index.bits(),
        );

        let offsets = self.artifact.offsets();
        self.vmctx
            .set_imported_function(offsets, slot, code, provider.vmctx_ptr(), type_index);
        self.imported_functions[slot.as_u32() as usize] =
            Some(ImportedFunction { engine: provider, index });
    }

    /// Resolve this module's imported memory against `provider`.
    ///
    /// If the provider's memory is itself imported, its already resolved
    /// owner pair is copied forward, collapsing re-export chains to the
    /// eventual true owner; otherwise the provider's own memory record and
    /// context are the owner pair.
    pub fn resolve_imported_memory(&mut self, provider: &EngineHandle) {
        assert!(!self.finalized, "imports must be resolved before finalization");

        let provider_offsets = provider.artifact().offsets();
        let import = if provider_offsets.vmctx_imported_memory_begin().is_some() {
            provider.vmctx().imported_memory(provider_offsets)
        } else {
            let memory = provider
                .instance()
                .memory()
                .expect("memory provider has no memory instance");
            VMMemoryImport {
                from: memory as *const crate::memory::Memory,
                vmctx: provider.vmctx_ptr(),
            }
        };

        let offsets = self.artifact.offsets();
        self.vmctx.set_imported_memory(offsets, import);
    }

    /// Mark instantiation as complete.
    ///
    /// Must be called exactly once, after every import slot is resolved
    /// and before any function of this module becomes reachable. For
    /// non-host modules this runs the context-builder pass; host modules
    /// use a structurally different context built elsewhere.
    pub fn done_instantiation(&mut self) {
        assert!(!self.finalized, "done_instantiation must run exactly once");
        if !self.module().is_host_module {
            self.setup_vmctx();
        }
        self.finalized = true;
        log::debug!("instantiated module {:?}", self.module().name);
    }

    /// Populate every context field whose source of truth is this module's
    /// own instance: the self-instance address, the local memory
    /// descriptor, global addresses, the type-id table and table
    /// addresses, and the call-hook trampoline tables.
    fn setup_vmctx(&mut self) {
        let artifact = self.artifact.clone();
        let instance = self.instance.clone();
        let offsets = artifact.offsets();

        self.vmctx
            .set_module_instance(offsets, Rc::as_ptr(&instance));

        if offsets.vmctx_local_memory_begin().is_some() {
            let memory = instance
                .memory()
                .expect("module defines a memory but the instance has none");
            self.vmctx.set_local_memory(offsets, memory.vmmemory());
        }

        // Note: imported memory and imported functions are resolved by the
        // import resolver, not here.

        for index in instance.globals().keys() {
            self.vmctx
                .set_global(offsets, index, instance.global_ptr(index));
        }

        if offsets.vmctx_type_ids().is_some() {
            // First the address of the type-id table, then the tables
            // themselves.
            if let Some(type_ids) = instance.type_ids_ptr() {
                self.vmctx.set_type_ids(offsets, type_ids);
            }
            for (index, table) in instance.tables().iter() {
                self.vmctx.set_table(offsets, index, table as *const Table);
            }
        }

        if offsets.vmctx_before_call_hooks().is_some() {
            if let Some((before, after)) = artifact.call_hook_tables() {
                self.vmctx.set_call_hook_tables(offsets, before, after);
            }
        }
    }

    /// Return an opaque, stable reference to the function with the given
    /// flat index, usable as a table element or a first-class `funcref`
    /// value.
    ///
    /// An import slot delegates to the defining engine recorded during
    /// resolution, so the returned reference always identifies a real
    /// owning module and context, never an import record. Two calls for
    /// the same index return distinct references with identical content;
    /// callers must not rely on address identity.
    pub fn func_ref(&self, index: FuncIndex) -> Reference {
        assert!(
            self.finalized,
            "function references requested before done_instantiation"
        );
        if let Some(import) = self.imported_function(index) {
            return import.engine.func_ref(import.index);
        }

        let defined = self
            .module()
            .defined_func_index(index)
            .expect("flat function index out of range");
        let func = Box::new(VMFuncRef {
            code: self.artifact.code_ptr(defined),
            vmctx: self.vmctx.vmctx_ptr(),
            type_index: self.instance.shared_type_id(index),
            func_index: index,
        });
        let reference = Reference::from_func_ref(&func);

        // The cache grows, but entries are individually boxed: published
        // reference values stay valid across appends.
        self.func_refs.lock().unwrap().push(func);
        reference
    }

    /// Look up the target of an indirect call through `table` at
    /// `table_offset`, checking the slot against `expected` before any
    /// code address escapes.
    ///
    /// This is the single enforcement point for indirect-call type
    /// safety; every `call_indirect`-style operation in compiled code
    /// funnels through it. On success, returns the instance owning the
    /// target together with the target's flat function index within it.
    ///
    /// The caller must uphold the engine liveness contract: every module
    /// whose references were stored into `table` is still instantiated.
    pub fn lookup_function(
        &self,
        table: &Table,
        expected: VMSharedTypeIndex,
        table_offset: u32,
    ) -> Result<(&Instance, FuncIndex), Trap> {
        if table.kind() != corten_environ::TableElementKind::FuncRef {
            return Err(Trap::InvalidTableAccess);
        }
        let reference = table.get(table_offset).ok_or(Trap::InvalidTableAccess)?;
        if reference.is_null() {
            return Err(Trap::InvalidTableAccess);
        }

        let func = unsafe { reference.as_func_ref() };
        if func.type_index != expected {
            return Err(Trap::IndirectCallTypeMismatch);
        }
        let instance = unsafe { Instance::from_vmctx(func.vmctx) };
        Ok((instance, func.func_index))
    }
}

/// A shared, frozen handle to a finished [`ModuleEngine`].
///
/// Cloning is cheap; the engine lives until every handle (including the
/// ones recorded inside importing engines) is dropped, which is what keeps
/// addresses embedded in context buffers valid.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Rc<ModuleEngine>,
}

impl EngineHandle {
    /// Freeze a finished engine into a shareable handle.
    ///
    /// From here on the context buffer is never written again.
    pub fn new(engine: ModuleEngine) -> Self {
        assert!(
            engine.finalized,
            "engines must complete done_instantiation before they are shared"
        );
        Self {
            engine: Rc::new(engine),
        }
    }

    /// Produce a native callable handle for the function with the given
    /// flat index.
    ///
    /// Imported indices recurse into the defining engine, so the
    /// callable's executable address and context always belong to the
    /// true defining module.
    pub fn new_callable(&self, index: FuncIndex) -> Callable {
        if let Some(import) = self.engine.imported_function(index) {
            return import.engine.new_callable(import.index);
        }
        Callable::new(self.clone(), index)
    }

    /// Look up an exported function by name and produce a callable for
    /// it.
    pub fn exported_function(&self, name: &str) -> Option<Callable> {
        match self.engine.module().exports.get(name)? {
            EntityIndex::Function(index) => Some(self.new_callable(*index)),
            _ => None,
        }
    }
}

impl Deref for EngineHandle {
    type Target = ModuleEngine;

    fn deref(&self) -> &ModuleEngine {
        &self.engine
    }
}
