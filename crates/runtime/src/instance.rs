//! Live state of one module instantiation: its memory, globals, tables and
//! function-type-id table.
//!
//! An `Instance` is owned by the instantiation driver and referenced by
//! the module engine; the engine embeds addresses of the records below
//! into its context buffer, so all of them live in storage that never
//! moves for the instance's lifetime (an `Rc` allocation holding boxed
//! slices).

use crate::memory::Memory;
use crate::table::Table;
use crate::vmcontext::{VMContext, VMGlobalDefinition, VMSharedTypeIndex};
use corten_environ::{FuncIndex, GlobalIndex, Module, TableIndex, TypeIndex};
use cranelift_entity::{BoxedSlice, EntityRef, PrimaryMap};
use std::fmt;
use std::ptr;
use std::sync::Arc;

/// A module instance: the runtime state referenced by compiled code,
/// excluding the context buffer itself.
pub struct Instance {
    module: Arc<Module>,
    memory: Option<Memory>,
    globals: BoxedSlice<GlobalIndex, VMGlobalDefinition>,
    tables: BoxedSlice<TableIndex, Table>,
    type_ids: BoxedSlice<TypeIndex, VMSharedTypeIndex>,
}

impl Instance {
    /// Create the runtime state for one instantiation of `module`.
    ///
    /// `type_ids` maps the module's type section to process-wide interned
    /// ids; see `TypeRegistry::register_module`. Memory, globals and
    /// tables are created per the module's plans; the driver initializes
    /// their contents before handing the instance to a module engine.
    pub fn new(module: Arc<Module>, type_ids: BoxedSlice<TypeIndex, VMSharedTypeIndex>) -> Self {
        assert_eq!(
            type_ids.len(),
            module.types.len(),
            "one interned type id per type-section entry"
        );
        let memory = module.memory.as_ref().map(Memory::new);
        let globals = create_globals(&module);
        let tables = create_tables(&module);
        Self {
            module,
            memory,
            globals,
            tables,
            type_ids,
        }
    }

    /// The static description this instance was created from.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The locally defined memory, if the module declares one.
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    /// Mutable access to the locally defined memory, for initialization
    /// and growth.
    pub fn memory_mut(&mut self) -> Option<&mut Memory> {
        self.memory.as_mut()
    }

    /// All global storage records.
    pub fn globals(&self) -> &BoxedSlice<GlobalIndex, VMGlobalDefinition> {
        &self.globals
    }

    /// The address of the global at `index`, as embedded into the context
    /// buffer.
    pub fn global_ptr(&self, index: GlobalIndex) -> *const VMGlobalDefinition {
        &self.globals[index]
    }

    /// Mutable access to the global at `index`, for initialization.
    pub fn global_mut(&mut self, index: GlobalIndex) -> &mut VMGlobalDefinition {
        &mut self.globals[index]
    }

    /// All table records.
    pub fn tables(&self) -> &BoxedSlice<TableIndex, Table> {
        &self.tables
    }

    /// The table at `index`.
    pub fn table(&self, index: TableIndex) -> &Table {
        &self.tables[index]
    }

    /// The interned type ids of the module's type section.
    pub fn type_ids(&self) -> &BoxedSlice<TypeIndex, VMSharedTypeIndex> {
        &self.type_ids
    }

    /// The first-element address of the type-id table, if it is non-empty.
    pub fn type_ids_ptr(&self) -> Option<*const VMSharedTypeIndex> {
        self.type_ids
            .get(TypeIndex::new(0))
            .map(|id| id as *const VMSharedTypeIndex)
    }

    /// Return the interned type id of the function with the given flat
    /// index, whether imported or defined.
    pub fn shared_type_id(&self, index: FuncIndex) -> VMSharedTypeIndex {
        self.type_ids[self.module.func_type_index(index)]
    }

    /// Recover the instance whose address a context buffer stores in its
    /// first field.
    ///
    /// # Safety
    ///
    /// `vmctx` must be the base address of a context buffer whose
    /// context-builder pass has run, and the instantiation that owns it
    /// must still be live.
    pub unsafe fn from_vmctx<'a>(vmctx: *mut VMContext) -> &'a Instance {
        let mut raw = [0; 8];
        ptr::copy_nonoverlapping(vmctx as *const u8, raw.as_mut_ptr(), 8);
        let instance = u64::from_le_bytes(raw) as usize as *const Instance;
        debug_assert!(!instance.is_null(), "context buffer was never finalized");
        &*instance
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("module", &self.module.name)
            .field("memory", &self.memory)
            .field("globals", &self.globals.len())
            .field("tables", &self.tables.len())
            .field("type_ids", &self.type_ids.len())
            .finish()
    }
}

/// Allocate storage for just the globals of the current module, zeroed.
fn create_globals(module: &Module) -> BoxedSlice<GlobalIndex, VMGlobalDefinition> {
    let mut globals = PrimaryMap::with_capacity(module.globals.len());
    for _ in module.globals.values() {
        globals.push(VMGlobalDefinition::new());
    }
    globals.into_boxed_slice()
}

/// Allocate storage for just the tables of the current module.
fn create_tables(module: &Module) -> BoxedSlice<TableIndex, Table> {
    let mut tables = PrimaryMap::with_capacity(module.tables.len());
    for plan in module.tables.values() {
        tables.push(Table::new(plan));
    }
    tables.into_boxed_slice()
}
