//! Offsets of the fields compiled code reads out of the per-instantiation
//! context buffer.
//!
//! The buffer layout is fixed per compiled module and identical for every
//! instantiation of it:
//!
//! ```text
//! struct VMContext {
//!     module_instance:    *const Instance,
//!     local_memory_base:  *mut u8,               // only if the module defines a memory
//!     local_memory_len:   u64,                   //   "
//!     imported_memory:    (*const Memory, *mut VMContext), // only if the memory is imported
//!     imported_functions: [(code, vmctx, type_id); num_imported_functions],
//!     globals:            [*const VMGlobalDefinition; num_globals],
//!     type_ids:           *const VMSharedTypeIndex, // only if the module has tables
//!     tables:             [*const Table; num_tables],
//!     before_call_hooks:  *const usize,          // only if call hooks are configured
//!     after_call_hooks:   *const usize,          //   "
//! }
//! ```
//!
//! Every field is an 8-byte slot; the layout targets 64-bit hosts, which is
//! all the compiler backend supports. Absent fields occupy no space at all
//! and their accessors return `None` — there is no sentinel value to
//! accidentally dereference.

use crate::indices::{FuncIndex, GlobalIndex, TableIndex};
use crate::module::Module;

/// The size of one context-buffer field, in bytes.
pub const SLOT_SIZE: u32 = 8;

/// This class computes offsets to fields within the context buffer that
/// compiled code accesses directly.
#[derive(Debug, Clone)]
pub struct VMOffsets {
    /// The number of imported functions in the module.
    pub num_imported_functions: u32,
    /// The number of globals in the module.
    pub num_globals: u32,
    /// The number of tables in the module.
    pub num_tables: u32,

    // precalculated offsets of the member fields
    local_memory: Option<u32>,
    imported_memory: Option<u32>,
    imported_functions: u32,
    globals: u32,
    type_ids: Option<u32>,
    tables: u32,
    before_call_hooks: Option<u32>,
    after_call_hooks: Option<u32>,
    size: u32,
}

// Convenience functions for checked addition and multiplication, so an
// overflowing module shape fails loudly instead of wrapping into a bogus
// layout.
#[inline]
fn cadd(a: u32, b: u32) -> u32 {
    a.checked_add(b).unwrap()
}

#[inline]
fn cmul(count: u32, size: u32) -> u32 {
    count.checked_mul(size).unwrap()
}

impl VMOffsets {
    /// Compute the layout for the given module shape.
    ///
    /// `with_call_hooks` must be true exactly when the compiled artifact
    /// carries call-hook trampoline tables.
    pub fn new(module: &Module, with_call_hooks: bool) -> Self {
        let num_imported_functions = module.num_imported_funcs;
        let num_globals = u32::try_from(module.globals.len()).unwrap();
        let num_tables = u32::try_from(module.tables.len()).unwrap();

        // The module-instance pointer always occupies the first slot.
        let mut next = SLOT_SIZE;

        let local_memory = if module.defines_memory() {
            let offset = next;
            next = cadd(next, 2 * SLOT_SIZE);
            Some(offset)
        } else {
            None
        };

        let imported_memory = if module.imports_memory() {
            let offset = next;
            next = cadd(next, 2 * SLOT_SIZE);
            Some(offset)
        } else {
            None
        };

        let imported_functions = next;
        next = cadd(
            next,
            cmul(num_imported_functions, Self::size_of_imported_function()),
        );

        let globals = next;
        next = cadd(next, cmul(num_globals, SLOT_SIZE));

        let type_ids = if num_tables > 0 {
            let offset = next;
            next = cadd(next, SLOT_SIZE);
            Some(offset)
        } else {
            None
        };

        let tables = next;
        next = cadd(next, cmul(num_tables, SLOT_SIZE));

        let (before_call_hooks, after_call_hooks) = if with_call_hooks {
            let before = next;
            next = cadd(next, SLOT_SIZE);
            let after = next;
            next = cadd(next, SLOT_SIZE);
            (Some(before), Some(after))
        } else {
            (None, None)
        };

        Self {
            num_imported_functions,
            num_globals,
            num_tables,
            local_memory,
            imported_memory,
            imported_functions,
            globals,
            type_ids,
            tables,
            before_call_hooks,
            after_call_hooks,
            size: next,
        }
    }

    /// The size of one imported-function entry: a (code address, context
    /// address, type id) triple.
    #[inline]
    pub const fn size_of_imported_function() -> u32 {
        3 * SLOT_SIZE
    }

    /// The offset of the module-instance pointer.
    #[inline]
    pub fn vmctx_module_instance(&self) -> u32 {
        0
    }

    /// The offset of the locally defined memory descriptor: base address at
    /// the returned offset, byte length one slot after it.
    ///
    /// `None` if this module does not define its own memory.
    #[inline]
    pub fn vmctx_local_memory_begin(&self) -> Option<u32> {
        self.local_memory
    }

    /// The offset of the imported-memory owner pair: owner memory-instance
    /// address at the returned offset, owner context address one slot after
    /// it.
    ///
    /// `None` if this module does not import its memory.
    #[inline]
    pub fn vmctx_imported_memory_begin(&self) -> Option<u32> {
        self.imported_memory
    }

    /// The offset of the imported-function entries.
    #[inline]
    pub fn vmctx_imported_functions_begin(&self) -> u32 {
        self.imported_functions
    }

    /// Return the offsets of the (code address, context address, type id)
    /// triple for the imported function at `index`.
    #[inline]
    pub fn vmctx_imported_function(&self, index: FuncIndex) -> (u32, u32, u32) {
        assert!(index.as_u32() < self.num_imported_functions);
        let begin = cadd(
            self.imported_functions,
            cmul(index.as_u32(), Self::size_of_imported_function()),
        );
        (begin, begin + SLOT_SIZE, begin + 2 * SLOT_SIZE)
    }

    /// The offset of the global-address array.
    #[inline]
    pub fn vmctx_globals_begin(&self) -> u32 {
        self.globals
    }

    /// Return the offset of the address of the global at `index`.
    #[inline]
    pub fn vmctx_global(&self, index: GlobalIndex) -> u32 {
        assert!(index.as_u32() < self.num_globals);
        cadd(self.globals, cmul(index.as_u32(), SLOT_SIZE))
    }

    /// The offset of the pointer to the first element of the instance's
    /// function-type-id table.
    ///
    /// `None` if this module has no tables; without tables no indirect
    /// call can happen and compiled code never reads the type-id table.
    #[inline]
    pub fn vmctx_type_ids(&self) -> Option<u32> {
        self.type_ids
    }

    /// The offset of the table-address array.
    #[inline]
    pub fn vmctx_tables_begin(&self) -> u32 {
        self.tables
    }

    /// Return the offset of the address of the table at `index`.
    #[inline]
    pub fn vmctx_table(&self, index: TableIndex) -> u32 {
        assert!(index.as_u32() < self.num_tables);
        cadd(self.tables, cmul(index.as_u32(), SLOT_SIZE))
    }

    /// The offset of the first-element address of the before-call hook
    /// trampoline table, if call hooks are configured.
    #[inline]
    pub fn vmctx_before_call_hooks(&self) -> Option<u32> {
        self.before_call_hooks
    }

    /// The offset of the first-element address of the after-call hook
    /// trampoline table, if call hooks are configured.
    #[inline]
    pub fn vmctx_after_call_hooks(&self) -> Option<u32> {
        self.after_call_hooks
    }

    /// Return the total size of the context buffer.
    #[inline]
    pub fn size_of_vmctx(&self) -> u32 {
        self.size
    }
}
