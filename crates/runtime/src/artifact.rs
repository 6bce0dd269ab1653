//! The shared, instantiation-independent output of compiling one module.
//!
//! A [`CompiledModule`] is produced once per module by the (external)
//! compiler backend and shared by every instantiation of it. Everything in
//! it is immutable after construction; the executable blob is
//! address-stable, so code addresses computed from it may be embedded into
//! context buffers and function references.

use crate::vmcontext::VMFunctionBody;
use corten_environ::{DefinedFuncIndex, Module, TypeIndex, VMOffsets};
use cranelift_entity::PrimaryMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// Offsets of the shared runtime-support entry points within the
/// executable blob.
///
/// These are compiled once per module and bound into every callable's
/// execution context.
#[derive(Debug, Copy, Clone)]
pub struct SharedTrampolines {
    /// Entry point for growing the linear memory.
    pub memory_grow: u32,
    /// Entry point for growing the native stack.
    pub stack_grow: u32,
    /// Entry point for checking the module exit code.
    pub check_exit: u32,
    /// Entry point for growing a table.
    pub table_grow: u32,
    /// Entry point for materializing a function reference.
    pub ref_func: u32,
}

/// Offsets of the per-function-type call-hook trampolines within the
/// executable blob, present only when the module was compiled with call
/// hooks.
#[derive(Debug, Clone)]
pub struct CallHookOffsets {
    /// One before-call trampoline per type-section entry.
    pub before: Vec<u32>,
    /// One after-call trampoline per type-section entry.
    pub after: Vec<u32>,
}

/// Materialized call-hook trampoline tables: absolute code addresses, one
/// per function type. The context buffer stores their first-element
/// addresses.
#[derive(Debug)]
struct CallHookTables {
    before: Box<[usize]>,
    after: Box<[usize]>,
}

/// A compiled module artifact.
#[derive(Debug)]
pub struct CompiledModule {
    module: Arc<Module>,
    offsets: VMOffsets,
    executable: Box<[u8]>,
    function_offsets: PrimaryMap<DefinedFuncIndex, u32>,
    entry_preambles: PrimaryMap<TypeIndex, u32>,
    trampolines: SharedTrampolines,
    call_hooks: Option<CallHookTables>,
}

impl CompiledModule {
    /// Wrap the compiler backend's output for `module`.
    ///
    /// `function_offsets` locates each defined function's body within
    /// `executable`; `entry_preambles` locates the per-type entry
    /// preamble. Both must cover their sections exactly, and every offset
    /// must fall inside the blob — violations are compiler bugs and panic.
    pub fn new(
        module: Arc<Module>,
        executable: Vec<u8>,
        function_offsets: PrimaryMap<DefinedFuncIndex, u32>,
        entry_preambles: PrimaryMap<TypeIndex, u32>,
        trampolines: SharedTrampolines,
        call_hooks: Option<CallHookOffsets>,
    ) -> Self {
        assert_eq!(
            function_offsets.len(),
            module.functions.len(),
            "one code offset per defined function"
        );
        assert_eq!(
            entry_preambles.len(),
            module.types.len(),
            "one entry preamble per function type"
        );
        let len = executable.len();
        let in_blob = |offset: u32| (offset as usize) < len;
        assert!(function_offsets.values().all(|&offset| in_blob(offset)));
        assert!(entry_preambles.values().all(|&offset| in_blob(offset)));
        for offset in [
            trampolines.memory_grow,
            trampolines.stack_grow,
            trampolines.check_exit,
            trampolines.table_grow,
            trampolines.ref_func,
        ] {
            assert!(in_blob(offset), "trampoline offset outside executable");
        }

        let offsets = VMOffsets::new(&module, call_hooks.is_some());
        let executable = executable.into_boxed_slice();

        // The hook tables hold absolute addresses, so they can only be
        // materialized once the blob has its final allocation.
        let base = executable.as_ptr() as usize;
        let call_hooks = call_hooks.map(|hooks| {
            assert_eq!(hooks.before.len(), module.types.len());
            assert_eq!(hooks.after.len(), module.types.len());
            let materialize = |entries: &[u32]| {
                entries
                    .iter()
                    .map(|&offset| {
                        assert!(in_blob(offset));
                        base + offset as usize
                    })
                    .collect::<Box<[usize]>>()
            };
            CallHookTables {
                before: materialize(&hooks.before),
                after: materialize(&hooks.after),
            }
        });

        Self {
            module,
            offsets,
            executable,
            function_offsets,
            entry_preambles,
            trampolines,
            call_hooks,
        }
    }

    /// The static description of the compiled module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// A shared handle to the static description.
    pub fn shared_module(&self) -> &Arc<Module> {
        &self.module
    }

    /// The context-buffer layout for this module shape.
    pub fn offsets(&self) -> &VMOffsets {
        &self.offsets
    }

    fn code_at(&self, offset: u32) -> NonNull<VMFunctionBody> {
        NonNull::new(self.executable[offset as usize..].as_ptr() as *mut VMFunctionBody).unwrap()
    }

    /// The code address of the defined function at `index`.
    pub fn code_ptr(&self, index: DefinedFuncIndex) -> NonNull<VMFunctionBody> {
        self.code_at(self.function_offsets[index])
    }

    /// The entry-preamble address for the function type at `index`.
    pub fn entry_preamble(&self, index: TypeIndex) -> NonNull<VMFunctionBody> {
        self.code_at(self.entry_preambles[index])
    }

    /// The memory-growth trampoline.
    pub fn memory_grow_trampoline(&self) -> NonNull<VMFunctionBody> {
        self.code_at(self.trampolines.memory_grow)
    }

    /// The stack-growth trampoline.
    pub fn stack_grow_trampoline(&self) -> NonNull<VMFunctionBody> {
        self.code_at(self.trampolines.stack_grow)
    }

    /// The exit-code-check trampoline.
    pub fn check_exit_trampoline(&self) -> NonNull<VMFunctionBody> {
        self.code_at(self.trampolines.check_exit)
    }

    /// The table-growth trampoline.
    pub fn table_grow_trampoline(&self) -> NonNull<VMFunctionBody> {
        self.code_at(self.trampolines.table_grow)
    }

    /// The reference-function-lookup trampoline.
    pub fn ref_func_trampoline(&self) -> NonNull<VMFunctionBody> {
        self.code_at(self.trampolines.ref_func)
    }

    /// Whether this module was compiled with call hooks.
    pub fn has_call_hooks(&self) -> bool {
        self.call_hooks.is_some()
    }

    /// The first-element addresses of the (before, after) call-hook
    /// trampoline tables, if the module was compiled with call hooks and
    /// has at least one function type.
    pub fn call_hook_tables(&self) -> Option<(usize, usize)> {
        self.call_hooks.as_ref().and_then(|tables| {
            if tables.before.is_empty() {
                None
            } else {
                Some((
                    tables.before.as_ptr() as usize,
                    tables.after.as_ptr() as usize,
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corten_environ::{FuncType, ValType};

    fn small_module() -> Arc<Module> {
        let mut module = Module::new();
        let ty = module.types.push(FuncType::new(&[ValType::I32], &[]));
        module.push_function(ty);
        Arc::new(module)
    }

    fn blob() -> Vec<u8> {
        vec![0xcc; 64]
    }

    fn trampolines() -> SharedTrampolines {
        SharedTrampolines {
            memory_grow: 32,
            stack_grow: 36,
            check_exit: 40,
            table_grow: 44,
            ref_func: 48,
        }
    }

    #[test]
    fn code_pointers_index_the_blob() {
        let mut function_offsets = PrimaryMap::new();
        function_offsets.push(8u32);
        let mut entry_preambles = PrimaryMap::new();
        entry_preambles.push(16u32);

        let compiled = CompiledModule::new(
            small_module(),
            blob(),
            function_offsets,
            entry_preambles,
            trampolines(),
            None,
        );

        let base = compiled.executable.as_ptr() as usize;
        let defined = DefinedFuncIndex::from_u32(0);
        assert_eq!(compiled.code_ptr(defined).as_ptr() as usize, base + 8);
        assert_eq!(
            compiled.entry_preamble(TypeIndex::from_u32(0)).as_ptr() as usize,
            base + 16
        );
        assert_eq!(
            compiled.memory_grow_trampoline().as_ptr() as usize,
            base + 32
        );
        assert!(compiled.call_hook_tables().is_none());
    }

    #[test]
    fn call_hook_tables_hold_absolute_addresses() {
        let mut function_offsets = PrimaryMap::new();
        function_offsets.push(0u32);
        let mut entry_preambles = PrimaryMap::new();
        entry_preambles.push(4u32);

        let compiled = CompiledModule::new(
            small_module(),
            blob(),
            function_offsets,
            entry_preambles,
            trampolines(),
            Some(CallHookOffsets {
                before: vec![20],
                after: vec![24],
            }),
        );

        let base = compiled.executable.as_ptr() as usize;
        let (before, after) = compiled.call_hook_tables().unwrap();
        assert_eq!(unsafe { *(before as *const usize) }, base + 20);
        assert_eq!(unsafe { *(after as *const usize) }, base + 24);
    }

    #[test]
    #[should_panic(expected = "one code offset per defined function")]
    fn mismatched_offset_table_is_rejected() {
        CompiledModule::new(
            small_module(),
            blob(),
            PrimaryMap::new(),
            PrimaryMap::new(),
            trampolines(),
            None,
        );
    }
}
