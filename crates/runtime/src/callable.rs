//! Host-facing callable handles.
//!
//! A [`Callable`] bundles everything the (external) call-execution engine
//! needs to invoke one function: the code and entry-preamble addresses,
//! the argument/result buffer size, and the shared runtime-support
//! trampolines bound into an [`ExecutionContext`]. The actual call —
//! argument marshalling, stack growth, the native jump — happens outside
//! this crate.

use crate::engine::EngineHandle;
use crate::vmcontext::{VMContext, VMFunctionBody};
use corten_environ::FuncIndex;
use std::ptr::NonNull;

/// The shared runtime-support entry points bound into a callable, read by
/// compiled code during the call.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct ExecutionContext {
    /// Trampoline for growing the linear memory.
    pub memory_grow_trampoline: NonNull<VMFunctionBody>,
    /// Trampoline for growing the native stack.
    pub stack_grow_trampoline: NonNull<VMFunctionBody>,
    /// Trampoline for checking the module exit code.
    pub check_exit_trampoline: NonNull<VMFunctionBody>,
    /// Trampoline for growing a table.
    pub table_grow_trampoline: NonNull<VMFunctionBody>,
    /// Trampoline for materializing a function reference.
    pub ref_func_trampoline: NonNull<VMFunctionBody>,
}

/// A callable view of one exported or referenced function.
///
/// The handle keeps the defining engine alive, so every address it
/// carries stays valid for as long as the callable exists.
pub struct Callable {
    engine: EngineHandle,
    index: FuncIndex,
    executable: NonNull<VMFunctionBody>,
    preamble: NonNull<VMFunctionBody>,
    required_params: u32,
    result_count: u32,
    param_result_slots: u32,
    execution_context: ExecutionContext,
}

impl Callable {
    /// Build a callable for a locally defined function of `engine`.
    ///
    /// Import slots are collapsed by `EngineHandle::new_callable` before
    /// this runs.
    pub(crate) fn new(engine: EngineHandle, index: FuncIndex) -> Callable {
        let (executable, preamble, required_params, result_count, execution_context) = {
            let module = engine.module();
            let defined = module
                .defined_func_index(index)
                .expect("callables are built on the defining engine");
            let type_index = module.functions[defined];
            let ty = &module.types[type_index];

            let artifact = engine.artifact();
            (
                artifact.code_ptr(defined),
                artifact.entry_preamble(type_index),
                ty.param_slots(),
                ty.result_slots(),
                ExecutionContext {
                    memory_grow_trampoline: artifact.memory_grow_trampoline(),
                    stack_grow_trampoline: artifact.stack_grow_trampoline(),
                    check_exit_trampoline: artifact.check_exit_trampoline(),
                    table_grow_trampoline: artifact.table_grow_trampoline(),
                    ref_func_trampoline: artifact.ref_func_trampoline(),
                },
            )
        };
        // The call frame reuses one buffer for arguments and results, so
        // it must be sized for whichever is larger.
        let param_result_slots = required_params.max(result_count);
        Callable {
            engine,
            index,
            executable,
            preamble,
            required_params,
            result_count,
            param_result_slots,
            execution_context,
        }
    }

    /// The engine of the defining module.
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// The flat function index within the defining module.
    pub fn func_index(&self) -> FuncIndex {
        self.index
    }

    /// The code address of the function body.
    pub fn executable(&self) -> NonNull<VMFunctionBody> {
        self.executable
    }

    /// The entry-preamble address for the function's type.
    pub fn preamble(&self) -> NonNull<VMFunctionBody> {
        self.preamble
    }

    /// The number of 64-bit parameter slots the caller must fill.
    pub fn required_params(&self) -> u32 {
        self.required_params
    }

    /// The number of 64-bit result slots the call produces.
    pub fn result_count(&self) -> u32 {
        self.result_count
    }

    /// The size, in 64-bit slots, of the shared argument/result buffer.
    pub fn param_result_slots(&self) -> u32 {
        self.param_result_slots
    }

    /// The bound runtime-support trampolines.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution_context
    }

    /// The context-buffer base address of the defining instantiation,
    /// passed as the first implicit argument of the entry point.
    pub fn vmctx_ptr(&self) -> *mut VMContext {
        self.engine.vmctx_ptr()
    }
}
