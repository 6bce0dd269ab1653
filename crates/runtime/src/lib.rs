//! Runtime linking support for the Corten engine.
//!
//! This crate builds, per module instantiation, the flat context buffer
//! that compiled native code uses to reach the module's own memory,
//! globals and tables, to call into other modules' exported functions,
//! and to perform type-checked indirect calls through function tables.
//!
//! The instantiation orchestrator drives it in order: create a
//! [`ModuleEngine`] over a [`CompiledModule`] and an [`Instance`], resolve
//! every import slot, call [`ModuleEngine::done_instantiation`], and
//! freeze the result into an [`EngineHandle`]. The handle then vends
//! opaque function [`Reference`]s for table slots and `funcref` values,
//! [`Callable`]s for hosts, and the indirect-call lookup that compiled
//! call sites funnel through.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod artifact;
mod callable;
mod engine;
mod instance;
mod memory;
mod table;
mod traps;
mod type_registry;
mod vmcontext;

pub use crate::artifact::{CallHookOffsets, CompiledModule, SharedTrampolines};
pub use crate::callable::{Callable, ExecutionContext};
pub use crate::engine::{CallHook, EngineHandle, ImportedFunction, ModuleEngine};
pub use crate::instance::Instance;
pub use crate::memory::Memory;
pub use crate::table::Table;
pub use crate::traps::Trap;
pub use crate::type_registry::TypeRegistry;
pub use crate::vmcontext::{
    OwnedVMContext, Reference, VMContext, VMFuncRef, VMFunctionBody, VMGlobalDefinition,
    VMMemoryDefinition, VMMemoryImport, VMSharedTypeIndex,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
