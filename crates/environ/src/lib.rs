//! Compile-time environment for the Corten engine.
//!
//! This crate holds everything about a module that is knowable before any
//! instantiation exists: the entity index spaces, the static module
//! description produced by the (external) decoder/validator, and the
//! [`VMOffsets`] layout of the per-instantiation context buffer that
//! compiled code reads at run time.
//!
//! Nothing in this crate owns run-time state; the `corten-runtime` crate
//! builds on these descriptions.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod indices;
mod module;
mod vmoffsets;

pub use crate::indices::{DefinedFuncIndex, FuncIndex, GlobalIndex, TableIndex, TypeIndex};
pub use crate::module::{
    EntityIndex, FuncType, Global, Import, ImportKind, MemoryPlan, Module, TableElementKind,
    TablePlan, ValType,
};
pub use crate::vmoffsets::{VMOffsets, SLOT_SIZE};

/// WebAssembly page sizes are defined to be 64KiB.
pub const WASM_PAGE_SIZE: u32 = 0x10000;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
