//! Entity index types for the module index spaces.
//!
//! Function indices come in two flavors: [`FuncIndex`] ranges over the flat
//! index space mandated by the module format (imported functions first,
//! locally defined functions after them), while [`DefinedFuncIndex`] ranges
//! over locally defined functions only. Conversions between the two live on
//! [`crate::Module`], since they need the module's import count.

use cranelift_entity::entity_impl;

/// Index of a function type within the module's type section.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TypeIndex(u32);
entity_impl!(TypeIndex);

/// Index of a function in the flat function index space.
///
/// Imported functions occupy indices `0..num_imported_funcs`; locally
/// defined functions follow.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex);

/// Index of a locally defined function, i.e. one with a body in this
/// module's compiled artifact.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct DefinedFuncIndex(u32);
entity_impl!(DefinedFuncIndex);

/// Index of a global variable, in declaration order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct GlobalIndex(u32);
entity_impl!(GlobalIndex);

/// Index of a table, in declaration order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TableIndex(u32);
entity_impl!(TableIndex);
