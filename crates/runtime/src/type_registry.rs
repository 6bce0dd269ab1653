//! Implement a registry of function types, for fast indirect call
//! signature checking.

use crate::vmcontext::VMSharedTypeIndex;
use corten_environ::{FuncType, Module, TypeIndex};
use cranelift_entity::{BoxedSlice, PrimaryMap};
use std::collections::{hash_map, HashMap};

/// WebAssembly requires that the caller and callee signatures in an
/// indirect call must match. To implement this efficiently, keep a
/// registry of all types, shared by all instantiations, so that call
/// sites can just do an index comparison.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<FuncType, VMSharedTypeIndex>,
}

impl TypeRegistry {
    /// Create a new `TypeRegistry`.
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Register a function type and return its unique index.
    pub fn register(&mut self, ty: &FuncType) -> VMSharedTypeIndex {
        let len = self.types.len();
        match self.types.entry(ty.clone()) {
            hash_map::Entry::Occupied(entry) => *entry.get(),
            hash_map::Entry::Vacant(entry) => {
                // Keep the registry below 2**32 - 1 entries:
                // VMSharedTypeIndex::new(u32::MAX) is reserved for
                // VMSharedTypeIndex::default().
                debug_assert!(len < u32::MAX as usize);
                let id = VMSharedTypeIndex::new(u32::try_from(len).unwrap());
                log::trace!("registering function type {ty:?} as {id:?}");
                entry.insert(id);
                id
            }
        }
    }

    /// Register every entry of a module's type section and return the
    /// type-id table its instances hold.
    pub fn register_module(&mut self, module: &Module) -> BoxedSlice<TypeIndex, VMSharedTypeIndex> {
        module
            .types
            .values()
            .map(|ty| self.register(ty))
            .collect::<PrimaryMap<TypeIndex, _>>()
            .into_boxed_slice()
    }
}
