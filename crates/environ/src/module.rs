//! Data structures for representing decoded wasm modules.

use crate::indices::{DefinedFuncIndex, FuncIndex, GlobalIndex, TableIndex, TypeIndex};
use cranelift_entity::PrimaryMap;
use indexmap::IndexMap;

/// The type of a WebAssembly value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ValType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 128-bit vector.
    V128,
    /// A reference to a function.
    FuncRef,
    /// A reference to a host object.
    ExternRef,
}

impl ValType {
    /// The number of 64-bit slots a value of this type occupies in an
    /// argument/result buffer.
    pub fn slot_count(self) -> u32 {
        match self {
            ValType::V128 => 2,
            _ => 1,
        }
    }
}

/// The type of a WebAssembly function.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FuncType {
    /// Parameter types, in order.
    pub params: Box<[ValType]>,
    /// Result types, in order.
    pub results: Box<[ValType]>,
}

impl FuncType {
    /// Create a new function type.
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// The number of 64-bit slots the parameters occupy.
    pub fn param_slots(&self) -> u32 {
        self.params.iter().map(|ty| ty.slot_count()).sum()
    }

    /// The number of 64-bit slots the results occupy.
    pub fn result_slots(&self) -> u32 {
        self.results.iter().map(|ty| ty.slot_count()).sum()
    }
}

/// A WebAssembly global variable declaration.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Global {
    /// The type of the value stored in the global.
    pub ty: ValType,
    /// Whether the global is mutable.
    pub mutable: bool,
}

/// A WebAssembly linear memory description.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct MemoryPlan {
    /// The initial size, in wasm pages.
    pub minimum: u32,
    /// The maximum size, in wasm pages, if any.
    pub maximum: Option<u32>,
}

/// The kind of element a table holds.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TableElementKind {
    /// Function references; the only kind an indirect call may go through.
    FuncRef,
    /// References to host objects.
    ExternRef,
}

/// A WebAssembly table description.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TablePlan {
    /// The kind of element the table holds.
    pub kind: TableElementKind,
    /// The initial number of elements.
    pub minimum: u32,
    /// The maximum number of elements, if any.
    pub maximum: Option<u32>,
}

/// The kind of entity an import provides.
#[derive(Clone, Debug)]
pub enum ImportKind {
    /// A function with the given type.
    Function(TypeIndex),
    /// A linear memory.
    Memory(MemoryPlan),
    /// A table.
    Table(TablePlan),
    /// A global variable.
    Global(Global),
}

/// A single entry of the module's import section.
#[derive(Clone, Debug)]
pub struct Import {
    /// The name of the module the entity is imported from.
    pub module: String,
    /// The name of the entity within that module.
    pub field: String,
    /// What is being imported.
    pub kind: ImportKind,
}

/// An index of an entity in one of the module index spaces, used for
/// exports.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EntityIndex {
    /// An exported function.
    Function(FuncIndex),
    /// An exported table.
    Table(TableIndex),
    /// The exported linear memory.
    Memory,
    /// An exported global.
    Global(GlobalIndex),
}

/// A translated WebAssembly module, excluding code and instantiation state.
///
/// This is the static description produced by the (external) decoder and
/// validator. Fields are public; the helpers below implement the index
/// arithmetic between the flat function index space and the separate
/// imported/defined storage.
#[derive(Clone, Debug)]
pub struct Module {
    /// An optional module name, for diagnostics.
    pub name: Option<String>,

    /// The type section.
    pub types: PrimaryMap<TypeIndex, FuncType>,

    /// The import section, all kinds mixed, in declaration order.
    pub imports: Vec<Import>,

    /// The number of function-kind entries in `imports`.
    pub num_imported_funcs: u32,

    /// Types of locally defined functions, in declaration order.
    pub functions: PrimaryMap<DefinedFuncIndex, TypeIndex>,

    /// The locally defined linear memory, if the module declares one.
    ///
    /// An imported memory appears in `imports` instead; a module never has
    /// both.
    pub memory: Option<MemoryPlan>,

    /// All global variables, in declaration order.
    pub globals: PrimaryMap<GlobalIndex, Global>,

    /// All tables, in declaration order.
    pub tables: PrimaryMap<TableIndex, TablePlan>,

    /// The export section.
    pub exports: IndexMap<String, EntityIndex>,

    /// Whether this module is provided by the host rather than compiled.
    ///
    /// Host modules use a structurally different context and skip the
    /// context-builder pass.
    pub is_host_module: bool,
}

impl Module {
    /// Create an empty module.
    pub fn new() -> Self {
        Self {
            name: None,
            types: PrimaryMap::new(),
            imports: Vec::new(),
            num_imported_funcs: 0,
            functions: PrimaryMap::new(),
            memory: None,
            globals: PrimaryMap::new(),
            tables: PrimaryMap::new(),
            exports: IndexMap::new(),
            is_host_module: false,
        }
    }

    /// Append a function import and return its flat function index.
    ///
    /// The module format requires imports to precede defined functions, so
    /// this must not be called once `functions` is non-empty.
    pub fn push_imported_function(&mut self, module: &str, field: &str, ty: TypeIndex) -> FuncIndex {
        assert!(
            self.functions.is_empty(),
            "function imports must precede defined functions"
        );
        let index = FuncIndex::from_u32(self.num_imported_funcs);
        self.imports.push(Import {
            module: module.to_string(),
            field: field.to_string(),
            kind: ImportKind::Function(ty),
        });
        self.num_imported_funcs += 1;
        index
    }

    /// Append a locally defined function and return its flat function index.
    pub fn push_function(&mut self, ty: TypeIndex) -> FuncIndex {
        let defined = self.functions.push(ty);
        self.func_index(defined)
    }

    /// Convert a flat function index into an index of a locally defined
    /// function, or `None` if the index refers to an import.
    pub fn defined_func_index(&self, func: FuncIndex) -> Option<DefinedFuncIndex> {
        if func.as_u32() < self.num_imported_funcs {
            None
        } else {
            Some(DefinedFuncIndex::from_u32(
                func.as_u32() - self.num_imported_funcs,
            ))
        }
    }

    /// Convert an index of a locally defined function into its flat
    /// function index.
    pub fn func_index(&self, defined: DefinedFuncIndex) -> FuncIndex {
        FuncIndex::from_u32(self.num_imported_funcs + defined.as_u32())
    }

    /// Test whether the given flat function index is for an imported
    /// function.
    pub fn is_imported_function(&self, func: FuncIndex) -> bool {
        func.as_u32() < self.num_imported_funcs
    }

    /// Return the type index of the function with the given flat index.
    ///
    /// For a defined function this consults the function section; for an
    /// imported one it scans the import section counting only
    /// function-kind entries, since the flat space numbers those
    /// separately from memories, tables and globals.
    pub fn func_type_index(&self, func: FuncIndex) -> TypeIndex {
        if let Some(defined) = self.defined_func_index(func) {
            self.functions[defined]
        } else {
            let mut seen = 0;
            for import in &self.imports {
                if let ImportKind::Function(ty) = import.kind {
                    if seen == func.as_u32() {
                        return ty;
                    }
                    seen += 1;
                }
            }
            panic!("no import entry for function index {}", func.as_u32());
        }
    }

    /// Return the type of the function with the given flat index.
    pub fn func_type(&self, func: FuncIndex) -> &FuncType {
        &self.types[self.func_type_index(func)]
    }

    /// Whether this module declares its own linear memory.
    pub fn defines_memory(&self) -> bool {
        self.memory.is_some()
    }

    /// Whether this module imports its linear memory.
    pub fn imports_memory(&self) -> bool {
        self.imports
            .iter()
            .any(|import| matches!(import.kind, ImportKind::Memory(_)))
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
