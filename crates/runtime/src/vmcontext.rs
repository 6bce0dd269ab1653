//! This file declares the context buffer and the related structs whose
//! layout compiled wasm code relies on.
//!
//! The context buffer is a flat byte region sized and laid out by
//! [`VMOffsets`] once per compiled module. The runtime never aliases
//! through it: every field is written exactly once, through the typed
//! accessors of [`OwnedVMContext`], during the single-threaded build phase
//! of an instantiation. Compiled code then reads the fields directly as
//! little-endian 8-byte slots.

use crate::instance::Instance;
use crate::table::Table;
use corten_environ::{FuncIndex, GlobalIndex, TableIndex, VMOffsets, SLOT_SIZE};
use std::marker;
use std::ptr::{self, NonNull};

/// An opaque marker type standing for the context buffer in pointer types.
///
/// Pointers to it are produced by [`OwnedVMContext::vmctx_ptr`] and handed
/// to compiled code as the first implicit argument of every entry point.
#[derive(Debug)]
#[repr(C, align(8))]
pub struct VMContext {
    /// The buffer transitively contains pointers back to the structures
    /// that own it, so make sure the compiler never assumes otherwise.
    pub _marker: marker::PhantomPinned,
}

/// A placeholder byte-sized type which is just used to provide some amount
/// of type safety when dealing with pointers to compiled function bodies.
#[repr(C)]
pub struct VMFunctionBody(u8);

/// An interned function type id, usable for checking signatures at
/// indirect calls with a single integer comparison.
#[repr(C)]
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct VMSharedTypeIndex(u32);

impl VMSharedTypeIndex {
    /// Create a new `VMSharedTypeIndex`.
    #[inline]
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the underlying bits of the index.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl Default for VMSharedTypeIndex {
    #[inline]
    fn default() -> Self {
        // u32::MAX is reserved as the unassigned value; the registry never
        // hands it out.
        Self::new(u32::MAX)
    }
}

/// The fields compiled code needs to access a linear memory: the start
/// address and the size in bytes.
///
/// A zero-length memory keeps a null base but its true (zero) length,
/// since the length alone drives bounds checks.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct VMMemoryDefinition {
    /// The start address.
    pub base: *mut u8,

    /// The current logical size of this linear memory in bytes.
    pub current_length: usize,
}

/// The resolved owner pair for a linear memory imported from another
/// instance.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct VMMemoryImport {
    /// A pointer to the owning instance's memory record.
    pub from: *const crate::memory::Memory,

    /// A pointer to the context buffer of the owning instance.
    pub vmctx: *mut VMContext,
}

// Declare that this type is send/sync, it's the responsibility of users of
// `VMMemoryImport` to uphold this guarantee.
unsafe impl Send for VMMemoryImport {}
unsafe impl Sync for VMMemoryImport {}

/// One callable unit, uniform across local and imported functions.
///
/// Its address is the value stored in funcref table slots and carried by
/// first-class function references, so a `VMFuncRef` must never move once
/// it has been published; see `ModuleEngine`'s function-reference cache.
///
/// The first three fields coincide with the imported-function entry layout
/// in the context buffer; the tests below keep that in sync.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct VMFuncRef {
    /// The code address of the function body.
    pub code: NonNull<VMFunctionBody>,

    /// The context buffer of the defining instantiation.
    pub vmctx: *mut VMContext,

    /// The interned id of the function's type.
    pub type_index: VMSharedTypeIndex,

    /// The flat function index within the defining module.
    pub func_index: FuncIndex,
}

// Declare that this type is send/sync, it's the responsibility of users of
// `VMFuncRef` to uphold this guarantee.
unsafe impl Send for VMFuncRef {}
unsafe impl Sync for VMFuncRef {}

/// An opaque, address-sized reference to a function, usable as a table
/// element or a first-class `funcref` value.
///
/// The raw value zero is the reserved null-function sentinel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Reference(usize);

impl Reference {
    /// The null function reference.
    pub const NULL: Reference = Reference(0);

    /// Whether this is the null reference.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The raw address-sized value, as stored in table slots.
    #[inline]
    pub fn as_raw(self) -> usize {
        self.0
    }

    /// Encode the address of a published `VMFuncRef`.
    #[inline]
    pub(crate) fn from_func_ref(func: &VMFuncRef) -> Reference {
        Reference(func as *const VMFuncRef as usize)
    }

    /// Decode a non-null reference back into the `VMFuncRef` it points at.
    ///
    /// # Safety
    ///
    /// The reference must have been produced by [`Reference::from_func_ref`]
    /// for a `VMFuncRef` whose owning engine is still live.
    #[inline]
    pub(crate) unsafe fn as_func_ref<'a>(self) -> &'a VMFuncRef {
        debug_assert!(!self.is_null());
        &*(self.0 as *const VMFuncRef)
    }
}

/// The owned, heap-allocated context buffer of one instantiation.
///
/// Allocated zeroed at the size [`VMOffsets`] computed for the module
/// shape. The base address is stable for the life of the buffer, so the
/// owning engine may be moved freely after caching [`Self::vmctx_ptr`].
#[derive(Debug)]
pub struct OwnedVMContext {
    data: Box<[u8]>,
}

impl OwnedVMContext {
    /// Allocate a zeroed buffer of the size the offsets require.
    pub fn new(offsets: &VMOffsets) -> Self {
        Self {
            data: vec![0; offsets.size_of_vmctx() as usize].into_boxed_slice(),
        }
    }

    /// Return the base address handed to compiled code.
    #[inline]
    pub fn vmctx_ptr(&self) -> *mut VMContext {
        self.data.as_ptr() as *mut VMContext
    }

    fn write_slot(&mut self, offset: u32, value: u64) {
        let offset = offset as usize;
        self.data[offset..offset + SLOT_SIZE as usize].copy_from_slice(&value.to_le_bytes());
    }

    fn read_slot(&self, offset: u32) -> u64 {
        let offset = offset as usize;
        let mut raw = [0; SLOT_SIZE as usize];
        raw.copy_from_slice(&self.data[offset..offset + SLOT_SIZE as usize]);
        u64::from_le_bytes(raw)
    }

    /// Store the address of the owning instance.
    pub fn set_module_instance(&mut self, offsets: &VMOffsets, instance: *const Instance) {
        self.write_slot(offsets.vmctx_module_instance(), instance as u64);
    }

    /// Read back the address of the owning instance.
    pub fn module_instance(&self, offsets: &VMOffsets) -> *const Instance {
        self.read_slot(offsets.vmctx_module_instance()) as usize as *const Instance
    }

    /// Store the locally defined memory descriptor.
    pub fn set_local_memory(&mut self, offsets: &VMOffsets, memory: VMMemoryDefinition) {
        let begin = offsets
            .vmctx_local_memory_begin()
            .expect("module does not define its own memory");
        self.write_slot(begin, memory.base as u64);
        self.write_slot(begin + SLOT_SIZE, memory.current_length as u64);
    }

    /// Read back the locally defined memory descriptor.
    pub fn local_memory(&self, offsets: &VMOffsets) -> VMMemoryDefinition {
        let begin = offsets
            .vmctx_local_memory_begin()
            .expect("module does not define its own memory");
        VMMemoryDefinition {
            base: self.read_slot(begin) as usize as *mut u8,
            current_length: self.read_slot(begin + SLOT_SIZE) as usize,
        }
    }

    /// Store the resolved owner pair for an imported memory.
    pub fn set_imported_memory(&mut self, offsets: &VMOffsets, import: VMMemoryImport) {
        let begin = offsets
            .vmctx_imported_memory_begin()
            .expect("module does not import its memory");
        self.write_slot(begin, import.from as u64);
        self.write_slot(begin + SLOT_SIZE, import.vmctx as u64);
    }

    /// Read back the resolved owner pair for an imported memory.
    pub fn imported_memory(&self, offsets: &VMOffsets) -> VMMemoryImport {
        let begin = offsets
            .vmctx_imported_memory_begin()
            .expect("module does not import its memory");
        VMMemoryImport {
            from: self.read_slot(begin) as usize as *const crate::memory::Memory,
            vmctx: self.read_slot(begin + SLOT_SIZE) as usize as *mut VMContext,
        }
    }

    /// Store the resolved (code address, context address, type id) triple
    /// for the imported function at `index`.
    pub fn set_imported_function(
        &mut self,
        offsets: &VMOffsets,
        index: FuncIndex,
        code: NonNull<VMFunctionBody>,
        vmctx: *mut VMContext,
        type_index: VMSharedTypeIndex,
    ) {
        let (code_offset, vmctx_offset, type_offset) = offsets.vmctx_imported_function(index);
        self.write_slot(code_offset, code.as_ptr() as u64);
        self.write_slot(vmctx_offset, vmctx as u64);
        self.write_slot(type_offset, u64::from(type_index.bits()));
    }

    /// Read back the resolved triple for the imported function at `index`
    /// as (code address, context address, type id).
    pub fn imported_function(
        &self,
        offsets: &VMOffsets,
        index: FuncIndex,
    ) -> (usize, usize, VMSharedTypeIndex) {
        let (code_offset, vmctx_offset, type_offset) = offsets.vmctx_imported_function(index);
        (
            self.read_slot(code_offset) as usize,
            self.read_slot(vmctx_offset) as usize,
            VMSharedTypeIndex::new(u32::try_from(self.read_slot(type_offset)).unwrap()),
        )
    }

    /// Store the address of the global at `index`.
    pub fn set_global(
        &mut self,
        offsets: &VMOffsets,
        index: GlobalIndex,
        global: *const VMGlobalDefinition,
    ) {
        self.write_slot(offsets.vmctx_global(index), global as u64);
    }

    /// Read back the address of the global at `index`.
    pub fn global(&self, offsets: &VMOffsets, index: GlobalIndex) -> *const VMGlobalDefinition {
        self.read_slot(offsets.vmctx_global(index)) as usize as *const VMGlobalDefinition
    }

    /// Store the first-element address of the instance's type-id table.
    pub fn set_type_ids(&mut self, offsets: &VMOffsets, type_ids: *const VMSharedTypeIndex) {
        let offset = offsets.vmctx_type_ids().expect("module has no tables");
        self.write_slot(offset, type_ids as u64);
    }

    /// Read back the first-element address of the instance's type-id table.
    pub fn type_ids(&self, offsets: &VMOffsets) -> *const VMSharedTypeIndex {
        let offset = offsets.vmctx_type_ids().expect("module has no tables");
        self.read_slot(offset) as usize as *const VMSharedTypeIndex
    }

    /// Store the address of the table at `index`.
    pub fn set_table(&mut self, offsets: &VMOffsets, index: TableIndex, table: *const Table) {
        self.write_slot(offsets.vmctx_table(index), table as u64);
    }

    /// Read back the address of the table at `index`.
    pub fn table(&self, offsets: &VMOffsets, index: TableIndex) -> *const Table {
        self.read_slot(offsets.vmctx_table(index)) as usize as *const Table
    }

    /// Store the first-element addresses of the call-hook trampoline
    /// tables.
    pub fn set_call_hook_tables(&mut self, offsets: &VMOffsets, before: usize, after: usize) {
        let before_offset = offsets
            .vmctx_before_call_hooks()
            .expect("module was compiled without call hooks");
        let after_offset = offsets
            .vmctx_after_call_hooks()
            .expect("module was compiled without call hooks");
        self.write_slot(before_offset, before as u64);
        self.write_slot(after_offset, after as u64);
    }
}

/// The storage for a global variable.
///
/// Sized and aligned for the largest value type (a V128), whatever the
/// declared type is.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct VMGlobalDefinition {
    storage: [u8; 16],
}

impl VMGlobalDefinition {
    /// Construct a zeroed `VMGlobalDefinition`.
    pub fn new() -> Self {
        Self { storage: [0; 16] }
    }

    /// Return a reference to the value as an i32.
    pub unsafe fn as_i32(&self) -> &i32 {
        &*(self.storage.as_ref().as_ptr().cast::<i32>())
    }

    /// Return a mutable reference to the value as an i32.
    pub unsafe fn as_i32_mut(&mut self) -> &mut i32 {
        &mut *(self.storage.as_mut().as_mut_ptr().cast::<i32>())
    }

    /// Return a reference to the value as a u32.
    pub unsafe fn as_u32(&self) -> &u32 {
        &*(self.storage.as_ref().as_ptr().cast::<u32>())
    }

    /// Return a mutable reference to the value as a u32.
    pub unsafe fn as_u32_mut(&mut self) -> &mut u32 {
        &mut *(self.storage.as_mut().as_mut_ptr().cast::<u32>())
    }

    /// Return a reference to the value as an i64.
    pub unsafe fn as_i64(&self) -> &i64 {
        &*(self.storage.as_ref().as_ptr().cast::<i64>())
    }

    /// Return a mutable reference to the value as an i64.
    pub unsafe fn as_i64_mut(&mut self) -> &mut i64 {
        &mut *(self.storage.as_mut().as_mut_ptr().cast::<i64>())
    }

    /// Return a reference to the value as a u64.
    pub unsafe fn as_u64(&self) -> &u64 {
        &*(self.storage.as_ref().as_ptr().cast::<u64>())
    }

    /// Return a mutable reference to the value as a u64.
    pub unsafe fn as_u64_mut(&mut self) -> &mut u64 {
        &mut *(self.storage.as_mut().as_mut_ptr().cast::<u64>())
    }

    /// Return a reference to the value as f32 bits.
    pub unsafe fn as_f32_bits(&self) -> &u32 {
        &*(self.storage.as_ref().as_ptr().cast::<u32>())
    }

    /// Return a mutable reference to the value as f32 bits.
    pub unsafe fn as_f32_bits_mut(&mut self) -> &mut u32 {
        &mut *(self.storage.as_mut().as_mut_ptr().cast::<u32>())
    }

    /// Return a reference to the value as f64 bits.
    pub unsafe fn as_f64_bits(&self) -> &u64 {
        &*(self.storage.as_ref().as_ptr().cast::<u64>())
    }

    /// Return a mutable reference to the value as f64 bits.
    pub unsafe fn as_f64_bits_mut(&mut self) -> &mut u64 {
        &mut *(self.storage.as_mut().as_mut_ptr().cast::<u64>())
    }
}

impl Default for VMGlobalDefinition {
    fn default() -> Self {
        Self::new()
    }
}

impl VMMemoryDefinition {
    /// A descriptor for a zero-length memory: null base, zero length.
    pub fn empty() -> Self {
        Self {
            base: ptr::null_mut(),
            current_length: 0,
        }
    }
}

#[cfg(test)]
mod test_vmfunc_ref {
    use super::VMFuncRef;
    use corten_environ::VMOffsets;
    use memoffset::offset_of;
    use std::mem::size_of;

    #[test]
    fn check_vmfunc_ref_offsets() {
        // The imported-function entries in the context buffer use the same
        // (code, vmctx, type id) layout as the record itself.
        assert_eq!(
            size_of::<VMFuncRef>(),
            usize::try_from(VMOffsets::size_of_imported_function()).unwrap()
        );
        assert_eq!(offset_of!(VMFuncRef, code), 0);
        assert_eq!(offset_of!(VMFuncRef, vmctx), 8);
        assert_eq!(offset_of!(VMFuncRef, type_index), 16);
    }
}
