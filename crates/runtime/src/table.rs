//! Memory management for tables.
//!
//! `Table` is to WebAssembly tables what `Memory` is to WebAssembly linear
//! memories. Slots hold raw [`Reference`] values; the raw value zero is
//! the reserved null-function sentinel, so a freshly created or grown
//! table is all null.

use crate::vmcontext::Reference;
use corten_environ::{TableElementKind, TablePlan};
use std::cell::RefCell;

/// A table instance.
///
/// Like [`crate::memory::Memory`], the record address is published into
/// context buffers and must stay stable for the owning instance's
/// lifetime; the element storage behind the `RefCell` may grow.
#[derive(Debug)]
pub struct Table {
    elements: RefCell<Vec<Reference>>,
    maximum: Option<u32>,
    kind: TableElementKind,
}

impl Table {
    /// Create a new table instance from the given plan, filled with null
    /// references.
    pub fn new(plan: &TablePlan) -> Self {
        Self {
            elements: RefCell::new(vec![Reference::NULL; plan.minimum as usize]),
            maximum: plan.maximum,
            kind: plan.kind,
        }
    }

    /// The kind of element this table holds.
    pub fn kind(&self) -> TableElementKind {
        self.kind
    }

    /// Returns the number of allocated elements.
    pub fn size(&self) -> u32 {
        u32::try_from(self.elements.borrow().len()).unwrap()
    }

    /// Grow the table by the specified amount of elements, filling the new
    /// slots with `init`.
    ///
    /// Returns the previous size of the table if growth is successful;
    /// returns `None` if the table can't be grown by the specified amount
    /// of elements.
    pub fn grow(&self, delta: u32, init: Reference) -> Option<u32> {
        let size = self.size();
        let new_size = size.checked_add(delta)?;
        if let Some(maximum) = self.maximum {
            if new_size > maximum {
                return None;
            }
        }
        self.elements.borrow_mut().resize(new_size as usize, init);
        Some(size)
    }

    /// Get the reference in the specified slot.
    ///
    /// Returns `None` if the index is out of bounds.
    pub fn get(&self, index: u32) -> Option<Reference> {
        self.elements.borrow().get(index as usize).copied()
    }

    /// Set the reference in the specified slot.
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is out of bounds.
    pub fn set(&self, index: u32, reference: Reference) -> Result<(), ()> {
        let mut elements = self.elements.borrow_mut();
        let slot = elements.get_mut(index as usize).ok_or(())?;
        *slot = reference;
        Ok(())
    }
}
