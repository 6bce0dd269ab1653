//! Runtime faults raised at compiled call sites.

use thiserror::Error;

/// A fault raised synchronously by a compiled call site.
///
/// Traps are categorized, never retried, and propagate to the embedding
/// host unchanged. Programmer errors in the instantiation orchestration
/// (resolving against an unfinished provider, touching an absent context
/// field) are panics, not traps.
#[derive(Error, Copy, Clone, PartialEq, Eq, Debug)]
pub enum Trap {
    /// An access through a table slot that is out of bounds, of the wrong
    /// element kind, or null.
    #[error("invalid table access")]
    InvalidTableAccess,

    /// An indirect call whose target's type id differs from the one the
    /// call site expects.
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
}
