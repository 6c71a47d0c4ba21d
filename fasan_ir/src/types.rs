//! Value types.
//!
//! Integers have no fixed width: an `int` holds whatever a load produced or
//! an arithmetic op computed, and width only matters at memory accesses and
//! explicit `sext`/`zext`. Pointers carry their address space; the
//! instrumentation only touches address space 0.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    /// Result of `icmp`.
    Bool,
    Ptr(u32),
    /// Stores, void calls and terminators.
    Unit,
}

impl Type {
    /// Pointer in the default address space.
    pub const PTR: Type = Type::Ptr(0);

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }
}

/// Ordering of an atomic access. Carried through unchanged; checks are
/// emitted the same way for every ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOrdering {
    Relaxed,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}
