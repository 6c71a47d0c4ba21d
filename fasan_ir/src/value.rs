//! Opaque handles for IR entities.
//!
//! All references into the IR are u32 indices, not pointers.
//! This enables arena-based storage and lets passes hold handles across
//! mutations of the function body.

const BLOCK_ARG_BIT: u32 = 1 << 31;

/// Reference to a value (instruction result or block argument).
///
/// The top bit distinguishes block arguments from instruction results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueRef(u32);

impl ValueRef {
    /// Value produced by the instruction at `index` in the arena.
    pub fn inst_result(index: u32) -> Self {
        debug_assert!(index & BLOCK_ARG_BIT == 0);
        Self(index)
    }

    /// Value of the block argument at `index` in the block-argument arena.
    pub fn block_arg(index: u32) -> Self {
        debug_assert!(index & BLOCK_ARG_BIT == 0);
        Self(index | BLOCK_ARG_BIT)
    }

    pub fn is_block_arg(self) -> bool {
        self.0 & BLOCK_ARG_BIT != 0
    }

    /// Index into the instruction arena or the block-argument arena.
    pub fn index(self) -> u32 {
        self.0 & !BLOCK_ARG_BIT
    }

    /// Raw encoding, unique across both kinds.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// The defining instruction, if this is an instruction result.
    pub fn inst(self) -> Option<InstRef> {
        if self.is_block_arg() {
            None
        } else {
            Some(InstRef(self.0))
        }
    }
}

/// Reference to an instruction in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstRef(pub(crate) u32);

impl InstRef {
    /// Raw index into the instruction arena.
    pub fn index(self) -> u32 {
        self.0
    }

    /// The value this instruction produces.
    pub fn value(self) -> ValueRef {
        ValueRef::inst_result(self.0)
    }
}

impl From<InstRef> for ValueRef {
    fn from(inst: InstRef) -> Self {
        inst.value()
    }
}

/// Reference to a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef(pub(crate) u32);

impl BlockRef {
    /// Raw index into the block arena.
    pub fn index(self) -> u32 {
        self.0
    }
}
