//! Module-level metadata nodes.
//!
//! Metadata is a side table of tuples attached to the module. Frontends use
//! named lists of nodes to hand facts to later passes without changing the
//! program's semantics.

use crate::global::GlobalId;

/// Reference to a metadata node in the module's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetadataRef(pub(crate) u32);

impl MetadataRef {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A single operand of a metadata node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdOperand {
    Null,
    String(String),
    Int(i64),
    Global(GlobalId),
    Node(MetadataRef),
}

impl MdOperand {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MdOperand::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MdOperand::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<GlobalId> {
        match self {
            MdOperand::Global(g) => Some(*g),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<MetadataRef> {
        match self {
            MdOperand::Node(n) => Some(*n),
            _ => None,
        }
    }
}

static NULL_OPERAND: MdOperand = MdOperand::Null;

/// A tuple of metadata operands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MdNode {
    pub operands: Vec<MdOperand>,
}

impl MdNode {
    pub fn new(operands: Vec<MdOperand>) -> Self {
        Self { operands }
    }

    /// Operand at `index`, or `Null` when out of range.
    pub fn operand(&self, index: usize) -> &MdOperand {
        self.operands.get(index).unwrap_or(&NULL_OPERAND)
    }
}
