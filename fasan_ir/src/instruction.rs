//! Instruction definitions for fasan IR.

use crate::module::SymbolId;
use crate::types::{MemoryOrdering, Type};
use crate::value::{BlockRef, ValueRef};

/// Origin tracks where an instruction came from (for debug info / profiling).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    /// Source instruction(s) this was derived from.
    pub sources: Vec<u32>,
}

impl Origin {
    /// Create a synthetic origin (no source).
    pub fn synthetic() -> Self {
        Self { sources: vec![] }
    }

    /// Create an origin from a single source.
    pub fn from_source(id: u32) -> Self {
        Self { sources: vec![id] }
    }

    pub fn is_synthetic(&self) -> bool {
        self.sources.is_empty()
    }
}

/// An instruction in the fasan IR.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Op,
    pub ty: Type,
    pub origin: Origin,
    /// Set on accesses that must never receive sanitizer checks, including
    /// the ones the instrumentation itself emits.
    pub no_sanitize: bool,
}

impl Instruction {
    pub fn new(op: Op, ty: Type, origin: Origin) -> Self {
        Self {
            op,
            ty,
            origin,
            no_sanitize: false,
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.op.is_terminator()
    }
}

/// Integer comparison predicates.
/// In infinite precision, comparison is purely mathematical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ICmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Atomic read-modify-write operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicRmwOp {
    Xchg,
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// Instruction opcodes.
///
/// Memory operations carry their access width in bytes. Block targets use
/// `BlockRef` directly; branch arguments feed the target's block arguments.
#[derive(Debug, Clone)]
pub enum Op {
    /// Function parameter. Index into the parameter list.
    Param(u32),
    /// Integer constant.
    Const(i64),
    /// Boolean constant.
    BConst(bool),
    /// Integer addition: add %a, %b
    Add(ValueRef, ValueRef),
    /// Integer subtraction: sub %a, %b
    Sub(ValueRef, ValueRef),
    /// Integer multiplication: mul %a, %b
    Mul(ValueRef, ValueRef),
    /// Bitwise AND: and %a, %b
    And(ValueRef, ValueRef),
    /// Bitwise OR: or %a, %b
    Or(ValueRef, ValueRef),
    /// Bitwise XOR: xor %a, %b
    Xor(ValueRef, ValueRef),
    /// Left shift: shl %a, %b
    Shl(ValueRef, ValueRef),
    /// Right shift (floor division by a power of two): shr %a, %b
    Shr(ValueRef, ValueRef),

    // -- Comparison --
    /// Integer comparison. Returns Bool.
    ICmp(ICmpOp, ValueRef, ValueRef),
    /// Conditional select: select cond, true_val, false_val.
    Select(ValueRef, ValueRef, ValueRef),

    // -- Width reinterpretation --
    /// Interpret the low n bits as a signed integer.
    Sext(ValueRef, u32),
    /// Interpret the low n bits as an unsigned integer.
    Zext(ValueRef, u32),

    // -- Memory --
    /// Load `bytes` bytes from pointer.
    Load(ValueRef, u32),
    /// Store value to pointer: store val, ptr, bytes.
    Store(ValueRef, ValueRef, u32),
    /// Atomic load: ptr, bytes, ordering.
    LoadAtomic(ValueRef, u32, MemoryOrdering),
    /// Atomic store: val, ptr, bytes, ordering.
    StoreAtomic(ValueRef, ValueRef, u32, MemoryOrdering),
    /// Atomic read-modify-write: op, ptr, val, bytes, ordering. Returns the old value.
    AtomicRmw(AtomicRmwOp, ValueRef, ValueRef, u32, MemoryOrdering),
    /// Atomic compare-and-exchange: ptr, expected, desired, bytes, ordering.
    /// Returns the old value.
    AtomicCmpXchg(ValueRef, ValueRef, ValueRef, u32, MemoryOrdering),
    /// Copy `len` bytes between non-overlapping buffers: memcpy dst, src, len.
    MemCopy(ValueRef, ValueRef, ValueRef),
    /// Copy `len` bytes between possibly overlapping buffers: memmove dst, src, len.
    MemMove(ValueRef, ValueRef, ValueRef),
    /// Fill `len` bytes with a byte value: memset dst, byte, len.
    MemSet(ValueRef, ValueRef, ValueRef),
    /// Allocate `size` bytes with `align` alignment on the stack, returns pointer.
    StackSlot(u32, u32),
    /// The object at ptr becomes live (lexical scope entry): ptr, size.
    LifetimeStart(ValueRef, u64),
    /// The object at ptr goes out of scope: ptr, size.
    LifetimeEnd(ValueRef, u64),

    // -- Symbol --
    /// Address of a symbol (function or global).
    SymbolAddr(SymbolId),

    // -- Call --
    /// Call function with arguments.
    Call(ValueRef, Vec<ValueRef>),

    // -- Pointer operations --
    /// Pointer addition: ptradd ptr, offset (preserves provenance).
    PtrAdd(ValueRef, ValueRef),
    /// Pointer to address (discard provenance). Addresses are non-negative.
    PtrToAddr(ValueRef),
    /// Integer to pointer (no valid provenance). The integer is taken
    /// modulo the address-space size.
    IntToPtr(ValueRef),

    // -- Terminators --
    /// Return from function.
    Ret(Option<ValueRef>),
    /// Unconditional branch with block arguments.
    Br(BlockRef, Vec<ValueRef>),
    /// Conditional branch: brif cond, then_block(args...), else_block(args...).
    BrIf(ValueRef, BlockRef, Vec<ValueRef>, BlockRef, Vec<ValueRef>),
    /// Leave the function by propagating an in-flight unwind.
    Unwind,
    /// Control flow never reaches this point.
    Unreachable,
    /// Unconditionally abort execution.
    Trap,
}

impl Op {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Ret(_) | Op::Br(..) | Op::BrIf(..) | Op::Unwind | Op::Unreachable | Op::Trap
        )
    }

    /// Whether control leaves the function through this terminator.
    pub fn is_function_exit(&self) -> bool {
        matches!(self, Op::Ret(_) | Op::Unwind)
    }

    /// Append every value operand to `out`.
    pub fn operands(&self, out: &mut Vec<ValueRef>) {
        match self {
            Op::Param(_)
            | Op::Const(_)
            | Op::BConst(_)
            | Op::StackSlot(..)
            | Op::SymbolAddr(_)
            | Op::Unwind
            | Op::Unreachable
            | Op::Trap => {}
            Op::Add(a, b)
            | Op::Sub(a, b)
            | Op::Mul(a, b)
            | Op::And(a, b)
            | Op::Or(a, b)
            | Op::Xor(a, b)
            | Op::Shl(a, b)
            | Op::Shr(a, b)
            | Op::ICmp(_, a, b)
            | Op::Store(a, b, _)
            | Op::StoreAtomic(a, b, _, _)
            | Op::AtomicRmw(_, a, b, _, _)
            | Op::PtrAdd(a, b) => out.extend([*a, *b]),
            Op::Select(a, b, c)
            | Op::AtomicCmpXchg(a, b, c, _, _)
            | Op::MemCopy(a, b, c)
            | Op::MemMove(a, b, c)
            | Op::MemSet(a, b, c) => out.extend([*a, *b, *c]),
            Op::Sext(a, _)
            | Op::Zext(a, _)
            | Op::Load(a, _)
            | Op::LoadAtomic(a, _, _)
            | Op::LifetimeStart(a, _)
            | Op::LifetimeEnd(a, _)
            | Op::PtrToAddr(a)
            | Op::IntToPtr(a) => out.push(*a),
            Op::Call(callee, args) => {
                out.push(*callee);
                out.extend(args.iter().copied());
            }
            Op::Ret(val) => out.extend(val.iter().copied()),
            Op::Br(_, args) => out.extend(args.iter().copied()),
            Op::BrIf(cond, _, then_args, _, else_args) => {
                out.push(*cond);
                out.extend(then_args.iter().copied());
                out.extend(else_args.iter().copied());
            }
        }
    }

    /// Branch targets of a terminator.
    pub fn successors(&self) -> Vec<BlockRef> {
        match self {
            Op::Br(target, _) => vec![*target],
            Op::BrIf(_, then_bb, _, else_bb, _) => vec![*then_bb, *else_bb],
            _ => vec![],
        }
    }
}
