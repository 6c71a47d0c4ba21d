//! Builder API for constructing and editing fasan IR.
//!
//! Origin is a mandatory argument of every instruction constructor.
//! The builder inserts either at the end of a block or before a given
//! position, so passes use the same API to grow new code and to splice
//! instrumentation into existing blocks.

use crate::function::{BlockArg, Function};
use crate::instruction::{AtomicRmwOp, ICmpOp, Instruction, Op, Origin};
use crate::module::SymbolId;
use crate::types::{MemoryOrdering, Type};
use crate::value::{BlockRef, ValueRef};

#[derive(Debug, Clone, Copy)]
enum Cursor {
    End(BlockRef),
    At(BlockRef, usize),
}

/// Builder for constructing a function's IR.
pub struct Builder<'a> {
    func: &'a mut Function,
    cursor: Option<Cursor>,
    no_sanitize: bool,
}

impl<'a> Builder<'a> {
    pub fn new(func: &'a mut Function) -> Self {
        Self {
            func,
            cursor: None,
            no_sanitize: false,
        }
    }

    /// Read access to the function under construction.
    pub fn func(&self) -> &Function {
        self.func
    }

    /// Create a new basic block and return its reference.
    pub fn create_block(&mut self) -> BlockRef {
        self.func.push_block()
    }

    /// Create a new basic block with arguments of the given types.
    pub fn create_block_with_args(&mut self, tys: &[Type]) -> BlockRef {
        let block = self.func.push_block();
        for ty in tys {
            self.func.block_args.push(BlockArg { ty: ty.clone() });
        }
        self.func.blocks[block.index() as usize].arg_count = tys.len() as u32;
        block
    }

    /// Append subsequent instructions to the end of `block`.
    pub fn switch_to_block(&mut self, block: BlockRef) {
        self.cursor = Some(Cursor::End(block));
    }

    /// Insert subsequent instructions before position `pos` of `block`.
    pub fn position_at(&mut self, block: BlockRef, pos: usize) {
        self.cursor = Some(Cursor::At(block, pos));
    }

    /// Block and position the next instruction will be inserted at.
    pub fn insertion_point(&self) -> Option<(BlockRef, usize)> {
        self.cursor.map(|c| match c {
            Cursor::End(b) => (b, self.func.block(b).insts.len()),
            Cursor::At(b, p) => (b, p),
        })
    }

    pub fn current_block(&self) -> Option<BlockRef> {
        self.insertion_point().map(|(b, _)| b)
    }

    /// Mark every instruction created from now on as exempt from sanitizer checks.
    pub fn set_no_sanitize(&mut self, no_sanitize: bool) {
        self.no_sanitize = no_sanitize;
    }

    /// Attach a source-level name to a stack slot.
    pub fn set_slot_name(&mut self, slot: ValueRef, name: impl Into<String>) {
        if let Some(inst) = slot.inst() {
            self.func.slot_names.insert(inst, name.into());
        }
    }

    fn push(&mut self, op: Op, ty: Type, origin: Origin) -> ValueRef {
        let mut inst = Instruction::new(op, ty, origin);
        inst.no_sanitize = self.no_sanitize;
        let r = self.func.push_inst(inst);
        let cursor = self.cursor;
        match cursor {
            Some(Cursor::End(bb)) => self.func.blocks[bb.index() as usize].insts.push(r),
            Some(Cursor::At(bb, pos)) => {
                self.func.insert_at(bb, pos, r);
                self.cursor = Some(Cursor::At(bb, pos + 1));
            }
            None => {}
        }
        r.value()
    }

    /// Create a function parameter reference.
    pub fn param(&mut self, index: u32, ty: Type, origin: Origin) -> ValueRef {
        self.push(Op::Param(index), ty, origin)
    }

    /// Integer constant.
    pub fn iconst(&mut self, val: i64, origin: Origin) -> ValueRef {
        self.push(Op::Const(val), Type::Int, origin)
    }

    /// Boolean constant.
    pub fn bconst(&mut self, val: bool, origin: Origin) -> ValueRef {
        self.push(Op::BConst(val), Type::Bool, origin)
    }

    pub fn add(&mut self, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::Add(a, b), Type::Int, origin)
    }

    pub fn sub(&mut self, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::Sub(a, b), Type::Int, origin)
    }

    pub fn mul(&mut self, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::Mul(a, b), Type::Int, origin)
    }

    pub fn and(&mut self, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::And(a, b), Type::Int, origin)
    }

    pub fn or(&mut self, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::Or(a, b), Type::Int, origin)
    }

    pub fn xor(&mut self, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::Xor(a, b), Type::Int, origin)
    }

    pub fn shl(&mut self, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::Shl(a, b), Type::Int, origin)
    }

    pub fn shr(&mut self, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::Shr(a, b), Type::Int, origin)
    }

    /// Integer comparison.
    pub fn icmp(&mut self, op: ICmpOp, a: ValueRef, b: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::ICmp(op, a, b), Type::Bool, origin)
    }

    pub fn select(
        &mut self,
        cond: ValueRef,
        tv: ValueRef,
        fv: ValueRef,
        ty: Type,
        origin: Origin,
    ) -> ValueRef {
        self.push(Op::Select(cond, tv, fv), ty, origin)
    }

    pub fn sext(&mut self, val: ValueRef, bits: u32, origin: Origin) -> ValueRef {
        self.push(Op::Sext(val, bits), Type::Int, origin)
    }

    pub fn zext(&mut self, val: ValueRef, bits: u32, origin: Origin) -> ValueRef {
        self.push(Op::Zext(val, bits), Type::Int, origin)
    }

    /// Load `bytes` bytes of type `ty`.
    pub fn load(&mut self, ptr: ValueRef, bytes: u32, ty: Type, origin: Origin) -> ValueRef {
        self.push(Op::Load(ptr, bytes), ty, origin)
    }

    pub fn store(&mut self, val: ValueRef, ptr: ValueRef, bytes: u32, origin: Origin) -> ValueRef {
        self.push(Op::Store(val, ptr, bytes), Type::Unit, origin)
    }

    pub fn load_atomic(
        &mut self,
        ptr: ValueRef,
        bytes: u32,
        ordering: MemoryOrdering,
        ty: Type,
        origin: Origin,
    ) -> ValueRef {
        self.push(Op::LoadAtomic(ptr, bytes, ordering), ty, origin)
    }

    pub fn store_atomic(
        &mut self,
        val: ValueRef,
        ptr: ValueRef,
        bytes: u32,
        ordering: MemoryOrdering,
        origin: Origin,
    ) -> ValueRef {
        self.push(Op::StoreAtomic(val, ptr, bytes, ordering), Type::Unit, origin)
    }

    pub fn atomic_rmw(
        &mut self,
        op: AtomicRmwOp,
        ptr: ValueRef,
        val: ValueRef,
        bytes: u32,
        ordering: MemoryOrdering,
        origin: Origin,
    ) -> ValueRef {
        self.push(Op::AtomicRmw(op, ptr, val, bytes, ordering), Type::Int, origin)
    }

    pub fn cmpxchg(
        &mut self,
        ptr: ValueRef,
        expected: ValueRef,
        desired: ValueRef,
        bytes: u32,
        ordering: MemoryOrdering,
        origin: Origin,
    ) -> ValueRef {
        self.push(
            Op::AtomicCmpXchg(ptr, expected, desired, bytes, ordering),
            Type::Int,
            origin,
        )
    }

    pub fn memcpy(&mut self, dst: ValueRef, src: ValueRef, len: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::MemCopy(dst, src, len), Type::Unit, origin)
    }

    pub fn memmove(&mut self, dst: ValueRef, src: ValueRef, len: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::MemMove(dst, src, len), Type::Unit, origin)
    }

    pub fn memset(&mut self, dst: ValueRef, byte: ValueRef, len: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::MemSet(dst, byte, len), Type::Unit, origin)
    }

    /// Allocate `size` bytes on the stack.
    pub fn stack_slot(&mut self, size: u32, align: u32, origin: Origin) -> ValueRef {
        self.push(Op::StackSlot(size, align), Type::PTR, origin)
    }

    pub fn lifetime_start(&mut self, ptr: ValueRef, size: u64, origin: Origin) -> ValueRef {
        self.push(Op::LifetimeStart(ptr, size), Type::Unit, origin)
    }

    pub fn lifetime_end(&mut self, ptr: ValueRef, size: u64, origin: Origin) -> ValueRef {
        self.push(Op::LifetimeEnd(ptr, size), Type::Unit, origin)
    }

    /// Address of a symbol.
    pub fn symbol_addr(&mut self, sym: SymbolId, origin: Origin) -> ValueRef {
        self.push(Op::SymbolAddr(sym), Type::PTR, origin)
    }

    pub fn call(
        &mut self,
        callee: ValueRef,
        args: Vec<ValueRef>,
        ret_ty: Type,
        origin: Origin,
    ) -> ValueRef {
        self.push(Op::Call(callee, args), ret_ty, origin)
    }

    /// Call a symbol directly, materializing its address first.
    pub fn call_symbol(
        &mut self,
        callee: SymbolId,
        args: Vec<ValueRef>,
        ret_ty: Type,
        origin: Origin,
    ) -> ValueRef {
        let addr = self.symbol_addr(callee, origin.clone());
        self.call(addr, args, ret_ty, origin)
    }

    pub fn ptr_add(&mut self, ptr: ValueRef, offset: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::PtrAdd(ptr, offset), Type::PTR, origin)
    }

    pub fn ptr_to_addr(&mut self, ptr: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::PtrToAddr(ptr), Type::Int, origin)
    }

    pub fn int_to_ptr(&mut self, val: ValueRef, origin: Origin) -> ValueRef {
        self.push(Op::IntToPtr(val), Type::PTR, origin)
    }

    /// Return from function.
    pub fn ret(&mut self, val: Option<ValueRef>, origin: Origin) -> ValueRef {
        self.push(Op::Ret(val), Type::Unit, origin)
    }

    pub fn br(&mut self, target: BlockRef, args: Vec<ValueRef>, origin: Origin) -> ValueRef {
        self.push(Op::Br(target, args), Type::Unit, origin)
    }

    pub fn brif(
        &mut self,
        cond: ValueRef,
        then_bb: BlockRef,
        then_args: Vec<ValueRef>,
        else_bb: BlockRef,
        else_args: Vec<ValueRef>,
        origin: Origin,
    ) -> ValueRef {
        self.push(
            Op::BrIf(cond, then_bb, then_args, else_bb, else_args),
            Type::Unit,
            origin,
        )
    }

    pub fn unwind(&mut self, origin: Origin) -> ValueRef {
        self.push(Op::Unwind, Type::Unit, origin)
    }

    pub fn unreachable(&mut self, origin: Origin) -> ValueRef {
        self.push(Op::Unreachable, Type::Unit, origin)
    }

    pub fn trap(&mut self, origin: Origin) -> ValueRef {
        self.push(Op::Trap, Type::Unit, origin)
    }
}
