//! Function and basic block definitions.
//!
//! Instructions live in a per-function arena and are never removed, so an
//! `InstRef`/`ValueRef` stays valid for the lifetime of the function. Each
//! basic block owns an ordered list of instruction handles, which makes
//! insertion and block splitting cheap for instrumentation passes.

use std::collections::HashMap;

use crate::global::Linkage;
use crate::instruction::Instruction;
use crate::module::SymbolId;
use crate::types::Type;
use crate::value::{BlockRef, InstRef, ValueRef};

/// A block argument (replaces PHI nodes).
#[derive(Debug, Clone)]
pub struct BlockArg {
    pub ty: Type,
}

/// A basic block containing a sequence of instructions.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// Start index into the function's block_args arena.
    pub arg_start: u32,
    /// Number of block arguments.
    pub arg_count: u32,
    /// Instructions in program order; the last one is the terminator.
    pub insts: Vec<InstRef>,
}

/// Function-level attributes.
#[derive(Debug, Clone)]
pub struct FunctionAttrs {
    pub linkage: Linkage,
    /// The function must not be instrumented at all.
    pub no_sanitize: bool,
    /// Set once the address instrumentation has rewritten this function.
    pub sanitized: bool,
}

impl Default for FunctionAttrs {
    fn default() -> Self {
        Self {
            linkage: Linkage::External,
            no_sanitize: false,
            sanitized: false,
        }
    }
}

/// A function in the fasan IR. A function without blocks is a declaration.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: SymbolId,
    pub params: Vec<Type>,
    pub ret_ty: Option<Type>,
    pub attrs: FunctionAttrs,
    /// Instruction arena: contiguous storage.
    pub instructions: Vec<Instruction>,
    /// Basic blocks; the first one is the entry block.
    pub blocks: Vec<BasicBlock>,
    /// Block argument arena.
    pub block_args: Vec<BlockArg>,
    /// Optional source-level names for stack slots (for diagnostics only).
    pub slot_names: HashMap<InstRef, String>,
}

impl Function {
    pub fn new(name: SymbolId, params: Vec<Type>, ret_ty: Option<Type>) -> Self {
        Self {
            name,
            params,
            ret_ty,
            attrs: FunctionAttrs::default(),
            instructions: Vec::new(),
            blocks: Vec::new(),
            block_args: Vec::new(),
            slot_names: HashMap::new(),
        }
    }

    /// Whether this function has no body.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get an instruction by reference.
    pub fn inst(&self, r: InstRef) -> &Instruction {
        &self.instructions[r.index() as usize]
    }

    /// Get a mutable instruction by reference.
    pub fn inst_mut(&mut self, r: InstRef) -> &mut Instruction {
        &mut self.instructions[r.index() as usize]
    }

    /// Get a basic block by reference.
    pub fn block(&self, r: BlockRef) -> &BasicBlock {
        &self.blocks[r.index() as usize]
    }

    /// All blocks in layout order.
    pub fn block_refs(&self) -> impl Iterator<Item = BlockRef> {
        (0..self.blocks.len() as u32).map(BlockRef)
    }

    /// Instructions of a basic block in program order.
    pub fn block_insts(&self, r: BlockRef) -> &[InstRef] {
        &self.block(r).insts
    }

    /// Reference to the entry block.
    pub fn entry_block(&self) -> BlockRef {
        BlockRef(0)
    }

    /// The terminator of a block, if the block ends in one.
    pub fn terminator(&self, r: BlockRef) -> Option<InstRef> {
        self.block(r)
            .insts
            .last()
            .copied()
            .filter(|&i| self.inst(i).is_terminator())
    }

    /// Get block arguments for a block.
    pub fn block_args(&self, r: BlockRef) -> &[BlockArg] {
        let bb = self.block(r);
        let start = bb.arg_start as usize;
        let end = start + bb.arg_count as usize;
        &self.block_args[start..end]
    }

    /// Get ValueRefs for block arguments of a block.
    pub fn block_arg_values(&self, r: BlockRef) -> Vec<ValueRef> {
        let bb = self.block(r);
        (0..bb.arg_count)
            .map(|i| ValueRef::block_arg(bb.arg_start + i))
            .collect()
    }

    /// Get the type of a value (instruction result or block argument).
    pub fn value_type(&self, v: ValueRef) -> Option<&Type> {
        if v.is_block_arg() {
            self.block_args.get(v.index() as usize).map(|ba| &ba.ty)
        } else {
            self.instructions.get(v.index() as usize).map(|i| &i.ty)
        }
    }

    /// The instruction defining `v`, if it is an instruction result.
    pub fn def_inst(&self, v: ValueRef) -> Option<&Instruction> {
        v.inst().and_then(|i| self.instructions.get(i.index() as usize))
    }

    /// Find the block and position of an instruction.
    pub fn locate(&self, inst: InstRef) -> Option<(BlockRef, usize)> {
        self.block_refs().find_map(|b| {
            self.block_insts(b)
                .iter()
                .position(|&i| i == inst)
                .map(|pos| (b, pos))
        })
    }

    /// Append an instruction to the arena without placing it in a block.
    pub fn push_inst(&mut self, inst: Instruction) -> InstRef {
        let idx = self.instructions.len() as u32;
        self.instructions.push(inst);
        InstRef(idx)
    }

    /// Append an empty block without arguments.
    pub fn push_block(&mut self) -> BlockRef {
        let idx = self.blocks.len() as u32;
        self.blocks.push(BasicBlock {
            arg_start: self.block_args.len() as u32,
            arg_count: 0,
            insts: Vec::new(),
        });
        BlockRef(idx)
    }

    /// Insert an existing arena instruction into `block` at `pos`.
    pub fn insert_at(&mut self, block: BlockRef, pos: usize, inst: InstRef) {
        self.blocks[block.index() as usize].insts.insert(pos, inst);
    }

    /// Move the instructions of `block` starting at `pos` into a fresh block
    /// and return it. The new block has no arguments; `block` is left
    /// without a terminator until the caller appends one.
    pub fn split_block(&mut self, block: BlockRef, pos: usize) -> BlockRef {
        let tail = self.blocks[block.index() as usize].insts.split_off(pos);
        let new_block = self.push_block();
        self.blocks[new_block.index() as usize].insts = tail;
        new_block
    }

    /// Number of leading `param` instructions in the entry block.
    pub fn param_prologue_len(&self) -> usize {
        if self.is_declaration() {
            return 0;
        }
        self.block_insts(self.entry_block())
            .iter()
            .take_while(|&&i| matches!(self.inst(i).op, crate::instruction::Op::Param(_)))
            .count()
    }
}
