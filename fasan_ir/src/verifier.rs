//! IR verifier: structural integrity and type-safety checks.
//!
//! Collects all errors rather than stopping at the first one.
//! Entry points: `verify_module()` and `verify_function()`.

use std::collections::HashSet;
use std::fmt;

use crate::function::Function;
use crate::instruction::{Instruction, Op};
use crate::metadata::MdOperand;
use crate::module::{Module, SymbolTable};
use crate::types::Type;
use crate::value::{BlockRef, InstRef, ValueRef};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Location context for a verification error.
#[derive(Debug, Clone)]
pub enum Location {
    Module,
    Global(String),
    Function(String),
    Block(String, u32),
    Instruction(String, u32, u32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Module => write!(f, "module"),
            Location::Global(name) => write!(f, "global @{name}"),
            Location::Function(name) => write!(f, "func @{name}"),
            Location::Block(name, bi) => write!(f, "func @{name}, bb{bi}"),
            Location::Instruction(name, bi, ii) => {
                write!(f, "func @{name}, bb{bi}, inst {ii}")
            }
        }
    }
}

/// A single verification error.
#[derive(Debug, Clone)]
pub struct VerifyError {
    pub location: Location,
    pub message: String,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.location, self.message)
    }
}

/// Collected verification results.
#[derive(Debug, Default)]
pub struct VerifyResult {
    pub errors: Vec<VerifyError>,
}

impl VerifyResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, location: Location, message: impl Into<String>) {
        self.errors.push(VerifyError {
            location,
            message: message.into(),
        });
    }
}

impl fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "verification passed");
        }
        writeln!(
            f,
            "verification failed with {} error(s):",
            self.errors.len()
        )?;
        for e in &self.errors {
            writeln!(f, "  {e}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-function verification context
// ---------------------------------------------------------------------------

struct FuncVerifier<'a> {
    func: &'a Function,
    func_name: String,
    symbols: &'a SymbolTable,
    /// Instructions that are placed in some block.
    placed: HashSet<InstRef>,
    result: &'a mut VerifyResult,
}

impl<'a> FuncVerifier<'a> {
    fn new(
        func: &'a Function,
        func_name: String,
        symbols: &'a SymbolTable,
        result: &'a mut VerifyResult,
    ) -> Self {
        Self {
            func,
            func_name,
            symbols,
            placed: HashSet::new(),
            result,
        }
    }

    fn func_loc(&self) -> Location {
        Location::Function(self.func_name.clone())
    }

    fn block_loc(&self, bi: u32) -> Location {
        Location::Block(self.func_name.clone(), bi)
    }

    fn inst_loc(&self, bi: u32, ii: u32) -> Location {
        Location::Instruction(self.func_name.clone(), bi, ii)
    }

    fn is_valid_value(&self, v: ValueRef) -> bool {
        if v.is_block_arg() {
            (v.index() as usize) < self.func.block_args.len()
        } else {
            v.inst().is_some_and(|i| self.placed.contains(&i))
        }
    }

    fn is_valid_block(&self, b: BlockRef) -> bool {
        (b.index() as usize) < self.func.blocks.len()
    }

    fn check_operand(&mut self, v: ValueRef, loc: &Location) {
        if !self.is_valid_value(v) {
            let tag = if v.is_block_arg() {
                "block_arg"
            } else {
                "inst_result"
            };
            self.result
                .error(loc.clone(), format!("dangling {tag} reference {}", v.index()));
        }
    }

    fn expect_type(&mut self, v: ValueRef, expected: &Type, ctx: &str, loc: &Location) {
        if let Some(ty) = self.func.value_type(v) {
            if ty != expected {
                self.result.error(
                    loc.clone(),
                    format!("{ctx}: expected {expected:?}, got {ty:?}"),
                );
            }
        }
    }

    fn expect_int(&mut self, v: ValueRef, ctx: &str, loc: &Location) {
        self.expect_type(v, &Type::Int, ctx, loc);
    }

    fn expect_ptr(&mut self, v: ValueRef, ctx: &str, loc: &Location) {
        if let Some(ty) = self.func.value_type(v) {
            if !ty.is_ptr() {
                self.result
                    .error(loc.clone(), format!("{ctx}: expected Ptr, got {ty:?}"));
            }
        }
    }

    fn expect_result(&mut self, inst: &Instruction, expected: &Type, ctx: &str, loc: &Location) {
        if inst.ty != *expected {
            self.result.error(
                loc.clone(),
                format!("{ctx} result must be {expected:?}, got {:?}", inst.ty),
            );
        }
    }

    fn expect_width(&mut self, bytes: u32, ctx: &str, loc: &Location) {
        if bytes == 0 {
            self.result
                .error(loc.clone(), format!("{ctx}: access width must be > 0"));
        }
    }

    fn check_branch_target(&mut self, target: BlockRef, args: &[ValueRef], loc: &Location) {
        if !self.is_valid_block(target) {
            self.result.error(
                loc.clone(),
                format!("branch target bb{} out of bounds", target.index()),
            );
            return;
        }
        if target == self.func.entry_block() {
            self.result
                .error(loc.clone(), "branch to the entry block is not allowed");
        }
        let expected = self.func.block(target).arg_count;
        if args.len() as u32 != expected {
            self.result.error(
                loc.clone(),
                format!(
                    "branch to bb{} passes {} args, expected {}",
                    target.index(),
                    args.len(),
                    expected
                ),
            );
        }
        let params: Vec<Type> = self
            .func
            .block_args(target)
            .iter()
            .map(|ba| ba.ty.clone())
            .collect();
        for (i, &v) in args.iter().enumerate() {
            self.check_operand(v, loc);
            if let (Some(val_ty), Some(arg_ty)) = (self.func.value_type(v), params.get(i)) {
                if val_ty != arg_ty {
                    self.result.error(
                        loc.clone(),
                        format!(
                            "branch to bb{} arg {}: expected {:?}, got {:?}",
                            target.index(),
                            i,
                            arg_ty,
                            val_ty
                        ),
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Instruction-level type checking
// ---------------------------------------------------------------------------

impl FuncVerifier<'_> {
    fn verify_instruction(&mut self, inst: &Instruction, bi: u32, ii: u32) {
        let loc = self.inst_loc(bi, ii);

        let mut operands = Vec::new();
        inst.op.operands(&mut operands);
        if !matches!(inst.op, Op::Br(..) | Op::BrIf(..)) {
            for &v in &operands {
                self.check_operand(v, &loc);
            }
        }

        match &inst.op {
            Op::Param(idx) => match self.func.params.get(*idx as usize) {
                None => self.result.error(
                    loc,
                    format!(
                        "param index {} out of bounds ({} params)",
                        idx,
                        self.func.params.len()
                    ),
                ),
                Some(declared) if *declared != inst.ty => self.result.error(
                    loc,
                    format!("param {} type {:?} != declared {:?}", idx, inst.ty, declared),
                ),
                Some(_) => {}
            },

            Op::Add(a, b)
            | Op::Sub(a, b)
            | Op::Mul(a, b)
            | Op::And(a, b)
            | Op::Or(a, b)
            | Op::Xor(a, b)
            | Op::Shl(a, b)
            | Op::Shr(a, b) => {
                self.expect_int(*a, "int arith lhs", &loc);
                self.expect_int(*b, "int arith rhs", &loc);
                self.expect_result(inst, &Type::Int, "int arith", &loc);
            }

            Op::Const(_) => self.expect_result(inst, &Type::Int, "const", &loc),
            Op::BConst(_) => self.expect_result(inst, &Type::Bool, "bconst", &loc),

            Op::ICmp(_, a, b) => {
                self.expect_int(*a, "icmp lhs", &loc);
                self.expect_int(*b, "icmp rhs", &loc);
                self.expect_result(inst, &Type::Bool, "icmp", &loc);
            }

            Op::Select(cond, tv, fv) => {
                self.expect_type(*cond, &Type::Bool, "select cond", &loc);
                let (ta, tb) = (self.func.value_type(*tv), self.func.value_type(*fv));
                if let (Some(ta), Some(tb)) = (ta, tb) {
                    if ta != tb {
                        self.result.error(
                            loc.clone(),
                            format!("select arms: type mismatch {ta:?} vs {tb:?}"),
                        );
                    }
                }
            }

            Op::Sext(a, bits) | Op::Zext(a, bits) => {
                self.expect_int(*a, "sext/zext", &loc);
                if *bits == 0 {
                    self.result.error(loc.clone(), "sext/zext bit width must be > 0");
                }
                self.expect_result(inst, &Type::Int, "sext/zext", &loc);
            }

            _ => self.verify_memory_and_rest(inst, &loc),
        }
    }

    fn verify_memory_and_rest(&mut self, inst: &Instruction, loc: &Location) {
        match &inst.op {
            Op::Load(ptr, bytes) | Op::LoadAtomic(ptr, bytes, _) => {
                self.expect_ptr(*ptr, "load ptr", loc);
                self.expect_width(*bytes, "load", loc);
            }
            Op::Store(_, ptr, bytes) | Op::StoreAtomic(_, ptr, bytes, _) => {
                self.expect_ptr(*ptr, "store ptr", loc);
                self.expect_width(*bytes, "store", loc);
                self.expect_result(inst, &Type::Unit, "store", loc);
            }
            Op::AtomicRmw(_, ptr, val, bytes, _) => {
                self.expect_ptr(*ptr, "rmw ptr", loc);
                self.expect_int(*val, "rmw value", loc);
                self.expect_width(*bytes, "rmw", loc);
            }
            Op::AtomicCmpXchg(ptr, expected, desired, bytes, _) => {
                self.expect_ptr(*ptr, "cmpxchg ptr", loc);
                self.expect_int(*expected, "cmpxchg expected", loc);
                self.expect_int(*desired, "cmpxchg desired", loc);
                self.expect_width(*bytes, "cmpxchg", loc);
            }
            Op::MemCopy(dst, src, len) | Op::MemMove(dst, src, len) => {
                self.expect_ptr(*dst, "memcpy dst", loc);
                self.expect_ptr(*src, "memcpy src", loc);
                self.expect_int(*len, "memcpy len", loc);
            }
            Op::MemSet(dst, byte, len) => {
                self.expect_ptr(*dst, "memset dst", loc);
                self.expect_int(*byte, "memset byte", loc);
                self.expect_int(*len, "memset len", loc);
            }
            Op::StackSlot(_, align) => {
                if !align.is_power_of_two() {
                    self.result.error(
                        loc.clone(),
                        format!("stack_slot alignment {align} is not a power of two"),
                    );
                }
                if !inst.ty.is_ptr() {
                    self.result.error(
                        loc.clone(),
                        format!("stack_slot result must be Ptr, got {:?}", inst.ty),
                    );
                }
            }
            Op::LifetimeStart(ptr, _) | Op::LifetimeEnd(ptr, _) => {
                self.expect_ptr(*ptr, "lifetime marker", loc);
            }
            Op::SymbolAddr(sym) => {
                if !self.symbols.contains(*sym) {
                    self.result
                        .error(loc.clone(), format!("unknown symbol id {}", sym.0));
                }
                if !inst.ty.is_ptr() {
                    self.result.error(
                        loc.clone(),
                        format!("symbol_addr result must be Ptr, got {:?}", inst.ty),
                    );
                }
            }
            Op::Call(callee, _) => self.expect_ptr(*callee, "call target", loc),
            Op::PtrAdd(ptr, off) => {
                self.expect_ptr(*ptr, "ptradd ptr", loc);
                self.expect_int(*off, "ptradd offset", loc);
            }
            Op::PtrToAddr(ptr) => {
                self.expect_ptr(*ptr, "ptrtoaddr", loc);
                self.expect_result(inst, &Type::Int, "ptrtoaddr", loc);
            }
            Op::IntToPtr(val) => {
                self.expect_int(*val, "inttoptr", loc);
                if !inst.ty.is_ptr() {
                    self.result.error(
                        loc.clone(),
                        format!("inttoptr result must be Ptr, got {:?}", inst.ty),
                    );
                }
            }
            Op::Ret(val) => match (val, self.func.ret_ty.clone()) {
                (Some(v), Some(ret_ty)) => self.expect_type(*v, &ret_ty, "ret value", loc),
                (Some(_), None) => self
                    .result
                    .error(loc.clone(), "ret with value but function returns nothing"),
                (None, Some(_)) => self.result.error(
                    loc.clone(),
                    "ret without value but function has return type",
                ),
                (None, None) => {}
            },
            Op::Br(target, args) => self.check_branch_target(*target, args, loc),
            Op::BrIf(cond, then_bb, then_args, else_bb, else_args) => {
                self.check_operand(*cond, loc);
                self.expect_type(*cond, &Type::Bool, "brif cond", loc);
                self.check_branch_target(*then_bb, then_args, loc);
                self.check_branch_target(*else_bb, else_args, loc);
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Block structure
// ---------------------------------------------------------------------------

impl FuncVerifier<'_> {
    fn collect_placement(&mut self) {
        for bref in self.func.block_refs() {
            for &inst in self.func.block_insts(bref) {
                if (inst.index() as usize) >= self.func.instructions.len() {
                    let loc = self.block_loc(bref.index());
                    self.result.error(
                        loc,
                        format!("instruction {} out of bounds", inst.index()),
                    );
                } else if !self.placed.insert(inst) {
                    let loc = self.block_loc(bref.index());
                    self.result.error(
                        loc,
                        format!("instruction {} placed more than once", inst.index()),
                    );
                }
            }
        }
    }

    fn verify_blocks(&mut self) {
        for bref in self.func.block_refs() {
            let bi = bref.index();
            let insts = self.func.block_insts(bref).to_vec();
            if insts.is_empty() {
                let loc = self.block_loc(bi);
                self.result.error(loc, "empty basic block");
                continue;
            }
            for (ii, &inst) in insts.iter().enumerate() {
                if (inst.index() as usize) >= self.func.instructions.len() {
                    continue;
                }
                let func = self.func;
                let instruction = func.inst(inst);
                let is_last = ii + 1 == insts.len();
                if instruction.is_terminator() && !is_last {
                    let loc = self.inst_loc(bi, ii as u32);
                    self.result.error(loc, "terminator in the middle of a block");
                }
                if is_last && !instruction.is_terminator() {
                    let loc = self.block_loc(bi);
                    self.result.error(loc, "block does not end with a terminator");
                }
                if matches!(instruction.op, Op::Param(_)) && bref != self.func.entry_block() {
                    let loc = self.inst_loc(bi, ii as u32);
                    self.result.error(loc, "param outside the entry block");
                }
                self.verify_instruction(instruction, bi, ii as u32);
            }
        }
    }

    fn verify_all(&mut self) {
        if self.func.is_declaration() {
            return;
        }
        if self.func.block(self.func.entry_block()).arg_count != 0 {
            let loc = self.func_loc();
            self.result.error(loc, "entry block must not take arguments");
        }
        self.collect_placement();
        self.verify_blocks();
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Verify a single function.
pub fn verify_function(func: &Function, symbols: &SymbolTable) -> VerifyResult {
    let mut result = VerifyResult::default();
    let name = symbols.resolve(func.name).to_string();
    let mut v = FuncVerifier::new(func, name, symbols, &mut result);
    v.verify_all();
    result
}

fn verify_globals(module: &Module, result: &mut VerifyResult) {
    let mut seen = HashSet::new();
    for g in &module.globals {
        let name = module.resolve(g.name).to_string();
        let loc = Location::Global(name.clone());
        if !seen.insert(g.name) {
            result.error(loc.clone(), "duplicate global name");
        }
        if module.function_by_symbol(g.name).is_some() {
            result.error(loc.clone(), "global name collides with a function");
        }
        if !g.align.is_power_of_two() {
            result.error(loc.clone(), format!("alignment {} is not a power of two", g.align));
        }
        if g.padding > g.size {
            result.error(
                loc.clone(),
                format!("padding {} exceeds size {}", g.padding, g.size),
            );
        }
        if let Some(init) = &g.init {
            if init.len() > g.size {
                result.error(
                    loc.clone(),
                    format!("initializer of {} bytes exceeds size {}", init.len(), g.size),
                );
            }
        }
    }
}

fn verify_metadata(module: &Module, result: &mut VerifyResult) {
    for (name, nodes) in &module.named_metadata {
        for node in nodes {
            if module.metadata_node(*node).is_none() {
                result.error(
                    Location::Module,
                    format!("named metadata !{name} references missing node {}", node.index()),
                );
            }
        }
    }
    for (i, node) in module.metadata.iter().enumerate() {
        for op in &node.operands {
            let bad = match op {
                MdOperand::Node(r) => module.metadata_node(*r).is_none(),
                MdOperand::Global(g) => g.index() >= module.globals.len(),
                _ => false,
            };
            if bad {
                result.error(
                    Location::Module,
                    format!("metadata node {i} has a dangling operand {op:?}"),
                );
            }
        }
    }
}

/// Verify an entire module.
pub fn verify_module(module: &Module) -> VerifyResult {
    let mut result = VerifyResult::default();

    // Check for duplicate function names.
    let mut seen_names = HashSet::new();
    for func in &module.functions {
        let name = module.resolve(func.name);
        if !seen_names.insert(name.to_string()) {
            result.error(Location::Module, format!("duplicate function name @{name}"));
        }
    }

    for entry in module.global_ctors.iter().chain(&module.global_dtors) {
        if module.function_by_symbol(entry.function).is_none() {
            result.error(
                Location::Module,
                format!(
                    "ctor/dtor list references unknown function @{}",
                    module.resolve(entry.function)
                ),
            );
        }
    }

    verify_globals(module, &mut result);
    verify_metadata(module, &mut result);

    for func in &module.functions {
        let name = module.resolve(func.name).to_string();
        let mut v = FuncVerifier::new(func, name, &module.symbols, &mut result);
        v.verify_all();
    }

    result
}
