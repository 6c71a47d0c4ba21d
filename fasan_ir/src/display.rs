//! Cranelift-style text format for fasan IR.
//!
//! Output format:
//! ```text
//! global @g: size 64 (pad 52), align 32, external
//!
//! func @name(int, int) -> int {
//!   bb0:
//!     v0 = param 0
//!     v1 = param 1
//!     v2 = add v0, v1
//!     ret v2
//! }
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::function::Function;
use crate::global::{GlobalVar, Initializer, Linkage};
use crate::instruction::{AtomicRmwOp, ICmpOp, Op};
use crate::module::{Module, SymbolId, SymbolTable};
use crate::types::Type;
use crate::value::{BlockRef, ValueRef};

/// Display context that tracks value numbering.
struct DisplayCtx<'a> {
    /// Map from ValueRef raw encoding to display number.
    value_names: HashMap<u32, u32>,
    next_value: u32,
    symbols: &'a SymbolTable,
}

impl<'a> DisplayCtx<'a> {
    fn new(symbols: &'a SymbolTable) -> Self {
        Self {
            value_names: HashMap::new(),
            next_value: 0,
            symbols,
        }
    }

    /// Assign the next sequential number to a value.
    fn assign(&mut self, vref: ValueRef) -> u32 {
        let n = self.next_value;
        self.value_names.insert(vref.raw(), n);
        self.next_value += 1;
        n
    }

    /// Format a value as "vN". Values outside any block print as "?N".
    fn fmt_val(&self, vref: ValueRef) -> String {
        match self.value_names.get(&vref.raw()) {
            Some(n) => format!("v{n}"),
            None => format!("?{}", vref.raw()),
        }
    }

    /// Format a comma-separated list of values.
    fn fmt_vals(&self, vrefs: &[ValueRef]) -> String {
        vrefs
            .iter()
            .map(|v| self.fmt_val(*v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn fmt_sym(&self, sym: SymbolId) -> String {
        if self.symbols.contains(sym) {
            format!("@{}", self.symbols.resolve(sym))
        } else {
            format!("@<sym{}>", sym.0)
        }
    }
}

fn fmt_type(ty: &Type) -> String {
    match ty {
        Type::Int => "int".to_string(),
        Type::Bool => "bool".to_string(),
        Type::Ptr(0) => "ptr".to_string(),
        Type::Ptr(aspace) => format!("ptr<{aspace}>"),
        Type::Unit => "unit".to_string(),
    }
}

fn fmt_icmp_op(op: &ICmpOp) -> &'static str {
    match op {
        ICmpOp::Eq => "eq",
        ICmpOp::Ne => "ne",
        ICmpOp::Lt => "lt",
        ICmpOp::Le => "le",
        ICmpOp::Gt => "gt",
        ICmpOp::Ge => "ge",
    }
}

fn fmt_rmw_op(op: &AtomicRmwOp) -> &'static str {
    match op {
        AtomicRmwOp::Xchg => "xchg",
        AtomicRmwOp::Add => "add",
        AtomicRmwOp::Sub => "sub",
        AtomicRmwOp::And => "and",
        AtomicRmwOp::Or => "or",
        AtomicRmwOp::Xor => "xor",
    }
}

fn fmt_linkage(linkage: Linkage) -> &'static str {
    match linkage {
        Linkage::External => "external",
        Linkage::Internal => "internal",
        Linkage::Private => "private",
        Linkage::Weak => "weak",
        Linkage::WeakOdr => "weak_odr",
        Linkage::LinkOnce => "linkonce",
        Linkage::LinkOnceOdr => "linkonce_odr",
        Linkage::Common => "common",
        Linkage::ExternWeak => "extern_weak",
        Linkage::AvailableExternally => "available_externally",
    }
}

/// First pass: assign display numbers to all values in block order.
/// Block args get numbered before instructions within each block.
fn assign_values(func: &Function, ctx: &mut DisplayCtx<'_>) {
    for bref in func.block_refs() {
        for v in func.block_arg_values(bref) {
            ctx.assign(v);
        }
        for &inst in func.block_insts(bref) {
            ctx.assign(inst.value());
        }
    }
}

fn bin(ctx: &DisplayCtx<'_>, v: &str, name: &str, a: ValueRef, b: ValueRef) -> String {
    format!("{v} = {name} {}, {}", ctx.fmt_val(a), ctx.fmt_val(b))
}

/// Format a single instruction. Returns the formatted string (without leading indent).
fn fmt_inst(vref: ValueRef, op: &Op, ty: &Type, ctx: &DisplayCtx<'_>) -> String {
    let v = ctx.fmt_val(vref);
    match op {
        Op::Param(idx) => format!("{v} = param {idx}"),
        Op::Const(imm) => format!("{v} = iconst {imm}"),
        Op::BConst(b) => format!("{v} = bconst {b}"),
        Op::Add(a, b) => bin(ctx, &v, "add", *a, *b),
        Op::Sub(a, b) => bin(ctx, &v, "sub", *a, *b),
        Op::Mul(a, b) => bin(ctx, &v, "mul", *a, *b),
        Op::And(a, b) => bin(ctx, &v, "and", *a, *b),
        Op::Or(a, b) => bin(ctx, &v, "or", *a, *b),
        Op::Xor(a, b) => bin(ctx, &v, "xor", *a, *b),
        Op::Shl(a, b) => bin(ctx, &v, "shl", *a, *b),
        Op::Shr(a, b) => bin(ctx, &v, "shr", *a, *b),
        Op::ICmp(cmp, a, b) => format!(
            "{v} = icmp.{} {}, {}",
            fmt_icmp_op(cmp),
            ctx.fmt_val(*a),
            ctx.fmt_val(*b)
        ),
        Op::Select(c, t, f) => format!(
            "{v} = select {}, {}, {}",
            ctx.fmt_val(*c),
            ctx.fmt_val(*t),
            ctx.fmt_val(*f)
        ),
        Op::Sext(src, bits) => format!("{v} = sext {}, {bits}", ctx.fmt_val(*src)),
        Op::Zext(src, bits) => format!("{v} = zext {}, {bits}", ctx.fmt_val(*src)),
        Op::Load(ptr, bytes) => format!("{v} = load.{} {}, {bytes}", fmt_type(ty), ctx.fmt_val(*ptr)),
        Op::Store(val, ptr, bytes) => format!(
            "store {}, {}, {bytes}",
            ctx.fmt_val(*val),
            ctx.fmt_val(*ptr)
        ),
        Op::LoadAtomic(ptr, bytes, ord) => format!(
            "{v} = load.atomic.{} {}, {bytes}, {ord:?}",
            fmt_type(ty),
            ctx.fmt_val(*ptr)
        ),
        Op::StoreAtomic(val, ptr, bytes, ord) => format!(
            "store.atomic {}, {}, {bytes}, {ord:?}",
            ctx.fmt_val(*val),
            ctx.fmt_val(*ptr)
        ),
        Op::AtomicRmw(rmw, ptr, val, bytes, ord) => format!(
            "{v} = rmw.{} {}, {}, {bytes}, {ord:?}",
            fmt_rmw_op(rmw),
            ctx.fmt_val(*ptr),
            ctx.fmt_val(*val)
        ),
        Op::AtomicCmpXchg(ptr, expected, desired, bytes, ord) => format!(
            "{v} = cmpxchg {}, {}, {}, {bytes}, {ord:?}",
            ctx.fmt_val(*ptr),
            ctx.fmt_val(*expected),
            ctx.fmt_val(*desired)
        ),
        Op::MemCopy(d, s, n) => format!("memcpy {}", ctx.fmt_vals(&[*d, *s, *n])),
        Op::MemMove(d, s, n) => format!("memmove {}", ctx.fmt_vals(&[*d, *s, *n])),
        Op::MemSet(d, b, n) => format!("memset {}", ctx.fmt_vals(&[*d, *b, *n])),
        Op::StackSlot(bytes, align) => format!("{v} = stack_slot {bytes}, align {align}"),
        Op::LifetimeStart(ptr, size) => format!("lifetime.start {}, {size}", ctx.fmt_val(*ptr)),
        Op::LifetimeEnd(ptr, size) => format!("lifetime.end {}, {size}", ctx.fmt_val(*ptr)),
        Op::SymbolAddr(sym) => format!("{v} = symbol_addr {}", ctx.fmt_sym(*sym)),
        Op::Call(callee, args) => {
            let call = format!("call {}({})", ctx.fmt_val(*callee), ctx.fmt_vals(args));
            if *ty == Type::Unit {
                call
            } else {
                format!("{v} = {call}")
            }
        }
        Op::PtrAdd(ptr, off) => bin(ctx, &v, "ptradd", *ptr, *off),
        Op::PtrToAddr(ptr) => format!("{v} = ptrtoaddr {}", ctx.fmt_val(*ptr)),
        Op::IntToPtr(val) => format!("{v} = inttoptr {}", ctx.fmt_val(*val)),
        Op::Ret(val) => match val {
            Some(val) => format!("ret {}", ctx.fmt_val(*val)),
            None => "ret".to_string(),
        },
        Op::Br(target, args) => format!("br {}", fmt_branch_target(*target, args, ctx)),
        Op::BrIf(cond, then_bb, then_args, else_bb, else_args) => {
            let cond_s = ctx.fmt_val(*cond);
            let then_s = fmt_branch_target(*then_bb, then_args, ctx);
            let else_s = fmt_branch_target(*else_bb, else_args, ctx);
            format!("brif {cond_s}, {then_s}, {else_s}")
        }
        Op::Unwind => "unwind".to_string(),
        Op::Unreachable => "unreachable".to_string(),
        Op::Trap => "trap".to_string(),
    }
}

fn fmt_branch_target(block: BlockRef, args: &[ValueRef], ctx: &DisplayCtx<'_>) -> String {
    if args.is_empty() {
        format!("bb{}", block.index())
    } else {
        format!("bb{}({})", block.index(), ctx.fmt_vals(args))
    }
}

/// Format a basic block header: `bb0(v0: int, v1: int):`
fn fmt_block_header(func: &Function, bref: BlockRef, ctx: &DisplayCtx<'_>) -> String {
    let args = func.block_arg_values(bref);
    if args.is_empty() {
        format!("bb{}:", bref.index())
    } else {
        let args: Vec<String> = args
            .iter()
            .zip(func.block_args(bref))
            .map(|(v, ba)| format!("{}: {}", ctx.fmt_val(*v), fmt_type(&ba.ty)))
            .collect();
        format!("bb{}({}):", bref.index(), args.join(", "))
    }
}

fn write_function(
    f: &mut fmt::Formatter<'_>,
    func: &Function,
    symbols: &SymbolTable,
) -> fmt::Result {
    let mut ctx = DisplayCtx::new(symbols);
    assign_values(func, &mut ctx);

    let params: Vec<String> = func.params.iter().map(fmt_type).collect();
    let keyword = if func.is_declaration() { "declare" } else { "func" };
    write!(
        f,
        "{keyword} {}({})",
        ctx.fmt_sym(func.name),
        params.join(", ")
    )?;
    if let Some(ref ret_ty) = func.ret_ty {
        write!(f, " -> {}", fmt_type(ret_ty))?;
    }
    if func.is_declaration() {
        return Ok(());
    }
    writeln!(f, " {{")?;
    for bref in func.block_refs() {
        writeln!(f, "  {}", fmt_block_header(func, bref, &ctx))?;
        for &inst in func.block_insts(bref) {
            let i = func.inst(inst);
            writeln!(f, "    {}", fmt_inst(inst.value(), &i.op, &i.ty, &ctx))?;
        }
    }
    write!(f, "}}")
}

fn write_global(f: &mut fmt::Formatter<'_>, g: &GlobalVar, symbols: &SymbolTable) -> fmt::Result {
    write!(f, "global @{}: size {}", symbols.resolve(g.name), g.size)?;
    if g.padding > 0 {
        write!(f, " (pad {})", g.padding)?;
    }
    write!(f, ", align {}, {}", g.align, fmt_linkage(g.linkage))?;
    if g.constant {
        write!(f, ", constant")?;
    }
    if g.thread_local {
        write!(f, ", thread_local")?;
    }
    if let Some(ref section) = g.section {
        write!(f, ", section \"{section}\"")?;
    }
    match &g.init {
        None => Ok(()),
        Some(Initializer::Zero) => write!(f, " = zeroinitializer"),
        Some(Initializer::Bytes(bytes)) => write!(f, " = bytes[{}]", bytes.len()),
        Some(Initializer::Fields(fields)) => write!(f, " = fields[{}]", fields.len()),
    }
}

/// Render a function using the module's symbol table.
pub fn display_function(func: &Function, symbols: &SymbolTable) -> String {
    struct Wrapper<'a>(&'a Function, &'a SymbolTable);
    impl fmt::Display for Wrapper<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write_function(f, self.0, self.1)
        }
    }
    Wrapper(func, symbols).to_string()
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module \"{}\"", self.name)?;
        for g in &self.globals {
            write_global(f, g, &self.symbols)?;
            writeln!(f)?;
        }
        for ctor in &self.global_ctors {
            writeln!(f, "ctor {} @{}", ctor.priority, self.resolve(ctor.function))?;
        }
        for dtor in &self.global_dtors {
            writeln!(f, "dtor {} @{}", dtor.priority, self.resolve(dtor.function))?;
        }
        for func in &self.functions {
            writeln!(f)?;
            write_function(f, func, &self.symbols)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
