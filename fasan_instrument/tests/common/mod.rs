//! An interpreter for instrumented fasan IR, with a simulated runtime that
//! owns the shadow memory the way the real sanitizer runtime does.

#![allow(dead_code)]

use std::collections::HashMap;

use fasan_instrument::shadow::{object_shadow, ShadowMapping, GLOBAL_REDZONE};
use fasan_instrument::SanitizerConfig;
use fasan_ir::builder::Builder;
use fasan_ir::function::Function;
use fasan_ir::global::{ConstField, Initializer};
use fasan_ir::instruction::{AtomicRmwOp, ICmpOp, Op, Origin};
use fasan_ir::module::{FuncId, Module, SymbolId};
use fasan_ir::types::Type;
use fasan_ir::value::ValueRef;

pub const GLOBALS_BASE: u64 = 0x10_0000;
pub const DESCRIPTOR_SECTION_BASE: u64 = 0x30_0000;
pub const FUNCTIONS_BASE: u64 = 0x40_0000;
pub const HEAP_BASE: u64 = 0x50_0000;
pub const STACK_TOP: u64 = 0x1000_0000;
/// Shadow value the simulated allocator puts around heap chunks.
pub const HEAP_REDZONE: u8 = 0xfa;

const MAX_STEPS: usize = 1_000_000;

pub fn o() -> Origin {
    Origin::synthetic()
}

/// An error the runtime noticed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub routine: String,
    pub addr: u64,
    pub size: u64,
}

/// Why execution stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    Unreachable,
    Trap,
    Unwind,
    /// The runtime aborted after a report.
    Abort,
}

/// A descriptor the runtime accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub beg: u64,
    pub size: u64,
    pub size_with_redzone: u64,
    pub name: String,
    pub module_name: String,
    pub has_dynamic_init: bool,
    pub location: Option<(String, u32, u32)>,
    pub odr_indicator: u64,
}

pub struct Machine<'m> {
    module: &'m Module,
    mapping: ShadowMapping,
    memory: HashMap<u64, u8>,
    addresses: HashMap<SymbolId, u64>,
    functions: HashMap<u64, FuncId>,
    sp: u64,
    heap: u64,
    steps: usize,
    pub reports: Vec<Report>,
    /// Every call of a function without a body, with its arguments.
    pub calls: Vec<(String, Vec<u64>)>,
    /// Shadow bytes captured by `snapshot_shadow(ptr, len)`.
    pub snapshots: Vec<Vec<u8>>,
    pub registered: Vec<Registered>,
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module, config: &SanitizerConfig) -> Self {
        let mut machine = Self {
            module,
            mapping: config.shadow_mapping(),
            memory: HashMap::new(),
            addresses: HashMap::new(),
            functions: HashMap::new(),
            sp: STACK_TOP,
            heap: HEAP_BASE,
            steps: 0,
            reports: Vec::new(),
            calls: Vec::new(),
            snapshots: Vec::new(),
            registered: Vec::new(),
        };
        machine.load();
        machine
    }

    fn load(&mut self) {
        let module = self.module;
        for id in module.func_ids() {
            let addr = FUNCTIONS_BASE + id.0 as u64 * 16;
            self.addresses.insert(module.function(id).name, addr);
            self.functions.insert(addr, id);
        }
        let mut next = GLOBALS_BASE;
        let mut next_descriptor = DESCRIPTOR_SECTION_BASE;
        for g in &module.globals {
            let align = (g.align as u64).max(1);
            let cursor = if g.section.as_deref() == Some("asan_globals") {
                &mut next_descriptor
            } else {
                &mut next
            };
            let addr = cursor.next_multiple_of(align);
            *cursor = addr + g.size.max(1);
            self.addresses.insert(g.name, addr);
        }
        for (name, addr) in [
            ("__start_asan_globals", DESCRIPTOR_SECTION_BASE),
            ("__stop_asan_globals", next_descriptor),
        ] {
            if let Some(sym) = module.symbols.get(name) {
                self.addresses.insert(sym, addr);
            }
        }
        for g in &module.globals {
            let addr = self.addresses[&g.name];
            match &g.init {
                Some(Initializer::Bytes(bytes)) => self.write(addr, bytes),
                Some(Initializer::Fields(fields)) => {
                    let mut at = addr;
                    for field in fields {
                        match field {
                            ConstField::Int { value, bytes } => {
                                self.write_int(at, *value as i128, *bytes as u64)
                            }
                            ConstField::Addr(sym) => {
                                let target = self.addresses[sym];
                                self.write_int(at, target as i128, 8);
                            }
                            ConstField::Bytes(bytes) => self.write(at, bytes),
                            ConstField::Zero(_) => {}
                        }
                        at += field.size();
                    }
                }
                _ => {}
            }
        }
    }

    // -- memory ------------------------------------------------------------

    pub fn read(&self, addr: u64, len: u64) -> Vec<u8> {
        (addr..addr + len)
            .map(|a| self.memory.get(&a).copied().unwrap_or(0))
            .collect()
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, byte);
        }
    }

    pub fn read_int(&self, addr: u64, len: u64) -> u128 {
        self.read(addr, len)
            .iter()
            .rev()
            .fold(0u128, |acc, &b| (acc << 8) | b as u128)
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        self.read_int(addr, 8) as u64
    }

    pub fn write_int(&mut self, addr: u64, value: i128, len: u64) {
        let bytes = (value as u128).to_le_bytes();
        self.write(addr, &bytes[..len as usize]);
    }

    pub fn read_cstr(&self, addr: u64) -> String {
        let mut bytes = Vec::new();
        let mut at = addr;
        loop {
            let b = self.read(at, 1)[0];
            if b == 0 {
                break;
            }
            bytes.push(b);
            at += 1;
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn address_of(&self, name: &str) -> u64 {
        let sym = self.module.symbols.get(name).expect("unknown symbol");
        self.addresses[&sym]
    }

    pub fn granularity(&self) -> u64 {
        self.mapping.granularity()
    }

    pub fn shadow_byte(&self, addr: u64) -> u8 {
        self.read(self.mapping.shadow_addr(addr), 1)[0]
    }

    /// Shadow bytes of the granules covering `[addr, addr + len)`.
    pub fn shadow(&self, addr: u64, len: u64) -> Vec<u8> {
        let g = self.granularity();
        let first = addr / g * g;
        (first..addr + len)
            .step_by(g as usize)
            .map(|a| self.shadow_byte(a))
            .collect()
    }

    /// Overwrite shadow bytes starting at the granule of `addr`.
    pub fn set_shadow(&mut self, addr: u64, bytes: &[u8]) {
        let shadow = self.mapping.shadow_addr(addr);
        self.write(shadow, bytes);
    }

    /// The first byte of `[addr, addr + len)` that may not be accessed.
    pub fn first_poisoned(&self, addr: u64, len: u64) -> Option<u64> {
        (addr..addr + len).find(|&a| !self.mapping.byte_addressable(a, self.shadow_byte(a)))
    }

    /// Allocate `size` bytes surrounded by poisoned redzones.
    pub fn malloc(&mut self, size: u64) -> u64 {
        let g = self.granularity();
        let left = 32;
        let total = (size + 32).next_multiple_of(32);
        let base = self.heap;
        self.heap += left + total;
        self.set_shadow(base, &vec![HEAP_REDZONE; (left / g) as usize]);
        let addr = base + left;
        self.set_shadow(addr, &object_shadow(size, total, g, HEAP_REDZONE));
        addr
    }

    /// Whether no byte of the simulated stack is poisoned.
    pub fn stack_shadow_clean(&self) -> bool {
        let lo = self.mapping.shadow_addr(STACK_TOP - 0x10_0000);
        let hi = self.mapping.shadow_addr(STACK_TOP);
        self.memory
            .iter()
            .all(|(&a, &v)| !(lo..hi).contains(&a) || v == 0)
    }

    pub fn calls_to(&self, name: &str) -> Vec<&Vec<u64>> {
        self.calls
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, args)| args)
            .collect()
    }

    pub fn call_names(&self) -> Vec<&str> {
        self.calls.iter().map(|(n, _)| n.as_str()).collect()
    }

    // -- execution ---------------------------------------------------------

    /// Run every constructor in priority order.
    pub fn run_ctors(&mut self) -> Result<(), Stop> {
        let mut ctors = self.module.global_ctors.clone();
        ctors.sort_by_key(|c| c.priority);
        for ctor in ctors {
            let id = self.module.function_by_symbol(ctor.function).expect("ctor");
            self.call_function(id, &[])?;
        }
        Ok(())
    }

    pub fn run_dtors(&mut self) -> Result<(), Stop> {
        let mut dtors = self.module.global_dtors.clone();
        dtors.sort_by_key(|c| c.priority);
        for dtor in dtors {
            let id = self.module.function_by_symbol(dtor.function).expect("dtor");
            self.call_function(id, &[])?;
        }
        Ok(())
    }

    pub fn call(&mut self, name: &str, args: &[i128]) -> Result<Option<i128>, Stop> {
        let id = self.module.function_by_name(name).expect("unknown function");
        self.call_function(id, args)
    }

    fn call_function(&mut self, id: FuncId, args: &[i128]) -> Result<Option<i128>, Stop> {
        let module = self.module;
        let func = module.function(id);
        if func.is_declaration() {
            let name = module.resolve(func.name).to_string();
            return self.runtime_call(&name, args);
        }
        let saved_sp = self.sp;
        let result = self.execute(func, args);
        self.sp = saved_sp;
        result
    }

    fn execute(&mut self, func: &Function, args: &[i128]) -> Result<Option<i128>, Stop> {
        let mut values: HashMap<ValueRef, i128> = HashMap::new();
        let mut block = func.entry_block();
        'blocks: loop {
            for &inst in func.block_insts(block) {
                self.steps += 1;
                assert!(self.steps < MAX_STEPS, "step limit exceeded");
                let v = |r: &ValueRef| values[r];
                let result: i128 = match &func.inst(inst).op {
                    Op::Param(i) => args[*i as usize],
                    Op::Const(c) => *c as i128,
                    Op::BConst(b) => *b as i128,
                    Op::Add(a, b) => v(a) + v(b),
                    Op::Sub(a, b) => v(a) - v(b),
                    Op::Mul(a, b) => v(a) * v(b),
                    Op::And(a, b) => v(a) & v(b),
                    Op::Or(a, b) => v(a) | v(b),
                    Op::Xor(a, b) => v(a) ^ v(b),
                    Op::Shl(a, b) => v(a) << v(b),
                    Op::Shr(a, b) => v(a) >> v(b),
                    Op::ICmp(op, a, b) => {
                        let (a, b) = (v(a), v(b));
                        let r = match op {
                            ICmpOp::Eq => a == b,
                            ICmpOp::Ne => a != b,
                            ICmpOp::Lt => a < b,
                            ICmpOp::Le => a <= b,
                            ICmpOp::Gt => a > b,
                            ICmpOp::Ge => a >= b,
                        };
                        r as i128
                    }
                    Op::Select(c, t, f) => {
                        if v(c) != 0 {
                            v(t)
                        } else {
                            v(f)
                        }
                    }
                    Op::Sext(a, bits) => {
                        let shift = 128 - *bits;
                        (v(a) << shift) >> shift
                    }
                    Op::Zext(a, bits) => v(a) & ((1i128 << *bits) - 1),
                    Op::Load(p, n) | Op::LoadAtomic(p, n, _) => {
                        self.read_int(v(p) as u64, *n as u64) as i128
                    }
                    Op::Store(val, p, n) | Op::StoreAtomic(val, p, n, _) => {
                        let (addr, val) = (v(p) as u64, v(val));
                        self.write_int(addr, val, *n as u64);
                        0
                    }
                    Op::AtomicRmw(op, p, val, n, _) => {
                        let (addr, val, n) = (v(p) as u64, v(val), *n as u64);
                        let old = self.read_int(addr, n) as i128;
                        let new = match op {
                            AtomicRmwOp::Xchg => val,
                            AtomicRmwOp::Add => old + val,
                            AtomicRmwOp::Sub => old - val,
                            AtomicRmwOp::And => old & val,
                            AtomicRmwOp::Or => old | val,
                            AtomicRmwOp::Xor => old ^ val,
                        };
                        self.write_int(addr, new, n);
                        old
                    }
                    Op::AtomicCmpXchg(p, expected, desired, n, _) => {
                        let (addr, n) = (v(p) as u64, *n as u64);
                        let old = self.read_int(addr, n) as i128;
                        if old == v(expected) {
                            let desired = v(desired);
                            self.write_int(addr, desired, n);
                        }
                        old
                    }
                    Op::MemCopy(d, s, n) | Op::MemMove(d, s, n) => {
                        let bytes = self.read(v(s) as u64, v(n) as u64);
                        self.write(v(d) as u64, &bytes);
                        0
                    }
                    Op::MemSet(d, byte, n) => {
                        let bytes = vec![v(byte) as u8; v(n) as usize];
                        self.write(v(d) as u64, &bytes);
                        0
                    }
                    Op::StackSlot(size, align) => {
                        self.sp = (self.sp - *size as u64) & !(*align as u64 - 1);
                        self.sp as i128
                    }
                    Op::LifetimeStart(..) | Op::LifetimeEnd(..) => 0,
                    Op::SymbolAddr(sym) => self.addresses[sym] as i128,
                    Op::Call(callee, call_args) => {
                        let target = self.functions[&(v(callee) as u64)];
                        let call_args: Vec<i128> = call_args.iter().map(v).collect();
                        self.call_function(target, &call_args)?.unwrap_or(0)
                    }
                    Op::PtrAdd(p, off) => v(p) + v(off),
                    Op::PtrToAddr(p) => v(p),
                    Op::IntToPtr(a) => v(a) as u64 as i128,
                    Op::Ret(val) => return Ok(val.as_ref().map(v)),
                    Op::Br(target, br_args) => {
                        let incoming: Vec<i128> = br_args.iter().map(v).collect();
                        for (param, value) in func.block_arg_values(*target).into_iter().zip(incoming) {
                            values.insert(param, value);
                        }
                        block = *target;
                        continue 'blocks;
                    }
                    Op::BrIf(c, then_bb, then_args, else_bb, else_args) => {
                        let (target, br_args) = if v(c) != 0 {
                            (then_bb, then_args)
                        } else {
                            (else_bb, else_args)
                        };
                        let incoming: Vec<i128> = br_args.iter().map(v).collect();
                        for (param, value) in func.block_arg_values(*target).into_iter().zip(incoming) {
                            values.insert(param, value);
                        }
                        block = *target;
                        continue 'blocks;
                    }
                    Op::Unwind => return Err(Stop::Unwind),
                    Op::Unreachable => return Err(Stop::Unreachable),
                    Op::Trap => return Err(Stop::Trap),
                };
                values.insert(inst.value(), result);
            }
            panic!("block without terminator");
        }
    }

    // -- simulated runtime -------------------------------------------------

    fn runtime_call(&mut self, name: &str, args: &[i128]) -> Result<Option<i128>, Stop> {
        let args_u64: Vec<u64> = args.iter().map(|&a| a as u64).collect();
        self.calls.push((name.to_string(), args_u64.clone()));
        let a = |i: usize| args_u64[i];
        if let Some(rest) = name.strip_prefix("__asan_report_") {
            let size = access_size(rest).unwrap_or_else(|| a(1));
            self.reports.push(Report {
                routine: name.to_string(),
                addr: a(0),
                size,
            });
            return Ok(None);
        }
        if let Some(value) = name.strip_prefix("__asan_set_shadow_") {
            let value = u8::from_str_radix(value, 16).expect("set_shadow suffix");
            self.write(a(0), &vec![value; a(1) as usize]);
            return Ok(None);
        }
        match name {
            "__asan_register_globals" => {
                for i in 0..a(1) {
                    self.register(a(0) + i * 64);
                }
            }
            "__asan_unregister_globals" => {
                for i in 0..a(1) {
                    self.unregister(a(0) + i * 64);
                }
            }
            "__asan_register_elf_globals" => {
                if self.read_u64(a(0)) == 0 {
                    self.write_int(a(0), 1, 8);
                    for desc in (a(1)..a(2)).step_by(64) {
                        self.register(desc);
                    }
                }
            }
            "__asan_unregister_elf_globals" => {
                if self.read_u64(a(0)) != 0 {
                    self.write_int(a(0), 0, 8);
                    for desc in (a(1)..a(2)).step_by(64) {
                        self.unregister(desc);
                    }
                }
            }
            "__asan_register_image_globals" | "__asan_unregister_image_globals" => {
                let register = name == "__asan_register_image_globals";
                let descriptors: Vec<u64> = self
                    .module
                    .globals
                    .iter()
                    .filter(|g| g.section.as_deref() == Some("__DATA,__asan_globals"))
                    .map(|g| self.addresses[&g.name])
                    .collect();
                for desc in descriptors {
                    if register {
                        self.register(desc);
                    } else {
                        self.unregister(desc);
                    }
                }
            }
            "__asan_memcpy" | "__asan_memmove" | "__asan_memset" => {
                let len = a(2);
                let mut ranges = vec![a(0)];
                if name != "__asan_memset" {
                    ranges.push(a(1));
                }
                for start in ranges {
                    if let Some(bad) = self.first_poisoned(start, len) {
                        self.reports.push(Report {
                            routine: name.to_string(),
                            addr: bad,
                            size: len,
                        });
                        return Err(Stop::Abort);
                    }
                }
                if name == "__asan_memset" {
                    self.write(a(0), &vec![a(1) as u8; len as usize]);
                } else {
                    let bytes = self.read(a(1), len);
                    self.write(a(0), &bytes);
                }
                return Ok(Some(a(0) as i128));
            }
            "snapshot_shadow" => {
                let shadow = self.shadow(a(0), a(1));
                self.snapshots.push(shadow);
            }
            _ => {
                if let Some(outlined) = outlined_check(name) {
                    let (access, size, recover) = outlined;
                    let size = size.unwrap_or_else(|| a(1));
                    if self.first_poisoned(a(0), size).is_some() {
                        self.reports.push(Report {
                            routine: format!("__asan_report_{access}"),
                            addr: a(0),
                            size,
                        });
                        if !recover {
                            return Err(Stop::Abort);
                        }
                    }
                }
            }
        }
        Ok(Some(0))
    }

    fn register(&mut self, desc: u64) {
        let field = |m: &Self, i: u64| m.read_u64(desc + 8 * i);
        let location = match field(self, 6) {
            0 => None,
            loc => Some((
                self.read_cstr(self.read_u64(loc)),
                self.read_int(loc + 8, 4) as u32,
                self.read_int(loc + 12, 4) as u32,
            )),
        };
        let registered = Registered {
            beg: field(self, 0),
            size: field(self, 1),
            size_with_redzone: field(self, 2),
            name: self.read_cstr(field(self, 3)),
            module_name: self.read_cstr(field(self, 4)),
            has_dynamic_init: field(self, 5) != 0,
            location,
            odr_indicator: field(self, 7),
        };
        let shadow = object_shadow(
            registered.size,
            registered.size_with_redzone,
            self.granularity(),
            GLOBAL_REDZONE,
        );
        self.set_shadow(registered.beg, &shadow);
        self.registered.push(registered);
    }

    fn unregister(&mut self, desc: u64) {
        let beg = self.read_u64(desc);
        let total = self.read_u64(desc + 16);
        let g = self.granularity();
        self.set_shadow(beg, &vec![0; (total / g) as usize]);
        self.registered.retain(|r| r.beg != beg);
    }
}

/// Size encoded in a report or check routine suffix such as `load4` or
/// `store16_noabort`; `None` for the `_n`/`N` variants.
fn access_size(suffix: &str) -> Option<u64> {
    let digits: String = suffix
        .trim_start_matches("load")
        .trim_start_matches("store")
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Decode `__asan_{load,store}{N,1,2,4,8,16}[_noabort]`.
fn outlined_check(name: &str) -> Option<(String, Option<u64>, bool)> {
    let rest = name.strip_prefix("__asan_")?;
    let (body, recover) = match rest.strip_suffix("_noabort") {
        Some(body) => (body, true),
        None => (rest, false),
    };
    let kind = ["load", "store"].into_iter().find(|k| body.starts_with(k))?;
    let size = &body[kind.len()..];
    if size == "N" {
        return Some((format!("{kind}_n"), None, recover));
    }
    let size: u64 = size.parse().ok()?;
    Some((format!("{kind}{size}"), Some(size), recover))
}

// ---------------------------------------------------------------------------
// Module construction helpers
// ---------------------------------------------------------------------------

/// Add a function built by `body`, which receives the builder positioned in
/// the entry block.
pub fn define(
    module: &mut Module,
    name: &str,
    params: Vec<Type>,
    ret: Option<Type>,
    body: impl FnOnce(&mut Builder<'_>, &[ValueRef]),
) -> FuncId {
    let sym = module.intern(name);
    let mut func = Function::new(sym, params.clone(), ret);
    {
        let mut b = Builder::new(&mut func);
        let entry = b.create_block();
        b.switch_to_block(entry);
        let values: Vec<ValueRef> = params
            .iter()
            .enumerate()
            .map(|(i, ty)| b.param(i as u32, ty.clone(), o()))
            .collect();
        body(&mut b, &values);
    }
    module.add_function(func)
}

/// Declare an external function.
pub fn declare(module: &mut Module, name: &str, params: Vec<Type>) -> SymbolId {
    module.declare_function(name, params, None)
}

/// Assert that `module` passes the IR verifier.
pub fn assert_verifies(module: &Module) {
    let result = fasan_ir::verifier::verify_module(module);
    assert!(result.is_ok(), "{result}");
}
