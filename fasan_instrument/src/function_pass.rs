//! Function instrumentation: shadow checks before memory accesses and
//! redzoned stack frames.
//!
//! The pass works in three phases over one function:
//!
//! 1. collect the accesses that need a check and the stack slots that get
//!    redzones, before anything is mutated;
//! 2. instrument the accesses, walking each block backwards so recorded
//!    positions stay valid while blocks are split behind them;
//! 3. merge the stack slots into one frame (see [`crate::stack`]).

use std::collections::{HashMap, HashSet};

use fasan_ir::builder::Builder;
use fasan_ir::function::Function;
use fasan_ir::global::{GlobalId, GlobalVar};
use fasan_ir::instruction::{ICmpOp, Op, Origin};
use fasan_ir::module::{FuncId, Module, SymbolId, SymbolTable};
use fasan_ir::types::Type;
use fasan_ir::value::{BlockRef, InstRef, ValueRef};
use tracing::{debug, debug_span, trace};

use crate::analysis::{AnalysisKind, PassOutcome, PassStats, PreservedAnalyses};
use crate::config::SanitizerConfig;
use crate::error::{InstrumentError, InstrumentResult};
use crate::metadata::GlobalsMetadata;
use crate::runtime::{self, AccessType, RuntimeDecls};
use crate::shadow::ShadowMapping;
use crate::stack;

/// Emit `(addr >> scale) + offset` as an integer.
pub(crate) fn emit_shadow_addr(
    b: &mut Builder<'_>,
    mapping: &ShadowMapping,
    addr: ValueRef,
    origin: &Origin,
) -> ValueRef {
    let scale = b.iconst(mapping.scale as i64, origin.clone());
    let shifted = b.shr(addr, scale, origin.clone());
    // Offsets above i64::MAX wrap; inttoptr takes the sum modulo 2^64.
    let offset = b.iconst(mapping.offset as i64, origin.clone());
    b.add(shifted, offset, origin.clone())
}

/// A memory access as seen by the instrumentation.
#[derive(Debug, Clone, Copy)]
struct MemoryAccess {
    ptr: ValueRef,
    size: u32,
    access: AccessType,
    atomic: bool,
}

fn memory_access(op: &Op) -> Option<MemoryAccess> {
    let (ptr, size, access, atomic) = match op {
        Op::Load(ptr, size) => (*ptr, *size, AccessType::Load, false),
        Op::Store(_, ptr, size) => (*ptr, *size, AccessType::Store, false),
        Op::LoadAtomic(ptr, size, _) => (*ptr, *size, AccessType::Load, true),
        Op::StoreAtomic(_, ptr, size, _) => (*ptr, *size, AccessType::Store, true),
        Op::AtomicRmw(_, ptr, _, size, _) => (*ptr, *size, AccessType::Store, true),
        Op::AtomicCmpXchg(ptr, _, _, size, _) => (*ptr, *size, AccessType::Store, true),
        _ => return None,
    };
    Some(MemoryAccess {
        ptr,
        size,
        access,
        atomic,
    })
}

#[derive(Debug, Clone, Copy)]
enum SiteKind {
    Check(MemoryAccess),
    /// memcpy/memmove/memset rewritten into a runtime call.
    Intrinsic,
}

#[derive(Debug, Clone, Copy)]
struct Site {
    inst: InstRef,
    block: BlockRef,
    pos: usize,
    kind: SiteKind,
}

/// Strip constant `ptradd`s: returns the base pointer and the total offset.
pub(crate) fn base_and_offset(func: &Function, ptr: ValueRef) -> Option<(ValueRef, i64)> {
    let mut base = ptr;
    let mut offset = 0i64;
    while let Some(Op::PtrAdd(inner, off)) = func.def_inst(base).map(|i| &i.op) {
        match func.def_inst(*off).map(|i| &i.op) {
            Some(Op::Const(c)) => offset = offset.checked_add(*c)?,
            _ => return None,
        }
        base = *inner;
    }
    Some((base, offset))
}

/// Slots referenced by lifetime markers.
pub(crate) fn scoped_slots(func: &Function) -> HashSet<InstRef> {
    let mut scoped = HashSet::new();
    for bref in func.block_refs() {
        for &inst in func.block_insts(bref) {
            if let Op::LifetimeStart(ptr, _) | Op::LifetimeEnd(ptr, _) = func.inst(inst).op {
                if let Some(slot) = base_and_offset(func, ptr).and_then(|(base, _)| base.inst()) {
                    if matches!(func.inst(slot).op, Op::StackSlot(..)) {
                        scoped.insert(slot);
                    }
                }
            }
        }
    }
    scoped
}

/// Read-only facts the access filter consults.
struct AccessFilter<'a> {
    config: &'a SanitizerConfig,
    globals: &'a [GlobalVar],
    global_ids: HashMap<SymbolId, GlobalId>,
    globals_md: &'a GlobalsMetadata,
    scoped: HashSet<InstRef>,
}

impl AccessFilter<'_> {
    /// A constant in-bounds access to a stack slot or a global.
    fn is_safe(&self, func: &Function, ptr: ValueRef, size: u64) -> bool {
        let Some((base, offset)) = base_and_offset(func, ptr) else {
            return false;
        };
        let Ok(offset) = u64::try_from(offset) else {
            return false;
        };
        let end = offset.saturating_add(size);
        let Some(base_inst) = base.inst() else {
            return false;
        };
        match func.inst(base_inst).op {
            Op::StackSlot(slot_size, _) if self.config.opt_stack => {
                end <= slot_size as u64
                    && !(self.config.use_after_scope && self.scoped.contains(&base_inst))
            }
            Op::SymbolAddr(sym) if self.config.opt_globals => {
                let Some(&id) = self.global_ids.get(&sym) else {
                    return false;
                };
                let global = &self.globals[id.index()];
                let init_order =
                    self.config.check_init_order && self.globals_md.get(id).is_dyn_init;
                end <= global.object_size() && !init_order
            }
            _ => false,
        }
    }

    fn wants(&self, access: &MemoryAccess) -> bool {
        if access.atomic && !self.config.instrument_atomics {
            return false;
        }
        match access.access {
            AccessType::Load => self.config.instrument_reads,
            AccessType::Store => self.config.instrument_writes,
        }
    }
}

/// Per-function instrumentation pass.
#[derive(Debug, Clone)]
pub struct FunctionSanitizerPass {
    config: SanitizerConfig,
    mapping: ShadowMapping,
}

impl FunctionSanitizerPass {
    pub fn new(config: SanitizerConfig) -> Self {
        let mapping = config.shadow_mapping();
        Self { config, mapping }
    }

    pub fn config(&self) -> &SanitizerConfig {
        &self.config
    }

    fn skip_reason(&self, func: &Function, name: &str) -> Option<&'static str> {
        if func.is_declaration() {
            Some("declaration")
        } else if func.attrs.no_sanitize {
            Some("no_sanitize")
        } else if func.attrs.sanitized {
            Some("already instrumented")
        } else if runtime::is_generated_symbol(name) {
            Some("generated by the instrumentation")
        } else {
            None
        }
    }

    /// Instrument the function `id` of `module`.
    ///
    /// Only that function is rewritten. The module gains the function's
    /// frame description string and declarations of the runtime routines
    /// the new code calls.
    pub fn run(
        &self,
        module: &mut Module,
        id: FuncId,
        globals_md: &GlobalsMetadata,
    ) -> InstrumentResult<PassOutcome> {
        self.config.validate()?;
        if id.index() >= module.functions.len() {
            return Err(InstrumentError::UnknownFunction(id.0));
        }
        let name = module.resolve(module.function(id).name).to_string();
        let span = debug_span!("fasan_function", function = %name);
        let _enter = span.enter();

        if let Some(reason) = self.skip_reason(module.function(id), &name) {
            trace!(reason, "skipping function");
            return Ok(PassOutcome::unchanged());
        }

        let mut decls = RuntimeDecls::new();
        let mut stats = PassStats::default();
        let blocks_before = module.function(id).blocks.len();
        let insts_before = module.function(id).instructions.len();

        let new_global = {
            let Module {
                functions,
                symbols,
                globals,
                ..
            } = &mut *module;
            let globals: &[GlobalVar] = globals;
            let func = &mut functions[id.index()];
            let filter = AccessFilter {
                config: &self.config,
                globals,
                global_ids: globals
                    .iter()
                    .enumerate()
                    .map(|(i, g)| (g.name, GlobalId(i as u32)))
                    .collect(),
                globals_md,
                scoped: scoped_slots(func),
            };

            let sites = self.collect_sites(func, &filter, &name, &mut stats)?;
            let slots = if self.config.instrument_stack {
                stack::collect_stack_slots(func, &self.config)
            } else {
                Vec::new()
            };

            let mut emitter = CheckEmitter {
                config: &self.config,
                mapping: &self.mapping,
                symbols: &mut *symbols,
                decls: &mut decls,
            };
            let check_count = sites
                .iter()
                .filter(|s| matches!(s.kind, SiteKind::Check(_)))
                .count();
            let outlined = check_count > self.config.calls_threshold;
            if outlined {
                debug!(check_count, "using outlined checks");
            }
            for site in sites.iter().rev() {
                match site.kind {
                    SiteKind::Check(access) => {
                        emitter.instrument_access(func, site, &access, outlined);
                        stats.instrumented_accesses += 1;
                    }
                    SiteKind::Intrinsic => {
                        emitter.replace_intrinsic(func, site);
                        stats.replaced_intrinsics += 1;
                    }
                }
            }

            if slots.is_empty() {
                None
            } else {
                stats.stack_variables = slots.len();
                let mut poisoner = stack::FramePoisoner {
                    config: &self.config,
                    mapping: &self.mapping,
                    symbols: &mut *symbols,
                    decls: &mut decls,
                };
                Some(poisoner.instrument(func, &name, &slots)?)
            }
        };

        if let Some(global) = new_global {
            module.add_global(global);
        }
        decls.declare_all(module);

        let func = module.function_mut(id);
        func.attrs.sanitized = true;
        let changed = func.instructions.len() != insts_before;
        let preserved = if !changed {
            PreservedAnalyses::all()
        } else if func.blocks.len() != blocks_before {
            PreservedAnalyses::none().preserve(AnalysisKind::GlobalsMetadata)
        } else {
            PreservedAnalyses::none()
                .preserve(AnalysisKind::Cfg)
                .preserve(AnalysisKind::DominatorTree)
                .preserve(AnalysisKind::GlobalsMetadata)
        };
        debug!(
            checks = stats.instrumented_accesses,
            skipped = stats.skipped_accesses,
            stack_variables = stats.stack_variables,
            "instrumented function"
        );
        Ok(PassOutcome {
            changed,
            preserved,
            stats,
            diagnostics: Vec::new(),
        })
    }

    fn collect_sites(
        &self,
        func: &Function,
        filter: &AccessFilter<'_>,
        name: &str,
        stats: &mut PassStats,
    ) -> InstrumentResult<Vec<Site>> {
        let mut sites = Vec::new();
        for block in func.block_refs() {
            // Pointers already checked in this block since the last call or
            // lifetime marker.
            let mut checked: HashSet<(ValueRef, u32)> = HashSet::new();
            for (pos, &inst) in func.block_insts(block).iter().enumerate() {
                let instruction = func.inst(inst);
                match instruction.op {
                    Op::Call(..) | Op::LifetimeStart(..) | Op::LifetimeEnd(..) => {
                        checked.clear();
                        continue;
                    }
                    Op::MemCopy(..) | Op::MemMove(..) | Op::MemSet(..) => {
                        checked.clear();
                        if self.config.instrument_mem_intrinsics && !instruction.no_sanitize {
                            sites.push(Site {
                                inst,
                                block,
                                pos,
                                kind: SiteKind::Intrinsic,
                            });
                        }
                        continue;
                    }
                    _ => {}
                }
                let Some(access) = memory_access(&instruction.op) else {
                    continue;
                };
                if instruction.no_sanitize || !filter.wants(&access) {
                    stats.skipped_accesses += 1;
                    continue;
                }
                if access.size == 0 {
                    return Err(InstrumentError::InvalidInput {
                        function: name.to_string(),
                        message: format!("memory access v{} has no size", inst.index()),
                    });
                }
                if !matches!(func.value_type(access.ptr), Some(Type::Ptr(0))) {
                    trace!(inst = inst.index(), "access outside the default address space");
                    stats.skipped_accesses += 1;
                    continue;
                }
                if filter.is_safe(func, access.ptr, access.size as u64) {
                    trace!(inst = inst.index(), "access proven in bounds");
                    stats.skipped_accesses += 1;
                    continue;
                }
                if self.config.opt_same_temp && !checked.insert((access.ptr, access.size)) {
                    trace!(inst = inst.index(), "pointer already checked in this block");
                    stats.skipped_accesses += 1;
                    continue;
                }
                sites.push(Site {
                    inst,
                    block,
                    pos,
                    kind: SiteKind::Check(access),
                });
            }
        }
        Ok(sites)
    }
}

/// Emits the checking code for one access at a time.
struct CheckEmitter<'a> {
    config: &'a SanitizerConfig,
    mapping: &'a ShadowMapping,
    symbols: &'a mut SymbolTable,
    decls: &'a mut RuntimeDecls,
}

impl CheckEmitter<'_> {
    fn instrument_access(
        &mut self,
        func: &mut Function,
        site: &Site,
        access: &MemoryAccess,
        outlined: bool,
    ) {
        debug_assert_eq!(func.block_insts(site.block).get(site.pos), Some(&site.inst));
        let origin = func.inst(site.inst).origin.clone();
        let size = access.size as u64;
        let recover = self.config.recover;
        let fixed = runtime::is_fixed_access_size(size);

        let params = if fixed {
            vec![Type::Int]
        } else {
            vec![Type::Int, Type::Int]
        };

        if outlined {
            let callee = runtime::check_fn(access.access, size, recover);
            let callee = self.decls.use_fn(self.symbols, &callee, params, None);
            let mut b = Builder::new(func);
            b.set_no_sanitize(true);
            b.position_at(site.block, site.pos);
            let addr = b.ptr_to_addr(access.ptr, origin.clone());
            let mut args = vec![addr];
            if !fixed {
                args.push(b.iconst(size as i64, origin.clone()));
            }
            b.call_symbol(callee, args, Type::Unit, origin);
            return;
        }

        let report = runtime::report_fn(access.access, size, recover);
        let report = self.decls.use_fn(self.symbols, &report, params, None);
        let mut b = Builder::new(func);
        b.set_no_sanitize(true);
        b.position_at(site.block, site.pos);
        let addr = b.ptr_to_addr(access.ptr, origin.clone());
        if fixed {
            let pos = b.insertion_point().map_or(site.pos, |(_, at)| at);
            self.emit_check(func, site.block, pos, addr, size, report, vec![addr], &origin);
        } else {
            // Check the first and the last byte; both report the whole range.
            let last_off = b.iconst(size as i64 - 1, origin.clone());
            let last = b.add(addr, last_off, origin.clone());
            let len = b.iconst(size as i64, origin.clone());
            let pos = b.insertion_point().map_or(site.pos, |(_, at)| at);
            let args = vec![addr, len];
            let (cont, at) =
                self.emit_check(func, site.block, pos, addr, 1, report, args.clone(), &origin);
            self.emit_check(func, cont, at, last, 1, report, args, &origin);
        }
    }

    /// Insert a shadow check of `size` bytes at integer address `addr`
    /// before position `pos` of `block`. Returns where the guarded
    /// instruction ends up.
    #[allow(clippy::too_many_arguments)]
    fn emit_check(
        &mut self,
        func: &mut Function,
        block: BlockRef,
        pos: usize,
        addr: ValueRef,
        size: u64,
        report: SymbolId,
        report_args: Vec<ValueRef>,
        origin: &Origin,
    ) -> (BlockRef, usize) {
        let mut b = Builder::new(func);
        b.set_no_sanitize(true);
        b.position_at(block, pos);
        let shadow_addr = emit_shadow_addr(&mut b, self.mapping, addr, origin);
        let shadow_ptr = b.int_to_ptr(shadow_addr, origin.clone());
        let width = self.mapping.shadow_load_width(size) as u32;
        let shadow = b.load(shadow_ptr, width, Type::Int, origin.clone());
        let zero = b.iconst(0, origin.clone());
        let poisoned = b.icmp(ICmpOp::Ne, shadow, zero, origin.clone());
        let split_at = b.insertion_point().map_or(pos, |(_, at)| at);

        let cont = func.split_block(block, split_at);
        let mut b = Builder::new(func);
        b.set_no_sanitize(true);
        let report_block = b.create_block();
        if self.mapping.needs_slow_path(size) {
            let slow = b.create_block();
            b.switch_to_block(block);
            b.brif(poisoned, slow, vec![], cont, vec![], origin.clone());

            b.switch_to_block(slow);
            let mask = b.iconst(self.mapping.granularity() as i64 - 1, origin.clone());
            let mut last = b.and(addr, mask, origin.clone());
            if size > 1 {
                let extra = b.iconst(size as i64 - 1, origin.clone());
                last = b.add(last, extra, origin.clone());
            }
            let shadow_value = b.sext(shadow, 8, origin.clone());
            let bad = b.icmp(ICmpOp::Ge, last, shadow_value, origin.clone());
            b.brif(bad, report_block, vec![], cont, vec![], origin.clone());
        } else {
            b.switch_to_block(block);
            b.brif(poisoned, report_block, vec![], cont, vec![], origin.clone());
        }

        b.switch_to_block(report_block);
        b.call_symbol(report, report_args, Type::Unit, origin.clone());
        if self.config.recover {
            b.br(cont, vec![], origin.clone());
        } else {
            b.unreachable(origin.clone());
        }
        (cont, 0)
    }

    /// Turn a memory intrinsic into a call of its checking runtime twin.
    fn replace_intrinsic(&mut self, func: &mut Function, site: &Site) {
        let (name, args, params) = match func.inst(site.inst).op {
            Op::MemCopy(dst, src, len) => (
                runtime::MEMCPY,
                vec![dst, src, len],
                vec![Type::PTR, Type::PTR, Type::Int],
            ),
            Op::MemMove(dst, src, len) => (
                runtime::MEMMOVE,
                vec![dst, src, len],
                vec![Type::PTR, Type::PTR, Type::Int],
            ),
            Op::MemSet(dst, byte, len) => (
                runtime::MEMSET,
                vec![dst, byte, len],
                vec![Type::PTR, Type::Int, Type::Int],
            ),
            _ => return,
        };
        let callee = self.decls.use_fn(self.symbols, name, params, Some(Type::PTR));
        let origin = func.inst(site.inst).origin.clone();
        let mut b = Builder::new(func);
        b.set_no_sanitize(true);
        b.position_at(site.block, site.pos);
        let callee = b.symbol_addr(callee, origin);
        func.inst_mut(site.inst).op = Op::Call(callee, args);
    }
}
