//! Stack frame instrumentation.
//!
//! All interesting stack slots of a function are merged into one frame:
//!
//! ```text
//! frame+0   header: FRAME_MAGIC, description string, function address
//! frame+32  var0 | redzone | var1 | redzone | ... | right redzone
//! ```
//!
//! The prologue writes the header and poisons the redzones. Before every
//! exit (`ret`, `unwind`) the header magic is retired and the frame's
//! shadow is cleared. With use-after-scope, variables with lifetime markers
//! start poisoned, `lifetime.start` unpoisons them and `lifetime.end`
//! poisons them again.

use fasan_ir::builder::Builder;
use fasan_ir::function::Function;
use fasan_ir::global::{GlobalVar, Initializer, Linkage};
use fasan_ir::instruction::{Op, Origin};
use fasan_ir::module::SymbolTable;
use fasan_ir::types::Type;
use fasan_ir::value::{InstRef, ValueRef};
use tracing::{debug, trace};

use crate::config::SanitizerConfig;
use crate::error::{InstrumentError, InstrumentResult};
use crate::function_pass::{base_and_offset, emit_shadow_addr, scoped_slots};
use crate::layout::{
    compute_frame_layout, frame_description, frame_shadow_bytes, frame_shadow_bytes_after_scope,
    StackVariable,
};
use crate::runtime::{self, RuntimeDecls};
use crate::shadow::{ShadowMapping, FRAME_MAGIC, RETIRED_FRAME_MAGIC};

/// A stack slot selected for the redzoned frame.
#[derive(Debug, Clone)]
pub(crate) struct StackSlotInfo {
    pub inst: InstRef,
    pub size: u64,
    pub align: u64,
    pub name: String,
    /// The slot has lifetime markers and use-after-scope is on.
    pub scoped: bool,
}

/// A slot whose every use loads or stores it whole can live in a register
/// and never needs redzones.
fn is_promotable(func: &Function, slot: InstRef, size: u32) -> bool {
    let slot_val = slot.value();
    let mut operands = Vec::new();
    for bref in func.block_refs() {
        for &inst in func.block_insts(bref) {
            let op = &func.inst(inst).op;
            operands.clear();
            op.operands(&mut operands);
            if !operands.contains(&slot_val) {
                continue;
            }
            let whole_access = match *op {
                Op::Load(ptr, bytes) => ptr == slot_val && bytes == size,
                Op::Store(val, ptr, bytes) => {
                    ptr == slot_val && val != slot_val && bytes == size
                }
                Op::LifetimeStart(..) | Op::LifetimeEnd(..) => true,
                _ => false,
            };
            if !whole_access {
                return false;
            }
        }
    }
    true
}

/// Static, non-empty, non-promotable slots of the entry block.
pub(crate) fn collect_stack_slots(func: &Function, config: &SanitizerConfig) -> Vec<StackSlotInfo> {
    let scoped = if config.use_after_scope {
        scoped_slots(func)
    } else {
        Default::default()
    };
    let mut slots = Vec::new();
    for &inst in func.block_insts(func.entry_block()) {
        let instruction = func.inst(inst);
        let Op::StackSlot(size, align) = instruction.op else {
            continue;
        };
        if size == 0 || instruction.no_sanitize {
            continue;
        }
        if config.skip_promotable_slots && is_promotable(func, inst, size) {
            trace!(slot = inst.index(), "promotable slot left alone");
            continue;
        }
        let name = func
            .slot_names
            .get(&inst)
            .cloned()
            .unwrap_or_else(|| format!("v{}", inst.index()));
        slots.push(StackSlotInfo {
            inst,
            size: size as u64,
            align: align as u64,
            name,
            scoped: scoped.contains(&inst),
        });
    }
    slots
}

/// A `lifetime.start` or `lifetime.end` of a frame variable.
#[derive(Debug, Clone, Copy)]
struct LifetimeMarker {
    inst: InstRef,
    /// Index into the selected slots.
    slot: usize,
    /// Byte offset of the marked range within the slot.
    offset: u64,
    size: u64,
    poison: bool,
}

fn lifetime_markers(func: &Function, slots: &[StackSlotInfo]) -> Vec<LifetimeMarker> {
    let mut markers = Vec::new();
    for bref in func.block_refs() {
        for &inst in func.block_insts(bref) {
            let (ptr, size, poison) = match func.inst(inst).op {
                Op::LifetimeStart(ptr, size) => (ptr, size, false),
                Op::LifetimeEnd(ptr, size) => (ptr, size, true),
                _ => continue,
            };
            let Some((base, offset)) = base_and_offset(func, ptr) else {
                continue;
            };
            let (Some(base), Ok(offset)) = (base.inst(), u64::try_from(offset)) else {
                continue;
            };
            if let Some(slot) = slots.iter().position(|s| s.inst == base) {
                markers.push(LifetimeMarker {
                    inst,
                    slot,
                    offset,
                    size,
                    poison,
                });
            }
        }
    }
    markers
}

/// Writes frames, shadow bytes and lifetime poisoning into one function.
pub(crate) struct FramePoisoner<'a> {
    pub config: &'a SanitizerConfig,
    pub mapping: &'a ShadowMapping,
    pub symbols: &'a mut SymbolTable,
    pub decls: &'a mut RuntimeDecls,
}

impl FramePoisoner<'_> {
    /// Replace `slots` by one redzoned frame. Returns the frame description
    /// global the caller must add to the module.
    pub fn instrument(
        &mut self,
        func: &mut Function,
        func_name: &str,
        slots: &[StackSlotInfo],
    ) -> InstrumentResult<GlobalVar> {
        let mut vars: Vec<StackVariable> = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let mut var = StackVariable::new(i, slot.name.clone(), slot.size, slot.align);
                if slot.scoped {
                    var.lifetime_size = slot.size;
                }
                var
            })
            .collect();
        let layout = compute_frame_layout(&mut vars, self.mapping.granularity());
        let frame_size = u32::try_from(layout.frame_size).map_err(|_| InstrumentError::InvalidInput {
            function: func_name.to_string(),
            message: format!("stack frame of {} bytes is too large", layout.frame_size),
        })?;
        let in_scope = frame_shadow_bytes(&vars, &layout);
        let at_entry = frame_shadow_bytes_after_scope(&vars, &layout);
        let description = frame_description(&vars);
        debug!(
            frame_size = layout.frame_size,
            vars = vars.len(),
            %description,
            "laid out stack frame"
        );

        let markers = if self.config.use_after_scope {
            lifetime_markers(func, slots)
        } else {
            Vec::new()
        };

        let desc_global = self.description_global(func_name, &description);
        let origin = Origin::synthetic();

        // Prologue, right after the parameters.
        let entry = func.entry_block();
        let func_sym = func.name;
        let prologue_at = func.param_prologue_len();
        let mut b = Builder::new(func);
        b.set_no_sanitize(true);
        b.position_at(entry, prologue_at);
        let frame = b.stack_slot(frame_size, layout.frame_alignment as u32, origin.clone());
        let magic = b.iconst(FRAME_MAGIC as i64, origin.clone());
        b.store(magic, frame, 8, origin.clone());
        let desc = b.symbol_addr(desc_global.name, origin.clone());
        let eight = b.iconst(8, origin.clone());
        let desc_slot = b.ptr_add(frame, eight, origin.clone());
        b.store(desc, desc_slot, 8, origin.clone());
        let func_addr = b.symbol_addr(func_sym, origin.clone());
        let sixteen = b.iconst(16, origin.clone());
        let func_slot = b.ptr_add(frame, sixteen, origin.clone());
        b.store(func_addr, func_slot, 8, origin.clone());
        let frame_addr = b.ptr_to_addr(frame, origin.clone());
        let shadow_base = emit_shadow_addr(&mut b, self.mapping, frame_addr, &origin);
        self.copy_to_shadow(&mut b, shadow_base, &at_entry, &at_entry, 0, at_entry.len(), &origin);

        // Every slot becomes an offset into the frame.
        for var in &vars {
            let slot = slots[var.index].inst;
            let Some((block, pos)) = func.locate(slot) else {
                continue;
            };
            let mut b = Builder::new(func);
            b.position_at(block, pos);
            let offset = b.iconst(var.offset as i64, origin.clone());
            func.inst_mut(slot).op = Op::PtrAdd(frame, offset);
        }

        for marker in markers {
            let Some(var) = vars.iter().find(|v| v.index == marker.slot) else {
                continue;
            };
            let Some((block, pos)) = func.locate(marker.inst) else {
                continue;
            };
            if marker.offset >= var.size {
                continue;
            }
            let g = layout.granularity;
            let size = marker.size.min(var.size - marker.offset);
            let start = var.offset + marker.offset;
            let begin = (start / g) as usize;
            let end = (start + size).div_ceil(g) as usize;
            let origin = func.inst(marker.inst).origin.clone();
            let bytes = if marker.poison { &at_entry } else { &in_scope };
            let mut b = Builder::new(func);
            b.set_no_sanitize(true);
            b.position_at(block, pos);
            self.copy_to_shadow(&mut b, shadow_base, &at_entry, bytes, begin, end, &origin);
        }

        // Tear the frame down before every exit.
        let clean = vec![0u8; at_entry.len()];
        let exits: Vec<_> = func
            .block_refs()
            .filter_map(|bref| {
                let term = func.terminator(bref)?;
                func.inst(term)
                    .op
                    .is_function_exit()
                    .then(|| (bref, func.block_insts(bref).len() - 1))
            })
            .collect();
        for (block, pos) in exits {
            let mut b = Builder::new(func);
            b.set_no_sanitize(true);
            b.position_at(block, pos);
            let retired = b.iconst(RETIRED_FRAME_MAGIC as i64, origin.clone());
            b.store(retired, frame, 8, origin.clone());
            self.copy_to_shadow(&mut b, shadow_base, &at_entry, &clean, 0, clean.len(), &origin);
        }

        Ok(desc_global)
    }

    fn description_global(&mut self, func_name: &str, description: &str) -> GlobalVar {
        let name = self
            .symbols
            .intern(&format!("{}{func_name}", runtime::STACK_DESCRIPTION_PREFIX));
        let mut bytes = description.as_bytes().to_vec();
        bytes.push(0);
        let mut global = GlobalVar::new(name, bytes.len() as u64, 1);
        global.linkage = Linkage::Private;
        global.constant = true;
        global.init = Some(Initializer::Bytes(bytes));
        global
    }

    /// Write `bytes[begin..end]` to the shadow at `shadow_base`, skipping
    /// positions where `mask` is zero. Long runs of one value go through
    /// `__asan_set_shadow_XX`.
    #[allow(clippy::too_many_arguments)]
    fn copy_to_shadow(
        &mut self,
        b: &mut Builder<'_>,
        shadow_base: ValueRef,
        mask: &[u8],
        bytes: &[u8],
        begin: usize,
        end: usize,
        origin: &Origin,
    ) {
        debug_assert_eq!(mask.len(), bytes.len());
        let mut done = begin;
        let mut i = begin;
        while i < end {
            if mask[i] == 0 {
                i += 1;
                continue;
            }
            let value = bytes[i];
            let mut j = i + 1;
            while j < end && mask[j] != 0 && bytes[j] == value {
                j += 1;
            }
            if j - i >= self.config.max_inline_poisoning_size {
                if let Some(name) = runtime::set_shadow_fn(value) {
                    self.copy_to_shadow_inline(b, shadow_base, mask, bytes, done, i, origin);
                    let callee = self.decls.use_fn(
                        self.symbols,
                        &name,
                        vec![Type::Int, Type::Int],
                        None,
                    );
                    let offset = b.iconst(i as i64, origin.clone());
                    let addr = b.add(shadow_base, offset, origin.clone());
                    let len = b.iconst((j - i) as i64, origin.clone());
                    b.call_symbol(callee, vec![addr, len], Type::Unit, origin.clone());
                    done = j;
                }
            }
            i = j;
        }
        self.copy_to_shadow_inline(b, shadow_base, mask, bytes, done, end, origin);
    }

    /// Store shadow bytes with the widest little-endian stores that fit,
    /// trimming trailing bytes the mask does not cover.
    #[allow(clippy::too_many_arguments)]
    fn copy_to_shadow_inline(
        &mut self,
        b: &mut Builder<'_>,
        shadow_base: ValueRef,
        mask: &[u8],
        bytes: &[u8],
        begin: usize,
        end: usize,
        origin: &Origin,
    ) {
        let mut i = begin;
        while i < end {
            if mask[i] == 0 {
                i += 1;
                continue;
            }
            let mut width = 8;
            while width > end - i {
                width /= 2;
            }
            let mut j = width - 1;
            while j > 0 && mask[i + j] == 0 {
                while j <= width / 2 {
                    width /= 2;
                }
                j -= 1;
            }
            let value = bytes[i..i + width]
                .iter()
                .rev()
                .fold(0u64, |acc, &byte| (acc << 8) | byte as u64);
            let offset = b.iconst(i as i64, origin.clone());
            let addr = b.add(shadow_base, offset, origin.clone());
            let ptr = b.int_to_ptr(addr, origin.clone());
            let value = b.iconst(value as i64, origin.clone());
            b.store(value, ptr, width as u32, origin.clone());
            i += width;
        }
    }
}
