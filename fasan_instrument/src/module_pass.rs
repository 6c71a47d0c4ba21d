//! Module instrumentation: redzoned globals and their registration.
//!
//! Every eligible global grows a trailing redzone and gets a 64-byte
//! descriptor:
//!
//! ```text
//! +0  beg               address of the global
//! +8  size              bytes of the source-level object
//! +16 size_with_redzone
//! +24 name              C string
//! +32 module_name       C string
//! +40 has_dynamic_init
//! +48 source_location   [filename, line: u32, column: u32] record or 0
//! +56 odr_indicator     address or 0
//! ```
//!
//! The descriptors are handed to the runtime from `asan.module_ctor`,
//! either as one flat table or through linker-collected sections.

use fasan_ir::builder::Builder;
use fasan_ir::function::Function;
use fasan_ir::global::{ConstField, GlobalId, GlobalVar, Initializer, Linkage, Visibility};
use fasan_ir::instruction::{Op, Origin};
use fasan_ir::module::{CtorEntry, Module, SymbolId};
use fasan_ir::types::Type;
use fasan_ir::value::ValueRef;
use tracing::{debug, info_span, trace, warn};

use crate::analysis::{AnalysisKind, PassOutcome, PassStats, PreservedAnalyses};
use crate::config::{ObjectFormat, SanitizerConfig};
use crate::error::{Diagnostic, InstrumentResult};
use crate::layout::{global_redzone_size, min_global_redzone};
use crate::metadata::{GlobalEntry, GlobalsMetadata, SourceLocation};
use crate::runtime::{self, RuntimeDecls};
use crate::shadow::ShadowMapping;

/// Section prefixes whose contents the loader or the runtime interprets
/// directly.
const SPECIAL_SECTIONS: [&str; 7] = [
    ".init_array",
    ".fini_array",
    ".ctors",
    ".dtors",
    "__DATA,__mod_init_func",
    ".CRT",
    runtime::ELF_GLOBALS_SECTION,
];

/// How descriptors reach the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationScheme {
    /// One table passed to `__asan_register_globals`.
    Flat,
    /// Descriptors in `asan_globals`, found through the linker's
    /// start/stop symbols.
    Elf,
    /// Descriptors in `__DATA,__asan_globals` with liveness binders.
    MachO,
}

impl RegistrationScheme {
    pub fn for_config(config: &SanitizerConfig) -> Self {
        if !config.use_global_gc {
            return RegistrationScheme::Flat;
        }
        match config.target.format {
            ObjectFormat::Elf if !config.compile_kernel => RegistrationScheme::Elf,
            ObjectFormat::MachO => RegistrationScheme::MachO,
            _ => RegistrationScheme::Flat,
        }
    }
}

/// A global that received a redzone.
#[derive(Debug, Clone)]
struct InstrumentedGlobal {
    symbol: SymbolId,
    descriptor: Vec<ConstField>,
    dyn_init: bool,
}

/// Module-wide instrumentation pass.
#[derive(Debug, Clone)]
pub struct ModuleSanitizerPass {
    config: SanitizerConfig,
    mapping: ShadowMapping,
}

impl ModuleSanitizerPass {
    pub fn new(config: SanitizerConfig) -> Self {
        let mapping = config.shadow_mapping();
        Self { config, mapping }
    }

    pub fn config(&self) -> &SanitizerConfig {
        &self.config
    }

    /// Instrument the globals of `module` and emit the module constructor
    /// and destructor.
    pub fn run(
        &self,
        module: &mut Module,
        globals_md: &GlobalsMetadata,
    ) -> InstrumentResult<PassOutcome> {
        let span = info_span!("fasan_module", module = %module.name);
        let _enter = span.enter();
        self.config.validate()?;

        if module.function_by_name(runtime::MODULE_CTOR).is_some() {
            debug!("module already instrumented");
            return Ok(PassOutcome::unchanged());
        }

        let mut stats = PassStats::default();
        let mut diagnostics = Vec::new();
        let mut candidates: Vec<GlobalId> = Vec::new();
        if self.config.instrument_globals {
            for id in module.global_ids() {
                let entry = globals_md.get(id);
                let Some(reason) = self.skip_reason(module, id, entry) else {
                    candidates.push(id);
                    continue;
                };
                let g = module.global(id);
                let name = module.resolve(g.name);
                trace!(global = name, reason, "skipping global");
                stats.skipped_globals += 1;
                if g.fixed_address && entry.is_dyn_init {
                    let diag = Diagnostic {
                        symbol: name.to_string(),
                        location: entry.source_loc.clone(),
                        message: "dynamic initialization of a fixed-address global is not checked"
                            .to_string(),
                    };
                    warn!("{diag}");
                    diagnostics.push(diag);
                }
            }
        }

        if candidates.is_empty() && self.config.compile_kernel {
            debug!("no globals to instrument");
            return Ok(PassOutcome {
                diagnostics,
                stats,
                ..PassOutcome::unchanged()
            });
        }

        let mut emitter = GlobalEmitter::new(module);
        let instrumented: Vec<InstrumentedGlobal> = candidates
            .iter()
            .map(|&id| self.instrument_global(&mut emitter, id, globals_md.get(id)))
            .collect();
        stats.instrumented_globals = instrumented.len();

        let mut decls = RuntimeDecls::new();
        let scheme = RegistrationScheme::for_config(&self.config);
        let registration = if instrumented.is_empty() {
            None
        } else {
            Some(self.emit_registration(&mut emitter, scheme, &instrumented))
        };

        let ctor = emitter.module.intern(runtime::MODULE_CTOR);
        let mut ctor_fn = Function::new(ctor, vec![], None);
        {
            let mut b = Builder::new(&mut ctor_fn);
            let entry = b.create_block();
            b.switch_to_block(entry);
            let origin = Origin::synthetic();
            if !self.config.compile_kernel {
                for name in [runtime::INIT, runtime::VERSION_MISMATCH_CHECK] {
                    let callee = decls.use_fn(&mut emitter.module.symbols, name, vec![], None);
                    b.call_symbol(callee, vec![], Type::Unit, origin.clone());
                }
            }
            if let Some(reg) = &registration {
                let callee =
                    decls.use_fn(&mut emitter.module.symbols, reg.register, reg.params.clone(), None);
                let args = reg.args(&mut b, &origin);
                b.call_symbol(callee, args, Type::Unit, origin.clone());
            }
            b.ret(None, origin);
        }
        let init_order = self.config.check_init_order
            && !self.config.compile_kernel
            && instrumented.iter().any(|g| g.dyn_init);
        if init_order {
            stats.wrapped_initializers = self.wrap_initializers(&mut emitter, &mut decls);
        }

        add_internal_function(emitter.module, ctor_fn);
        emitter.module.global_ctors.push(CtorEntry {
            priority: runtime::CTOR_PRIORITY,
            function: ctor,
        });

        if let Some(reg) = &registration {
            let dtor = emitter.module.intern(runtime::MODULE_DTOR);
            let mut dtor_fn = Function::new(dtor, vec![], None);
            let callee = decls.use_fn(
                &mut emitter.module.symbols,
                reg.unregister,
                reg.params.clone(),
                None,
            );
            let mut b = Builder::new(&mut dtor_fn);
            let entry = b.create_block();
            b.switch_to_block(entry);
            let origin = Origin::synthetic();
            let args = reg.args(&mut b, &origin);
            b.call_symbol(callee, args, Type::Unit, origin.clone());
            b.ret(None, origin);
            add_internal_function(emitter.module, dtor_fn);
            emitter.module.global_dtors.push(CtorEntry {
                priority: runtime::CTOR_PRIORITY,
                function: dtor,
            });
        }
        decls.declare_all(module);

        debug!(
            instrumented = stats.instrumented_globals,
            skipped = stats.skipped_globals,
            ?scheme,
            "instrumented module"
        );
        Ok(PassOutcome {
            changed: true,
            preserved: PreservedAnalyses::none().preserve(AnalysisKind::GlobalsMetadata),
            stats,
            diagnostics,
        })
    }

    fn skip_reason(&self, module: &Module, id: GlobalId, entry: &GlobalEntry) -> Option<&'static str> {
        let g = module.global(id);
        let name = module.resolve(g.name);
        let min_rz = min_global_redzone(self.mapping.granularity());
        if entry.is_excluded {
            Some("excluded")
        } else if g.is_declaration() {
            Some("declaration")
        } else if g.thread_local {
            Some("thread local")
        } else if g.fixed_address {
            Some("fixed address")
        } else if runtime::is_generated_symbol(name) {
            Some("generated by the instrumentation")
        } else if g
            .section
            .as_deref()
            .is_some_and(|s| SPECIAL_SECTIONS.iter().any(|p| s.starts_with(p)))
        {
            Some("special section")
        } else if !g.linkage.has_exact_definition() {
            Some("definition may be replaced")
        } else if g.align as u64 > min_rz {
            Some("over-aligned")
        } else if g.size == 0 {
            Some("zero size")
        } else {
            None
        }
    }

    fn instrument_global(
        &self,
        emitter: &mut GlobalEmitter<'_>,
        id: GlobalId,
        entry: &GlobalEntry,
    ) -> InstrumentedGlobal {
        let granularity = self.mapping.granularity();
        let min_rz = min_global_redzone(granularity);
        let g = emitter.module.global(id);
        let symbol = g.name;
        let size = g.object_size();
        let rz = global_redzone_size(g.size, granularity);
        let new_size = g.size + rz;
        let linkage = g.linkage;
        let visibility = g.visibility;
        let sym_name = emitter.module.resolve(symbol).to_string();
        trace!(global = %sym_name, size, redzone = rz, "adding redzone");

        let g = emitter.module.global_mut(id);
        g.init = g.init.take().map(|init| pad_initializer(init, new_size));
        g.size = new_size;
        g.padding += rz;
        g.align = g.align.max(min_rz as u32);

        let display_name = if entry.name.is_empty() {
            sym_name.clone()
        } else {
            entry.name.clone()
        };
        let name_str = emitter.string(&display_name);
        let module_name = emitter.module_name();
        let location = if entry.source_loc.is_empty() {
            ConstField::Int { value: 0, bytes: 8 }
        } else {
            ConstField::Addr(emitter.location(&entry.source_loc))
        };
        let odr = if self.config.use_odr_indicator && !linkage.is_local() {
            let indicator = emitter
                .module
                .intern(&format!("{}{sym_name}", runtime::ODR_INDICATOR_PREFIX));
            let mut var = GlobalVar::new(indicator, 1, 1);
            var.linkage = linkage;
            var.visibility = visibility;
            emitter.module.add_global(var);
            ConstField::Addr(indicator)
        } else {
            ConstField::Int { value: 0, bytes: 8 }
        };

        let word = |value: u64| ConstField::Int {
            value: value as i64,
            bytes: 8,
        };
        InstrumentedGlobal {
            symbol,
            descriptor: vec![
                ConstField::Addr(symbol),
                word(size),
                word(new_size),
                ConstField::Addr(name_str),
                ConstField::Addr(module_name),
                word(entry.is_dyn_init as u64),
                location,
                odr,
            ],
            dyn_init: entry.is_dyn_init,
        }
    }

    fn emit_registration(
        &self,
        emitter: &mut GlobalEmitter<'_>,
        scheme: RegistrationScheme,
        globals: &[InstrumentedGlobal],
    ) -> Registration {
        match scheme {
            RegistrationScheme::Flat => {
                let fields: Vec<ConstField> =
                    globals.iter().flat_map(|g| g.descriptor.clone()).collect();
                let table = emitter.private_global(
                    &format!("{}globals", runtime::GEN_PREFIX),
                    Initializer::Fields(fields),
                    8,
                );
                Registration {
                    register: runtime::REGISTER_GLOBALS,
                    unregister: runtime::UNREGISTER_GLOBALS,
                    params: vec![Type::PTR, Type::Int],
                    symbols: vec![table],
                    count: Some(globals.len() as i64),
                }
            }
            RegistrationScheme::Elf => {
                for g in globals {
                    let desc = emitter.descriptor_global(g, runtime::ELF_GLOBALS_SECTION);
                    let var = emitter.module.global_mut(desc);
                    var.associated = Some(g.symbol);
                }
                let flag = emitter.registered_flag();
                let start = emitter.section_bound(runtime::ELF_GLOBALS_START);
                let stop = emitter.section_bound(runtime::ELF_GLOBALS_STOP);
                Registration {
                    register: runtime::REGISTER_ELF_GLOBALS,
                    unregister: runtime::UNREGISTER_ELF_GLOBALS,
                    params: vec![Type::PTR, Type::PTR, Type::PTR],
                    symbols: vec![flag, start, stop],
                    count: None,
                }
            }
            RegistrationScheme::MachO => {
                for g in globals {
                    let desc = emitter.descriptor_global(g, runtime::MACHO_GLOBALS_SECTION);
                    let desc_sym = emitter.module.global(desc).name;
                    let target = emitter.module.resolve(g.symbol).to_string();
                    let binder = emitter.module.intern(&format!(
                        "{}{target}",
                        runtime::LIVENESS_BINDER_PREFIX
                    ));
                    let mut var = GlobalVar::new(binder, 16, 8);
                    var.linkage = Linkage::Private;
                    var.section = Some(runtime::MACHO_LIVENESS_SECTION.to_string());
                    var.init = Some(Initializer::Fields(vec![
                        ConstField::Addr(g.symbol),
                        ConstField::Addr(desc_sym),
                    ]));
                    emitter.module.add_global(var);
                    emitter.module.used.push(binder);
                }
                let flag = emitter.registered_flag();
                Registration {
                    register: runtime::REGISTER_IMAGE_GLOBALS,
                    unregister: runtime::UNREGISTER_IMAGE_GLOBALS,
                    params: vec![Type::PTR],
                    symbols: vec![flag],
                    count: None,
                }
            }
        }
    }

    /// Bracket every defined constructor that runs after the module
    /// constructor with the dynamic-initialization calls. Returns how many
    /// were wrapped.
    fn wrap_initializers(&self, emitter: &mut GlobalEmitter<'_>, decls: &mut RuntimeDecls) -> usize {
        let module_name = emitter.module_name();
        let module = &mut *emitter.module;
        let before = decls.use_fn(
            &mut module.symbols,
            runtime::BEFORE_DYNAMIC_INIT,
            vec![Type::PTR],
            None,
        );
        let after = decls.use_fn(&mut module.symbols, runtime::AFTER_DYNAMIC_INIT, vec![], None);
        let targets: Vec<_> = module
            .global_ctors
            .iter()
            .filter(|c| c.priority > runtime::CTOR_PRIORITY)
            .filter_map(|c| module.function_by_symbol(c.function))
            .filter(|&f| !module.function(f).is_declaration())
            .collect();
        for &id in &targets {
            let func = module.function_mut(id);
            trace!(ctor = id.0, "wrapping dynamic initializer");
            let origin = Origin::synthetic();
            let exits: Vec<_> = func
                .block_refs()
                .filter_map(|bref| {
                    let term = func.terminator(bref)?;
                    matches!(func.inst(term).op, Op::Ret(_))
                        .then(|| (bref, func.block_insts(bref).len() - 1))
                })
                .collect();
            let entry = func.entry_block();
            let prologue = func.param_prologue_len();
            let mut b = Builder::new(func);
            b.set_no_sanitize(true);
            for (block, pos) in exits {
                b.position_at(block, pos);
                b.call_symbol(after, vec![], Type::Unit, origin.clone());
            }
            b.position_at(entry, prologue);
            let name = b.symbol_addr(module_name, origin.clone());
            b.call_symbol(before, vec![name], Type::Unit, origin);
        }
        targets.len()
    }
}

/// Runtime calls registering and unregistering the descriptors.
#[derive(Debug, Clone)]
struct Registration {
    register: &'static str,
    unregister: &'static str,
    params: Vec<Type>,
    /// Symbols passed by address, in order.
    symbols: Vec<SymbolId>,
    /// Trailing descriptor count of the flat scheme.
    count: Option<i64>,
}

impl Registration {
    fn args(&self, b: &mut Builder<'_>, origin: &Origin) -> Vec<ValueRef> {
        let mut args: Vec<ValueRef> = self
            .symbols
            .iter()
            .map(|&sym| b.symbol_addr(sym, origin.clone()))
            .collect();
        if let Some(count) = self.count {
            args.push(b.iconst(count, origin.clone()));
        }
        args
    }
}

/// Creates the auxiliary globals of the pass, numbering private strings.
struct GlobalEmitter<'m> {
    module: &'m mut Module,
    next_string: usize,
    module_name: Option<SymbolId>,
}

impl<'m> GlobalEmitter<'m> {
    fn new(module: &'m mut Module) -> Self {
        Self {
            module,
            next_string: 0,
            module_name: None,
        }
    }

    fn private_global(&mut self, name: &str, init: Initializer, align: u32) -> SymbolId {
        let sym = self.module.intern(name);
        let mut var = GlobalVar::new(sym, init.len(), align);
        var.linkage = Linkage::Private;
        var.constant = true;
        var.init = Some(init);
        self.module.add_global(var);
        sym
    }

    /// A NUL-terminated private string.
    fn string(&mut self, value: &str) -> SymbolId {
        let name = format!("{}str.{}", runtime::GEN_PREFIX, self.next_string);
        self.next_string += 1;
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.private_global(&name, Initializer::Bytes(bytes), 1)
    }

    fn module_name(&mut self) -> SymbolId {
        if let Some(sym) = self.module_name {
            return sym;
        }
        let mut bytes = self.module.name.as_bytes().to_vec();
        bytes.push(0);
        let sym = self.private_global(
            &format!("{}module_name", runtime::GEN_PREFIX),
            Initializer::Bytes(bytes),
            1,
        );
        self.module_name = Some(sym);
        sym
    }

    fn location(&mut self, loc: &SourceLocation) -> SymbolId {
        let index = self.next_string;
        let filename = self.string(&loc.filename);
        self.private_global(
            &format!("{}loc.{index}", runtime::GEN_PREFIX),
            Initializer::Fields(vec![
                ConstField::Addr(filename),
                ConstField::Int {
                    value: loc.line as i64,
                    bytes: 4,
                },
                ConstField::Int {
                    value: loc.column as i64,
                    bytes: 4,
                },
            ]),
            8,
        )
    }

    /// One descriptor in its own global, kept alive by the linker only
    /// while the described global is.
    fn descriptor_global(&mut self, global: &InstrumentedGlobal, section: &str) -> GlobalId {
        let target = self.module.resolve(global.symbol).to_string();
        let sym = self
            .module
            .intern(&format!("{}{target}", runtime::GLOBAL_DESCRIPTOR_PREFIX));
        let mut var = GlobalVar::new(sym, runtime::GLOBAL_DESCRIPTOR_SIZE, 8);
        var.linkage = Linkage::Private;
        var.section = Some(section.to_string());
        var.init = Some(Initializer::Fields(global.descriptor.clone()));
        self.module.used.push(sym);
        self.module.add_global(var)
    }

    fn registered_flag(&mut self) -> SymbolId {
        let sym = self.module.intern(runtime::GLOBALS_REGISTERED_FLAG);
        if self.module.global_by_symbol(sym).is_none() {
            let mut var = GlobalVar::new(sym, 8, 8);
            var.linkage = Linkage::Common;
            var.visibility = Visibility::Hidden;
            self.module.add_global(var);
        }
        sym
    }

    /// Linker-provided start or stop symbol of the descriptor section.
    fn section_bound(&mut self, name: &str) -> SymbolId {
        let sym = self.module.intern(name);
        if self.module.global_by_symbol(sym).is_none() {
            let mut var = GlobalVar::declaration(sym, 0, 8);
            var.linkage = Linkage::ExternWeak;
            var.visibility = Visibility::Hidden;
            self.module.add_global(var);
        }
        sym
    }
}

/// Extend `init` with zeroes up to `new_size` bytes.
fn pad_initializer(init: Initializer, new_size: u64) -> Initializer {
    let tail = new_size - init.len();
    match init {
        Initializer::Zero => Initializer::Zero,
        Initializer::Bytes(bytes) => {
            Initializer::Fields(vec![ConstField::Bytes(bytes), ConstField::Zero(tail)])
        }
        Initializer::Fields(mut fields) => {
            fields.push(ConstField::Zero(tail));
            Initializer::Fields(fields)
        }
    }
}

fn add_internal_function(module: &mut Module, mut func: Function) {
    func.attrs.linkage = Linkage::Internal;
    func.attrs.no_sanitize = true;
    func.attrs.sanitized = true;
    module.add_function(func);
}
