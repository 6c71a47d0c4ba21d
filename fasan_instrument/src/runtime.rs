//! Names and signatures of the runtime entry points the instrumented code
//! calls, and of the symbols the passes generate.

use std::collections::BTreeMap;

use fasan_ir::module::{Module, SymbolId, SymbolTable};
use fasan_ir::types::Type;

pub const INIT: &str = "__asan_init";
pub const VERSION_MISMATCH_CHECK: &str = "__asan_version_mismatch_check_v8";
pub const REGISTER_GLOBALS: &str = "__asan_register_globals";
pub const UNREGISTER_GLOBALS: &str = "__asan_unregister_globals";
pub const REGISTER_ELF_GLOBALS: &str = "__asan_register_elf_globals";
pub const UNREGISTER_ELF_GLOBALS: &str = "__asan_unregister_elf_globals";
pub const REGISTER_IMAGE_GLOBALS: &str = "__asan_register_image_globals";
pub const UNREGISTER_IMAGE_GLOBALS: &str = "__asan_unregister_image_globals";
pub const BEFORE_DYNAMIC_INIT: &str = "__asan_before_dynamic_init";
pub const AFTER_DYNAMIC_INIT: &str = "__asan_after_dynamic_init";
pub const MEMCPY: &str = "__asan_memcpy";
pub const MEMMOVE: &str = "__asan_memmove";
pub const MEMSET: &str = "__asan_memset";

pub const MODULE_CTOR: &str = "asan.module_ctor";
pub const MODULE_DTOR: &str = "asan.module_dtor";
/// Priority of the module constructor and destructor.
pub const CTOR_PRIORITY: u32 = 1;

/// Prefix of every runtime entry point and most generated symbols.
pub const RUNTIME_PREFIX: &str = "__asan_";
/// Prefix of private strings and tables emitted by the module pass.
pub const GEN_PREFIX: &str = "__asan_gen_.";
pub const ODR_INDICATOR_PREFIX: &str = "__odr_asan_gen_";
/// Per-global descriptor in the collectible registration schemes.
pub const GLOBAL_DESCRIPTOR_PREFIX: &str = "__asan_global_";
pub const LIVENESS_BINDER_PREFIX: &str = "__asan_binder_";
pub const STACK_DESCRIPTION_PREFIX: &str = "__asan_stack_desc.";
pub const GLOBALS_REGISTERED_FLAG: &str = "__asan_globals_registered";

pub const ELF_GLOBALS_SECTION: &str = "asan_globals";
pub const ELF_GLOBALS_START: &str = "__start_asan_globals";
pub const ELF_GLOBALS_STOP: &str = "__stop_asan_globals";
pub const MACHO_GLOBALS_SECTION: &str = "__DATA,__asan_globals";
pub const MACHO_LIVENESS_SECTION: &str = "__DATA,__asan_liveness";

/// Size in bytes of one global descriptor (eight pointer-sized fields).
pub const GLOBAL_DESCRIPTOR_SIZE: u64 = 64;

/// Shadow byte values with a dedicated `__asan_set_shadow_XX` routine.
pub const SET_SHADOW_VALUES: [u8; 6] = [0x00, 0xf1, 0xf2, 0xf3, 0xf5, 0xf8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Load,
    Store,
}

impl AccessType {
    fn as_str(self) -> &'static str {
        match self {
            AccessType::Load => "load",
            AccessType::Store => "store",
        }
    }
}

/// Sizes with a dedicated report and check routine.
pub fn is_fixed_access_size(size: u64) -> bool {
    matches!(size, 1 | 2 | 4 | 8 | 16)
}

fn noabort(recover: bool) -> &'static str {
    if recover {
        "_noabort"
    } else {
        ""
    }
}

/// `__asan_report_{load,store}{1,2,4,8,16,_n}[_noabort]`.
pub fn report_fn(access: AccessType, size: u64, recover: bool) -> String {
    if is_fixed_access_size(size) {
        format!("__asan_report_{}{size}{}", access.as_str(), noabort(recover))
    } else {
        format!("__asan_report_{}_n{}", access.as_str(), noabort(recover))
    }
}

/// Outlined check: `__asan_{load,store}{1,2,4,8,16,N}[_noabort]`.
pub fn check_fn(access: AccessType, size: u64, recover: bool) -> String {
    if is_fixed_access_size(size) {
        format!("__asan_{}{size}{}", access.as_str(), noabort(recover))
    } else {
        format!("__asan_{}N{}", access.as_str(), noabort(recover))
    }
}

/// `__asan_set_shadow_XX` for the values that have one.
pub fn set_shadow_fn(value: u8) -> Option<String> {
    SET_SHADOW_VALUES
        .contains(&value)
        .then(|| format!("__asan_set_shadow_{value:02x}"))
}

/// Whether a symbol belongs to the instrumentation rather than the program.
pub fn is_generated_symbol(name: &str) -> bool {
    name.starts_with(RUNTIME_PREFIX)
        || name.starts_with(ODR_INDICATOR_PREFIX)
        || name.starts_with("fasan.")
        || name == MODULE_CTOR
        || name == MODULE_DTOR
}

/// Runtime functions referenced by a pass, declared in the module once the
/// pass is done with the function bodies.
#[derive(Debug, Default)]
pub struct RuntimeDecls {
    decls: BTreeMap<String, (Vec<Type>, Option<Type>)>,
}

impl RuntimeDecls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` and return its symbol.
    pub fn use_fn(
        &mut self,
        symbols: &mut SymbolTable,
        name: &str,
        params: Vec<Type>,
        ret: Option<Type>,
    ) -> SymbolId {
        self.decls
            .entry(name.to_string())
            .or_insert((params, ret));
        symbols.intern(name)
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Declare every recorded function that the module does not define yet.
    pub fn declare_all(self, module: &mut Module) {
        for (name, (params, ret)) in self.decls {
            module.declare_function(&name, params, ret);
        }
    }
}
