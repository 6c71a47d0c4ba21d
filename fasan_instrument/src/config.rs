//! Construction-time configuration of the instrumentation passes.
//!
//! Every knob is a named field with a documented default, and the whole
//! record can be loaded from JSON. Fields missing from the input keep
//! their defaults.

use serde::{Deserialize, Serialize};

use crate::error::{InstrumentError, InstrumentResult};
use crate::shadow::{ShadowMapping, MAX_SCALE, MIN_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    X86_64,
    AArch64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    #[default]
    Linux,
    FreeBsd,
    MacOs,
}

/// Object file format; decides which global registration scheme is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectFormat {
    #[default]
    Elf,
    MachO,
    Coff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    pub arch: Arch,
    pub os: Os,
    pub format: ObjectFormat,
}

impl Target {
    pub fn new(arch: Arch, os: Os, format: ObjectFormat) -> Self {
        Self { arch, os, format }
    }
}

/// Configuration shared by the function and module passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Kernel-style instrumentation: kernel shadow offset, no runtime
    /// initialization call and no init-order checking.
    pub compile_kernel: bool,
    /// Report calls return and execution continues after an error.
    pub recover: bool,
    /// Poison stack variables outside their lifetime markers.
    pub use_after_scope: bool,
    /// Register globals through linker-collectible metadata sections when
    /// the object format allows it.
    pub use_global_gc: bool,
    /// Emit an ODR indicator symbol for every externally visible global.
    pub use_odr_indicator: bool,
    pub target: Target,
    /// log2 of the shadow granularity.
    pub mapping_scale: u8,
    /// Shadow base offset; `None` picks the target default.
    pub mapping_offset: Option<u64>,
    pub instrument_reads: bool,
    pub instrument_writes: bool,
    pub instrument_atomics: bool,
    /// Replace memcpy/memmove/memset with checking runtime calls.
    pub instrument_mem_intrinsics: bool,
    /// Bracket dynamic initializers with init-order poisoning calls.
    pub check_init_order: bool,
    /// Check a pointer once per block until a call intervenes.
    pub opt_same_temp: bool,
    /// Skip constant in-bounds accesses to stack slots.
    pub opt_stack: bool,
    /// Skip constant in-bounds accesses to globals.
    pub opt_globals: bool,
    /// Leave stack slots that are only loaded and stored whole alone.
    pub skip_promotable_slots: bool,
    pub instrument_stack: bool,
    pub instrument_globals: bool,
    /// Functions with more checked accesses than this call outlined
    /// check routines instead of inlining the shadow test.
    pub calls_threshold: usize,
    /// Shadow runs at least this long are written by a runtime call.
    pub max_inline_poisoning_size: usize,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            compile_kernel: false,
            recover: false,
            use_after_scope: false,
            use_global_gc: true,
            use_odr_indicator: false,
            target: Target::default(),
            mapping_scale: 3,
            mapping_offset: None,
            instrument_reads: true,
            instrument_writes: true,
            instrument_atomics: true,
            instrument_mem_intrinsics: true,
            check_init_order: true,
            opt_same_temp: true,
            opt_stack: true,
            opt_globals: true,
            skip_promotable_slots: true,
            instrument_stack: true,
            instrument_globals: true,
            calls_threshold: 7000,
            max_inline_poisoning_size: 64,
        }
    }
}

impl SanitizerConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> InstrumentResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the passes cannot honour.
    pub fn validate(&self) -> InstrumentResult<()> {
        if !(MIN_SCALE..=MAX_SCALE).contains(&self.mapping_scale) {
            return Err(InstrumentError::UnsupportedScale(self.mapping_scale));
        }
        Ok(())
    }

    /// The address-to-shadow transform selected by this configuration.
    pub fn shadow_mapping(&self) -> ShadowMapping {
        let default = ShadowMapping::for_target(&self.target, self.compile_kernel);
        ShadowMapping {
            scale: self.mapping_scale,
            offset: self.mapping_offset.unwrap_or(default.offset),
        }
    }
}
