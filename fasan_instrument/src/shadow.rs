//! Shadow memory mapping and encoding.
//!
//! Every `granularity` bytes of application memory are described by one
//! shadow byte at `(addr >> scale) + offset`:
//!
//! - `0`: the whole granule is addressable;
//! - `1..granularity-1`: only that many leading bytes are addressable;
//! - a value with the high bit set: the whole granule is poisoned, the
//!   value telling the runtime which kind of redzone it is.
//!
//! Values in `granularity..=0x7f` are never produced by the instrumentation
//! or the runtime; the checks treat them as fully addressable.

use crate::config::{Arch, Os, Target};

/// Left redzone of a stack frame (holds the frame header).
pub const STACK_LEFT_REDZONE: u8 = 0xf1;
/// Redzone between two stack variables.
pub const STACK_MID_REDZONE: u8 = 0xf2;
/// Redzone after the last stack variable.
pub const STACK_RIGHT_REDZONE: u8 = 0xf3;
/// Frame memory after the function returned.
pub const STACK_AFTER_RETURN: u8 = 0xf5;
/// Stack variable outside its lifetime.
pub const STACK_USE_AFTER_SCOPE: u8 = 0xf8;
/// Redzone trailing a global variable.
pub const GLOBAL_REDZONE: u8 = 0xf9;

/// Stored at offset 0 of a live instrumented frame.
pub const FRAME_MAGIC: u64 = 0x41B5_8AB3;
/// Replaces [`FRAME_MAGIC`] when the frame is torn down.
pub const RETIRED_FRAME_MAGIC: u64 = 0x45E0_360E;

pub const DEFAULT_SCALE: u8 = 3;
/// Granules of 8 to 64 bytes; frame layout and the signed partial-granule
/// encoding rely on this range.
pub const MIN_SCALE: u8 = 3;
pub const MAX_SCALE: u8 = 6;
pub const X86_64_LINUX_OFFSET: u64 = 0x7fff_8000;
pub const X86_64_FREEBSD_OFFSET: u64 = 1 << 46;
pub const AARCH64_LINUX_OFFSET: u64 = 1 << 36;
pub const AARCH64_FREEBSD_OFFSET: u64 = 1 << 47;
pub const DEFAULT_OFFSET_64: u64 = 1 << 44;
pub const X86_64_KERNEL_OFFSET: u64 = 0xdfff_fc00_0000_0000;

/// Affine address-to-shadow transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMapping {
    pub scale: u8,
    pub offset: u64,
}

impl ShadowMapping {
    /// Default mapping for a target.
    pub fn for_target(target: &Target, kernel: bool) -> Self {
        let offset = match (target.arch, target.os) {
            (Arch::X86_64, Os::Linux) if kernel => X86_64_KERNEL_OFFSET,
            (Arch::X86_64, Os::Linux) => X86_64_LINUX_OFFSET,
            (Arch::X86_64, Os::FreeBsd) => X86_64_FREEBSD_OFFSET,
            (Arch::X86_64, Os::MacOs) => DEFAULT_OFFSET_64,
            (Arch::AArch64, Os::Linux) => AARCH64_LINUX_OFFSET,
            (Arch::AArch64, Os::FreeBsd) => AARCH64_FREEBSD_OFFSET,
            (Arch::AArch64, Os::MacOs) => DEFAULT_OFFSET_64,
        };
        Self {
            scale: DEFAULT_SCALE,
            offset,
        }
    }

    /// Bytes of application memory per shadow byte.
    pub fn granularity(&self) -> u64 {
        1 << self.scale
    }

    pub fn shadow_addr(&self, addr: u64) -> u64 {
        (addr >> self.scale).wrapping_add(self.offset)
    }

    /// Number of shadow bytes the inline check loads for an access of
    /// `size` bytes.
    pub fn shadow_load_width(&self, size: u64) -> u64 {
        (size >> self.scale).max(1)
    }

    /// Whether an access of `size` bytes needs the partial-granule slow path
    /// after a non-zero shadow value.
    pub fn needs_slow_path(&self, size: u64) -> bool {
        size < self.granularity()
    }

    /// The inline fast path: any non-zero shadow value is suspicious.
    pub fn fast_path_poisoned(&self, shadow: u8) -> bool {
        shadow != 0
    }

    /// Full inline check for an access of `size` bytes at `addr` that stays
    /// inside one granule, as emitted by the function pass.
    pub fn check_poisoned(&self, addr: u64, size: u64, shadow: u8) -> bool {
        if !self.fast_path_poisoned(shadow) {
            return false;
        }
        if !self.needs_slow_path(size) {
            return true;
        }
        let last = (addr & (self.granularity() - 1)) + size - 1;
        last as i64 >= shadow as i8 as i64
    }

    /// Byte-exact reference: is the byte at `addr` addressable under `shadow`?
    pub fn byte_addressable(&self, addr: u64, shadow: u8) -> bool {
        let value = shadow as i8;
        value == 0 || (value > 0 && (addr & (self.granularity() - 1)) < value as u64)
    }
}

/// Shadow bytes describing an object of `size` bytes followed by a redzone,
/// `total` bytes in all. `total` must be a multiple of the granularity.
pub fn object_shadow(size: u64, total: u64, granularity: u64, redzone: u8) -> Vec<u8> {
    let mut shadow = vec![0u8; (size / granularity) as usize];
    if size % granularity != 0 {
        shadow.push((size % granularity) as u8);
    }
    shadow.resize((total / granularity) as usize, redzone);
    shadow
}
