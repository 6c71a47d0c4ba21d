//! Redzone layout for globals and stack frames.

use crate::shadow::{
    STACK_LEFT_REDZONE, STACK_MID_REDZONE, STACK_RIGHT_REDZONE, STACK_USE_AFTER_SCOPE,
};

/// Upper bound of a global redzone.
pub const MAX_GLOBAL_REDZONE: u64 = 1 << 18;

/// Smallest redzone appended to a global; also the minimum alignment of an
/// instrumented global.
pub fn min_global_redzone(granularity: u64) -> u64 {
    granularity.max(32)
}

/// Redzone appended to a global of `size` bytes.
///
/// Grows with the object (about a quarter of it) and is rounded up so that
/// `size + redzone` is a multiple of the minimum redzone.
pub fn global_redzone_size(size: u64, granularity: u64) -> u64 {
    let min_rz = min_global_redzone(granularity);
    let rz = (size / min_rz / 4 * min_rz).clamp(min_rz, MAX_GLOBAL_REDZONE);
    if size % min_rz != 0 {
        rz + min_rz - size % min_rz
    } else {
        rz
    }
}

// ---------------------------------------------------------------------------
// Stack frames
// ---------------------------------------------------------------------------

/// Bytes reserved at the start of every frame for the header.
pub const MIN_FRAME_HEADER: u64 = 32;
/// Alignment every stack variable is raised to.
const MIN_VARIABLE_ALIGNMENT: u64 = 16;

/// A stack variable placed in an instrumented frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackVariable {
    pub name: String,
    pub size: u64,
    pub alignment: u64,
    /// Bytes covered by lifetime markers; 0 if the variable has none.
    pub lifetime_size: u64,
    /// Source line, 0 if unknown.
    pub line: u32,
    /// Offset from the frame base, filled in by [`compute_frame_layout`].
    pub offset: u64,
    /// Position of the variable before sorting, for the caller's bookkeeping.
    pub index: usize,
}

impl StackVariable {
    pub fn new(index: usize, name: impl Into<String>, size: u64, alignment: u64) -> Self {
        Self {
            name: name.into(),
            size,
            alignment,
            lifetime_size: 0,
            line: 0,
            offset: 0,
            index,
        }
    }
}

/// Result of [`compute_frame_layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub granularity: u64,
    pub frame_size: u64,
    pub frame_alignment: u64,
}

/// Size of a variable plus its trailing redzone.
fn var_and_redzone_size(size: u64, granularity: u64, next_alignment: u64) -> u64 {
    let res = match size {
        0..=4 => 16,
        5..=16 => 32,
        17..=128 => size + 32,
        129..=512 => size + 64,
        513..=4096 => size + 128,
        _ => size + 256,
    };
    res.max(2 * granularity).next_multiple_of(next_alignment)
}

/// Assign frame offsets to `vars`, which must be non-empty with non-zero
/// sizes. The variables are sorted by decreasing alignment (stable), and
/// every variable starts on a granule boundary after a poisoned gap.
pub fn compute_frame_layout(vars: &mut [StackVariable], granularity: u64) -> FrameLayout {
    debug_assert!(!vars.is_empty());
    debug_assert!(granularity.is_power_of_two() && (8..=64).contains(&granularity));
    for var in vars.iter_mut() {
        var.alignment = var.alignment.max(MIN_VARIABLE_ALIGNMENT);
    }
    vars.sort_by(|a, b| b.alignment.cmp(&a.alignment));

    let first_alignment = vars[0].alignment;
    let frame_alignment = granularity.max(first_alignment);
    let mut offset = MIN_FRAME_HEADER.max(granularity).max(first_alignment);
    for i in 0..vars.len() {
        let next_alignment = match vars.get(i + 1) {
            Some(next) => granularity.max(next.alignment),
            None => granularity,
        };
        vars[i].offset = offset;
        offset += var_and_redzone_size(vars[i].size, granularity, next_alignment);
    }
    if offset % MIN_FRAME_HEADER != 0 {
        offset += MIN_FRAME_HEADER - offset % MIN_FRAME_HEADER;
    }
    FrameLayout {
        granularity,
        frame_size: offset,
        frame_alignment,
    }
}

/// Shadow of a live frame with every variable in scope.
pub fn frame_shadow_bytes(vars: &[StackVariable], layout: &FrameLayout) -> Vec<u8> {
    let g = layout.granularity;
    let mut shadow = Vec::with_capacity((layout.frame_size / g) as usize);
    if let Some(first) = vars.first() {
        shadow.resize((first.offset / g) as usize, STACK_LEFT_REDZONE);
    }
    for var in vars {
        shadow.resize((var.offset / g) as usize, STACK_MID_REDZONE);
        shadow.resize(shadow.len() + (var.size / g) as usize, 0);
        if var.size % g != 0 {
            shadow.push((var.size % g) as u8);
        }
    }
    shadow.resize((layout.frame_size / g) as usize, STACK_RIGHT_REDZONE);
    shadow
}

/// Shadow of a frame at function entry: variables with lifetime markers
/// start out of scope.
pub fn frame_shadow_bytes_after_scope(vars: &[StackVariable], layout: &FrameLayout) -> Vec<u8> {
    let g = layout.granularity;
    let mut shadow = frame_shadow_bytes(vars, layout);
    for var in vars {
        debug_assert!(var.lifetime_size <= var.size);
        let begin = (var.offset / g) as usize;
        let len = var.lifetime_size.div_ceil(g) as usize;
        shadow[begin..begin + len].fill(STACK_USE_AFTER_SCOPE);
    }
    shadow
}

/// The runtime-readable frame description:
/// `"<count> <offset> <size> <name len> <name> ..."`, where a known source
/// line is appended to the name as `name:line`.
pub fn frame_description(vars: &[StackVariable]) -> String {
    let mut desc = vars.len().to_string();
    for var in vars {
        let name = if var.line != 0 {
            format!("{}:{}", var.name, var.line)
        } else {
            var.name.clone()
        };
        desc.push_str(&format!(" {} {} {} {}", var.offset, var.size, name.len(), name));
    }
    desc
}
