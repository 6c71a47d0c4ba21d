//! Globals metadata: frontend facts about global variables.
//!
//! The frontend emits one node per annotated global in the named list
//! `fasan.globals`:
//!
//! ```text
//! !fasan.globals = !{ !0, ... }
//! !0 = [ @global, !1, "display name", i64 dyn_init, i64 excluded ]
//! !1 = [ "file.c", i64 line, i64 column ]
//! ```
//!
//! Parsing is best effort. Missing or mistyped fields keep their defaults,
//! and a global without an entry behaves exactly like one with the default
//! entry.

use std::collections::BTreeMap;
use std::fmt;

use fasan_ir::global::GlobalId;
use fasan_ir::metadata::{MdOperand, MetadataRef};
use fasan_ir::module::Module;
use tracing::{debug, trace};

use crate::analysis::PreservedAnalyses;

/// Name of the module-level list the analysis reads.
pub const GLOBALS_METADATA_LIST: &str = "fasan.globals";

/// Source position of an annotated entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub filename: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub const fn empty() -> Self {
        Self {
            filename: String::new(),
            line: 0,
            column: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filename.is_empty()
    }

    /// Parse a `[filename, line, column]` node.
    pub fn parse(module: &Module, node: MetadataRef) -> Self {
        let mut loc = Self::empty();
        let Some(node) = module.metadata_node(node) else {
            return loc;
        };
        if let Some(filename) = node.operand(0).as_str() {
            loc.filename = filename.to_string();
        }
        if let Some(line) = node.operand(1).as_int() {
            loc.line = u32::try_from(line).unwrap_or(0);
        }
        if let Some(column) = node.operand(2).as_int() {
            loc.column = u32::try_from(column).unwrap_or(0);
        }
        loc
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.line, self.column)
    }
}

/// Frontend facts about one global.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalEntry {
    pub source_loc: SourceLocation,
    /// Source-level name; empty if the symbol name should be used.
    pub name: String,
    pub is_dyn_init: bool,
    pub is_excluded: bool,
}

static DEFAULT_ENTRY: GlobalEntry = GlobalEntry {
    source_loc: SourceLocation::empty(),
    name: String::new(),
    is_dyn_init: false,
    is_excluded: false,
};

/// Immutable per-module store of [`GlobalEntry`]s keyed by global.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalsMetadata {
    entries: BTreeMap<GlobalId, GlobalEntry>,
}

impl GlobalsMetadata {
    /// Scan `module` for global annotations.
    pub fn new(module: &Module) -> Self {
        let mut entries: BTreeMap<GlobalId, GlobalEntry> = BTreeMap::new();
        for &node_ref in module.named_metadata(GLOBALS_METADATA_LIST) {
            let Some(node) = module.metadata_node(node_ref) else {
                continue;
            };
            let Some(global) = node.operand(0).as_global() else {
                trace!(node = node_ref.index(), "globals metadata entry without a global");
                continue;
            };
            if global.index() >= module.globals.len() {
                continue;
            }
            // A global may be annotated more than once (e.g. after merging):
            // later location and name win, flags accumulate.
            let entry = entries.entry(global).or_default();
            if let MdOperand::Node(loc) = node.operand(1) {
                entry.source_loc = SourceLocation::parse(module, *loc);
            }
            if let Some(name) = node.operand(2).as_str() {
                entry.name = name.to_string();
            }
            entry.is_dyn_init |= node.operand(3).as_int().is_some_and(|v| v != 0);
            entry.is_excluded |= node.operand(4).as_int().is_some_and(|v| v != 0);
        }
        debug!(module = %module.name, entries = entries.len(), "collected globals metadata");
        Self { entries }
    }

    /// The entry for `global`, or the default entry if it has none.
    pub fn get(&self, global: GlobalId) -> &GlobalEntry {
        self.entries.get(&global).unwrap_or(&DEFAULT_ENTRY)
    }

    pub fn contains(&self, global: GlobalId) -> bool {
        self.entries.contains_key(&global)
    }

    pub fn iter(&self) -> impl Iterator<Item = (GlobalId, &GlobalEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invalidation hook for the analysis cache. The association between
    /// globals and their annotations cannot change within one pipeline, so
    /// the request is always declined.
    pub fn invalidate(&self, _preserved: &PreservedAnalyses) -> bool {
        false
    }
}

/// Module analysis producing [`GlobalsMetadata`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalsMetadataAnalysis;

impl GlobalsMetadataAnalysis {
    pub fn run(&self, module: &Module) -> GlobalsMetadata {
        GlobalsMetadata::new(module)
    }
}
