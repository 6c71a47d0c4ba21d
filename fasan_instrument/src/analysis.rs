//! Preserved-analysis sets, pass outcomes and the per-module analysis cache.

use std::collections::BTreeSet;

use fasan_ir::module::Module;
use tracing::{debug, trace};

use crate::error::Diagnostic;
use crate::metadata::{GlobalsMetadata, GlobalsMetadataAnalysis};

/// Derived facts a pass may keep valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnalysisKind {
    /// Block structure and branch edges.
    Cfg,
    DominatorTree,
    GlobalsMetadata,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 3] = [
        AnalysisKind::Cfg,
        AnalysisKind::DominatorTree,
        AnalysisKind::GlobalsMetadata,
    ];
}

/// The set of analyses a pass run left valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservedAnalyses {
    kinds: BTreeSet<AnalysisKind>,
}

impl PreservedAnalyses {
    /// Nothing changed.
    pub fn all() -> Self {
        Self {
            kinds: AnalysisKind::ALL.into_iter().collect(),
        }
    }

    pub fn none() -> Self {
        Self {
            kinds: BTreeSet::new(),
        }
    }

    pub fn preserve(mut self, kind: AnalysisKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn is_preserved(&self, kind: AnalysisKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn are_all_preserved(&self) -> bool {
        AnalysisKind::ALL.iter().all(|k| self.kinds.contains(k))
    }

    /// Keep only what both sets preserve.
    pub fn intersect(&mut self, other: &PreservedAnalyses) {
        self.kinds.retain(|k| other.kinds.contains(k));
    }
}

/// Lazily computed module analyses, shared by every pass of a pipeline.
#[derive(Debug, Default)]
pub struct AnalysisCache {
    globals: Option<GlobalsMetadata>,
    computations: u32,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The globals metadata of `module`, computing it on first use.
    pub fn globals_metadata(&mut self, module: &Module) -> &GlobalsMetadata {
        if self.globals.is_none() {
            self.computations += 1;
        }
        self.globals
            .get_or_insert_with(|| GlobalsMetadataAnalysis.run(module))
    }

    pub fn cached_globals_metadata(&self) -> Option<&GlobalsMetadata> {
        self.globals.as_ref()
    }

    /// How many times an analysis had to be computed.
    pub fn computations(&self) -> u32 {
        self.computations
    }

    /// Forget every result, including ones that decline invalidation.
    /// Results are keyed by ids that only mean something within one module.
    pub fn clear(&mut self) {
        if self.globals.take().is_some() {
            trace!("cleared cached globals metadata");
        }
    }

    /// Drop every cached result that is not preserved and does not refuse
    /// invalidation.
    pub fn invalidate(&mut self, preserved: &PreservedAnalyses) {
        if preserved.is_preserved(AnalysisKind::GlobalsMetadata) {
            return;
        }
        if let Some(globals) = &self.globals {
            if globals.invalidate(preserved) {
                debug!("dropping cached globals metadata");
                self.globals = None;
            } else {
                trace!("globals metadata declined invalidation");
            }
        }
    }
}

/// Counters reported by a pass run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Accesses that received an inline or outlined check.
    pub instrumented_accesses: usize,
    /// Accesses proven safe or excluded from checking.
    pub skipped_accesses: usize,
    /// memcpy/memmove/memset replaced by runtime calls.
    pub replaced_intrinsics: usize,
    /// Stack slots merged into a redzoned frame.
    pub stack_variables: usize,
    pub instrumented_globals: usize,
    pub skipped_globals: usize,
    /// Constructors bracketed with init-order calls.
    pub wrapped_initializers: usize,
}

impl PassStats {
    pub fn merge(&mut self, other: &PassStats) {
        self.instrumented_accesses += other.instrumented_accesses;
        self.skipped_accesses += other.skipped_accesses;
        self.replaced_intrinsics += other.replaced_intrinsics;
        self.stack_variables += other.stack_variables;
        self.instrumented_globals += other.instrumented_globals;
        self.skipped_globals += other.skipped_globals;
        self.wrapped_initializers += other.wrapped_initializers;
    }
}

/// What a pass run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub changed: bool,
    pub preserved: PreservedAnalyses,
    pub stats: PassStats,
    pub diagnostics: Vec<Diagnostic>,
}

impl PassOutcome {
    pub fn unchanged() -> Self {
        Self {
            changed: false,
            preserved: PreservedAnalyses::all(),
            stats: PassStats::default(),
            diagnostics: Vec::new(),
        }
    }
}
