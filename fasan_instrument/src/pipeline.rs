//! Explicit pass pipeline: the globals metadata analysis, the module pass,
//! then the function pass over every function.

use fasan_ir::module::Module;
use tracing::{debug, info, info_span};

use crate::analysis::{AnalysisCache, PassOutcome, PreservedAnalyses};
use crate::config::SanitizerConfig;
use crate::error::{Diagnostic, InstrumentResult};
use crate::function_pass::FunctionSanitizerPass;
use crate::module_pass::ModuleSanitizerPass;

/// What a pipeline run did, pass by pass.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub module: PassOutcome,
    /// Outcome per function, in module order.
    pub functions: Vec<(String, PassOutcome)>,
    /// Analyses preserved by every pass.
    pub preserved: PreservedAnalyses,
}

impl PipelineReport {
    pub fn changed(&self) -> bool {
        self.module.changed || self.functions.iter().any(|(_, o)| o.changed)
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.module
            .diagnostics
            .iter()
            .chain(self.functions.iter().flat_map(|(_, o)| o.diagnostics.iter()))
    }

    /// The outcome of the function named `name`.
    pub fn function(&self, name: &str) -> Option<&PassOutcome> {
        self.functions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outcome)| outcome)
    }
}

pub struct Pipeline {
    module_pass: ModuleSanitizerPass,
    function_pass: FunctionSanitizerPass,
    cache: AnalysisCache,
}

impl Pipeline {
    pub fn new(config: SanitizerConfig) -> Self {
        Self {
            module_pass: ModuleSanitizerPass::new(config.clone()),
            function_pass: FunctionSanitizerPass::new(config),
            cache: AnalysisCache::new(),
        }
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    /// Instrument `module`.
    pub fn run(&mut self, module: &mut Module) -> InstrumentResult<PipelineReport> {
        let span = info_span!("fasan_pipeline", module = %module.name);
        let _enter = span.enter();

        // Each run is one module's compilation. The store is computed before
        // the first pass and outlives every invalidation request of the run.
        self.cache.clear();
        let globals_md = self.cache.globals_metadata(module);
        let module_outcome = self.module_pass.run(module, globals_md)?;
        let mut preserved = module_outcome.preserved.clone();
        self.cache.invalidate(&module_outcome.preserved);

        let mut functions = Vec::new();
        // Functions the module pass added are generated and skipped anyway.
        for id in module.func_ids().collect::<Vec<_>>() {
            let globals_md = self.cache.globals_metadata(module);
            let outcome = self.function_pass.run(module, id, globals_md)?;
            self.cache.invalidate(&outcome.preserved);
            preserved.intersect(&outcome.preserved);
            let name = module.resolve(module.function(id).name).to_string();
            functions.push((name, outcome));
        }

        let report = PipelineReport {
            module: module_outcome,
            functions,
            preserved,
        };
        for diag in report.diagnostics() {
            debug!(%diag, "left uninstrumented");
        }
        info!(
            changed = report.changed(),
            analysis_runs = self.cache.computations(),
            "instrumentation finished"
        );
        Ok(report)
    }
}
