//! fasan_instrument: address sanitizer instrumentation for fasan IR.
//!
//! The engine rewrites a module so that every memory access is checked
//! against a shadow map at runtime. Globals get trailing redzones and are
//! registered with the runtime by a module constructor; stack variables are
//! merged into redzoned frames.

pub mod analysis;
pub mod config;
pub mod error;
pub mod function_pass;
pub mod layout;
pub mod metadata;
pub mod module_pass;
pub mod pipeline;
pub mod runtime;
pub mod shadow;
mod stack;


pub use analysis::{AnalysisCache, AnalysisKind, PassOutcome, PassStats, PreservedAnalyses};
pub use config::{Arch, ObjectFormat, Os, SanitizerConfig, Target};
pub use error::{Diagnostic, InstrumentError, InstrumentResult};
pub use function_pass::FunctionSanitizerPass;
pub use metadata::{GlobalEntry, GlobalsMetadata, GlobalsMetadataAnalysis, SourceLocation};
pub use module_pass::{ModuleSanitizerPass, RegistrationScheme};
pub use pipeline::{Pipeline, PipelineReport};
pub use shadow::ShadowMapping;
