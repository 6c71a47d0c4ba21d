//! fasan_ir: Intermediate representation consumed by the fasan
//! instrumentation engine.

pub mod builder;
pub mod display;
pub mod function;
pub mod global;
pub mod instruction;
pub mod metadata;
pub mod module;
pub mod types;
pub mod value;
pub mod verifier;

#[cfg(test)]
mod tests;
