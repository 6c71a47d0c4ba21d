//! Error and diagnostic types.

use std::fmt;

use thiserror::Error;

use crate::metadata::SourceLocation;
use crate::shadow::{MAX_SCALE, MIN_SCALE};

/// Fatal instrumentation failures. Anything else is skipped and reported
/// as a [`Diagnostic`].
#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("invalid input in @{function}: {message}")]
    InvalidInput { function: String, message: String },
    #[error("function id {0} is out of range")]
    UnknownFunction(u32),
    #[error("invalid sanitizer configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("unsupported shadow scale {0}, expected {min}..={max}", min = MIN_SCALE, max = MAX_SCALE)]
    UnsupportedScale(u8),
}

pub type InstrumentResult<T> = Result<T, InstrumentError>;

/// A construct that was left uninstrumented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub symbol: String,
    pub location: SourceLocation,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.location.is_empty() {
            write!(f, "@{}: {}", self.symbol, self.message)
        } else {
            write!(f, "{}: @{}: {}", self.location, self.symbol, self.message)
        }
    }
}
