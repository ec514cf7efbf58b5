//! Error type with stable codes.
//!
//! Every failure surfaced by the runner carries a stable `E_*` code so that
//! embedders and the CLI can branch on the failure class without string
//! matching. Only `E_CONFIG` and `E_GLOBAL_TIMEOUT` terminate a run; all
//! other codes are localized to a single test attempt.

use miette::Diagnostic;
use serde_json::Value;
use std::fmt;

/// Result type alias used throughout the crate.
pub type TactResult<T> = Result<T, TactError>;

/// Error with a stable code and optional structured context.
#[derive(Debug)]
pub struct TactError {
    /// Stable error code (e.g. `E_CONFIG`).
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Structured context for diagnostics.
    pub context: Option<Value>,
}

impl TactError {
    /// Configuration error: malformed config file, invalid filter regex.
    pub fn config(message: impl Into<String>) -> Self {
        Self {
            code: "E_CONFIG",
            message: message.into(),
            context: None,
        }
    }

    /// I/O failure, with the source error captured as context.
    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self {
            code: "E_IO",
            message: message.into(),
            context: Some(serde_json::json!({ "source": err.to_string() })),
        }
    }

    /// Worker protocol violation: invalid frame, version mismatch.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            code: "E_PROTOCOL",
            message: message.into(),
            context: None,
        }
    }

    pub fn protocol_with_context(message: impl Into<String>, context: Value) -> Self {
        Self {
            code: "E_PROTOCOL",
            message: message.into(),
            context: Some(context),
        }
    }

    /// Test-file load error: parse failure, bad declaration.
    pub fn load(message: impl Into<String>) -> Self {
        Self {
            code: "E_LOAD",
            message: message.into(),
            context: None,
        }
    }

    /// Deadline exceeded.
    pub fn timeout(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self {
            code: "E_TIMEOUT",
            message: message.into(),
            context: context.into(),
        }
    }

    /// Invariant violation inside the runner itself.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "E_INTERNAL",
            message: message.into(),
            context: None,
        }
    }
}

impl fmt::Display for TactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TactError {}

impl Diagnostic for TactError {}
