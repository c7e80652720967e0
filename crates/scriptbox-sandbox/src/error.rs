//! Error types for the scriptbox sandbox.
//!
//! Two families live here. [`SandboxError`] covers host-internal failures and
//! is returned as `Err` from [`crate::SandboxExecutor::execute`]. Everything a
//! guest script can cause is reported instead through [`ErrorInfo`] inside a
//! successful [`crate::ExecutionResult`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host-side failures. These indicate a platform malfunction, not a bad script.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The engine or a fresh context could not be constructed.
    #[error("script engine unavailable: {reason}")]
    EngineUnavailable {
        /// What failed during construction.
        reason: String,
    },

    /// Too many concurrent execution contexts.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent contexts.
        max: usize,
    },

    /// A job was sent to a context that has already been disposed.
    #[error("execution context already disposed")]
    ContextDisposed,

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Request or result serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Classify this host failure on the same scale as guest failures.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::EngineUnavailable
    }
}

/// Classification of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The source could not be turned into an executable module.
    CompileError,
    /// The guest threw or rejected.
    RuntimeError,
    /// Module evaluation or the handler exceeded its wall-clock budget.
    Timeout,
    /// The context hit its heap ceiling.
    OutOfMemory,
    /// The engine could not provide a context.
    EngineUnavailable,
}

impl ErrorKind {
    /// Stable name, identical to the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompileError => "CompileError",
            Self::RuntimeError => "RuntimeError",
            Self::Timeout => "Timeout",
            Self::OutOfMemory => "OutOfMemory",
            Self::EngineUnavailable => "EngineUnavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 1-based position in the submitted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Line number, starting at 1.
    pub line: u32,
    /// Column number, starting at 1.
    pub column: u32,
}

/// The error half of an [`crate::ExecutionResult`].
///
/// Native guest error objects never cross the boundary; only their string
/// projection does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Guest stack trace, when the thrown value carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Source position, for compile errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl ErrorInfo {
    /// Build an error with just a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            location: None,
        }
    }

    /// Attach a guest stack trace.
    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack.filter(|s| !s.is_empty());
        self
    }
}

impl From<crate::compiler::CompileError> for ErrorInfo {
    fn from(err: crate::compiler::CompileError) -> Self {
        Self {
            kind: ErrorKind::CompileError,
            message: err.message,
            stack: None,
            location: err.location,
        }
    }
}
