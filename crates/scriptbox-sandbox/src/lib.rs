#![warn(missing_docs)]

//! # scriptbox-sandbox
//!
//! Runs untrusted serverless function scripts in V8.
//!
//! A script is a TypeScript or JavaScript module whose default export is a
//! handler. [`SandboxExecutor::execute`] compiles it, evaluates it in a fresh
//! context, calls the handler with `{ params, secrets }`, and returns an
//! [`ExecutionResult`] with the handler's value or error, the console output
//! and a trace of every outbound request.
//!
//! ## Security model
//!
//! - **Fresh context per call**: no state survives between invocations
//! - **No ambient capabilities**: no fs, env, process, or module access
//! - **Copy-only bridge**: `console`, `fetch` and timers are the only host
//!   entry points, and everything crossing them is copied as JSON
//! - **Pre-execution validation**: banned patterns caught before reaching V8
//! - **Two timeouts**: module evaluation and the handler each have a budget,
//!   enforced for CPU-bound code too
//! - **Memory ceiling**: covers the V8 heap and `ArrayBuffer` backing stores;
//!   exceeding it tears down the context, not the process
//! - **Secret redaction**: secret values are masked in logs and the trace

mod allocator;
pub mod audit;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod isolate;
pub mod loader;
pub mod marshal;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod network;
pub mod ops;
pub mod redact;
pub mod shim;
pub mod timers;
pub mod types;
pub mod validator;

pub use compiler::{compile, CompileError, CompiledModule};
pub use error::{ErrorInfo, ErrorKind, SandboxError, SourceLocation};
pub use executor::{SandboxConfig, SandboxExecutor};
pub use isolate::IsolateManager;
pub use network::{FetchRequest, FetchResponse, HttpFetcher, NetworkPolicy};
pub use scriptbox_error::FetchError;
pub use types::{ExecutionRequest, ExecutionResult, LogEntry, LogLevel, NetworkLog, NetworkLogEntry};

/// Performs outbound HTTP requests on behalf of guest `fetch()`.
///
/// The default is [`HttpFetcher`]. Embedders can substitute their own, for
/// example to route through an egress proxy or to stub the network in tests.
/// Whatever the implementation, the executor wraps it so every request is
/// traced and aborted if its context goes away.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform one request and read the full response body.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}
