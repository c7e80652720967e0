//! Audit logging for sandbox executions.
//!
//! Every call to [`crate::SandboxExecutor::execute`] emits one [`AuditEntry`]:
//! - Execution ID (UUID)
//! - SHA-256 hash of the source (never the raw source)
//! - A redacted preview of the first 500 bytes of source
//! - One summary per outbound request, with the URL hashed
//! - Log count, duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ErrorKind, SandboxError};
use crate::types::{ExecutionResult, NetworkLogEntry};

/// Maximum length of the source preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// When the execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted source.
    pub code_hash: String,
    /// Redacted head of the source, for human review.
    pub code_preview: String,
    /// Outbound requests made during execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetches: Vec<FetchAudit>,
    /// Number of console entries captured.
    pub log_count: usize,
    /// Total execution duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the serialized `data` in bytes.
    pub result_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// Audit record for one outbound request.
#[derive(Debug, Clone, Serialize)]
pub struct FetchAudit {
    /// Upper-case HTTP method.
    pub method: String,
    /// SHA-256 hash of the URL (URLs may carry secrets in query strings).
    pub url_hash: String,
    /// Response status, if a response arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Request duration in milliseconds.
    pub duration_ms: u64,
    /// Whether a response arrived.
    pub success: bool,
}

impl From<&NetworkLogEntry> for FetchAudit {
    fn from(entry: &NetworkLogEntry) -> Self {
        Self {
            method: entry.method.clone(),
            url_hash: sha256_hex(&entry.url),
            status: entry.status,
            duration_ms: entry.duration_ms,
            success: entry.error.is_none(),
        }
    }
}

/// The outcome of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The handler settled with a value.
    Success,
    /// Compile, runtime or host failure.
    Error {
        /// Failure class.
        kind: ErrorKind,
        /// The error message.
        message: String,
    },
    /// Module evaluation or the handler ran past its budget.
    Timeout,
    /// The context hit its heap ceiling.
    OutOfMemory,
}

impl AuditOutcome {
    /// Short label used in log lines and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error { kind, .. } => kind.as_str(),
            Self::Timeout => ErrorKind::Timeout.as_str(),
            Self::OutOfMemory => ErrorKind::OutOfMemory.as_str(),
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// Compute the SHA-256 hash of a string, returned as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// First [`CODE_PREVIEW_MAX`] bytes of `code`, with an ellipsis if cut.
///
/// Cuts on a char boundary.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &code[..end])
}

/// Collects the pieces of an [`AuditEntry`] while an execution runs.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start an entry for `source`.
    pub fn new(source: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(source),
            code_preview: crate::redact::redact_error_message(&code_preview(source)),
            start: Instant::now(),
        }
    }

    /// The execution id this entry will carry.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Finalize the entry with the execution result.
    pub fn finish(self, result: &Result<ExecutionResult, SandboxError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (fetches, log_count, result_size_bytes, outcome) = match result {
            Ok(res) => {
                let size = res
                    .data
                    .as_ref()
                    .and_then(|v| serde_json::to_string(v).ok())
                    .map_or(0, |s| s.len());
                let outcome = match &res.error {
                    None => AuditOutcome::Success,
                    Some(e) => match e.kind {
                        ErrorKind::Timeout => AuditOutcome::Timeout,
                        ErrorKind::OutOfMemory => AuditOutcome::OutOfMemory,
                        kind => AuditOutcome::Error {
                            kind,
                            message: e.message.clone(),
                        },
                    },
                };
                (
                    res.network_trace.iter().map(FetchAudit::from).collect(),
                    res.logs.len(),
                    size,
                    outcome,
                )
            }
            Err(e) => (
                Vec::new(),
                0,
                0,
                AuditOutcome::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            fetches,
            log_count,
            duration_ms,
            result_size_bytes,
            outcome,
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` with `audit = true` for easy filtering.
/// Fetches are summarised as a count.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            fetches = entry.fetches.len(),
            logs = entry.log_count,
            outcome = entry.outcome.label(),
            "audit"
        );
    }
}
