//! Sandbox executor: the public entry point.
//!
//! [`SandboxExecutor::execute`] validates and compiles the source, takes a
//! fresh [`Context`](crate::isolate::Context) from the shared
//! [`IsolateManager`], runs the guest module and its default export inside it,
//! and always disposes the context before returning.
//!
//! The in-context half lives in [`run_invocation`], which runs on the
//! context's own thread.

use std::future::{poll_fn, Future};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

use deno_core::error::CoreError;
use deno_core::{v8, JsRuntime, ModuleSpecifier, PollEventLoopOptions};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::compiler::compile;
use crate::error::{ErrorInfo, ErrorKind, SandboxError};
use crate::isolate::{ContextSignals, IsolateManager, Watchdog};
use crate::loader::{ENTRY_SPECIFIER, GUEST_SPECIFIER};
use crate::network::{HostLoopFetcher, HttpFetcher, InstrumentedFetcher, NetworkPolicy};
use crate::ops::{
    ConsoleBuffer, FetchLimits, InvocationInput, InvocationToken, ResponseBodies, Settlement,
};
use crate::redact::SecretRedactor;
use crate::shim::{entry_module, BOOTSTRAP, BOOTSTRAP_NAME};
use crate::timers::TimeoutRegistry;
use crate::types::{ExecutionRequest, ExecutionResult, LogEntry};
use crate::validator::validate_source;
use crate::Fetcher;

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Invocation budget used when the caller has none of its own.
    pub timeout: Duration,
    /// Budget for evaluating the guest module's top level.
    pub module_timeout: Duration,
    /// V8 heap ceiling per context, in bytes.
    pub max_heap_size: usize,
    /// Maximum contexts alive at once.
    pub max_concurrent: usize,
    /// Contexts built ahead of demand, capped at `max_concurrent`.
    pub warm_contexts: usize,
    /// Maximum source size in bytes.
    pub max_source_size: usize,
    /// Maximum serialized result size in bytes.
    pub max_output_size: usize,
    /// Maximum `fetch` calls per invocation.
    pub max_fetch_calls: usize,
    /// Maximum request body size for `fetch`, in bytes.
    pub max_fetch_body_size: usize,
    /// Maximum pending timers per invocation.
    pub max_timers: usize,
    /// Maximum console entries kept per invocation.
    pub max_log_entries: usize,
    /// Mask secret values in logs and the network trace.
    pub redact_secrets: bool,
    /// Outbound network policy for the default fetcher.
    pub network: NetworkPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            module_timeout: Duration::from_secs(30),
            max_heap_size: 128 * 1024 * 1024, // 128 MB
            max_concurrent: 8,
            warm_contexts: crate::isolate::DEFAULT_WARM_CONTEXTS,
            max_source_size: crate::validator::DEFAULT_MAX_SOURCE_SIZE,
            max_output_size: 4 * 1024 * 1024, // 4 MB
            max_fetch_calls: 50,
            max_fetch_body_size: 1024 * 1024, // 1 MB
            max_timers: 1000,
            max_log_entries: 1000,
            redact_secrets: true,
            network: NetworkPolicy::default(),
        }
    }
}

/// Per-invocation bridge limits.
#[derive(Debug, Clone, Copy)]
pub struct BridgeLimits {
    /// Maximum `fetch` calls.
    pub max_fetch_calls: usize,
    /// Maximum request body size.
    pub max_fetch_body_size: usize,
    /// Maximum pending timers.
    pub max_timers: usize,
    /// Maximum console entries.
    pub max_log_entries: usize,
}

impl From<&SandboxConfig> for BridgeLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_fetch_calls: config.max_fetch_calls,
            max_fetch_body_size: config.max_fetch_body_size,
            max_timers: config.max_timers,
            max_log_entries: config.max_log_entries,
        }
    }
}

/// Everything a context needs to run one invocation.
pub struct Invocation {
    /// Compiled guest module.
    pub code: String,
    /// Handler input.
    pub input: InvocationInput,
    /// Fetcher the bridge issues requests through.
    pub fetcher: Arc<dyn Fetcher>,
    /// Bridge limits.
    pub limits: BridgeLimits,
    /// Budget for module evaluation.
    pub module_timeout: Duration,
    /// Budget for the handler.
    pub timeout: Duration,
    /// Maximum serialized result size.
    pub max_output_size: usize,
}

/// What a context reports back. The network trace is collected host-side.
#[derive(Debug, Default)]
pub struct InvocationOutcome {
    /// Resolved value, `None` for `undefined`.
    pub data: Option<Value>,
    /// Failure, if any.
    pub error: Option<ErrorInfo>,
    /// Console output.
    pub logs: Vec<LogEntry>,
}

impl InvocationOutcome {
    fn failed(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// How one evaluation phase ended.
enum Phase {
    Completed,
    LoadFailed(CoreError),
    Failed(CoreError),
    Stalled,
    TimedOut,
}

/// Run one invocation inside a fresh runtime.
///
/// Guest failures are returned in [`InvocationOutcome::error`]; `Err` means
/// the host could not run the invocation at all.
pub(crate) async fn run_invocation(
    runtime: &mut JsRuntime,
    signals: &ContextSignals,
    invocation: Invocation,
) -> Result<InvocationOutcome, SandboxError> {
    let Invocation {
        code,
        input,
        fetcher,
        limits,
        module_timeout,
        timeout,
        max_output_size,
    } = invocation;
    let token = Uuid::new_v4().to_string();

    {
        let op_state = runtime.op_state();
        let mut st = op_state.borrow_mut();
        st.put(ConsoleBuffer::new(limits.max_log_entries));
        st.put(FetchLimits {
            max_calls: limits.max_fetch_calls,
            max_body_size: limits.max_fetch_body_size,
            calls_made: 0,
        });
        st.put(ResponseBodies::default());
        st.put(TimeoutRegistry::new(limits.max_timers));
        st.put::<Arc<dyn Fetcher>>(fetcher);
        st.put(InvocationToken(token.clone()));
        st.put(input);
    }

    runtime
        .execute_script(BOOTSTRAP_NAME, BOOTSTRAP)
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("runtime shim failed: {e}")))?;

    let isolate = runtime.v8_isolate().thread_safe_handle();
    let guest = specifier(GUEST_SPECIFIER)?;
    let entry = specifier(ENTRY_SPECIFIER)?;

    let module = evaluate(runtime, &isolate, module_timeout, &guest, code, false).await;
    let mut outcome = match classify(signals, module, module_timeout, true)? {
        Some(failed) => failed,
        None => {
            let handler = evaluate(
                runtime,
                &isolate,
                timeout,
                &entry,
                entry_module(&token),
                true,
            )
            .await;
            match classify(signals, handler, timeout, false)? {
                Some(failed) => failed,
                None => settle(runtime, max_output_size)?,
            }
        }
    };

    let op_state = runtime.op_state();
    let mut st = op_state.borrow_mut();
    if let Some(timers) = st.try_borrow_mut::<TimeoutRegistry>() {
        let cancelled = timers.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled pending timers");
        }
    }
    if let Some(bodies) = st.try_borrow_mut::<ResponseBodies>() {
        bodies.0.drain().for_each(drop);
    }
    if let Some(console) = st.try_take::<ConsoleBuffer>() {
        if console.dropped > 0 {
            tracing::debug!(dropped = console.dropped, "console entries dropped");
        }
        outcome.logs = console.entries;
    }
    Ok(outcome)
}

fn specifier(raw: &str) -> Result<ModuleSpecifier, SandboxError> {
    ModuleSpecifier::parse(raw)
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bad module specifier {raw}: {e}")))
}

/// Load a module from code and evaluate it under `budget`.
///
/// The watchdog interrupts CPU-bound code; the async deadline covers guests
/// waiting on timers or the network.
async fn evaluate(
    runtime: &mut JsRuntime,
    isolate: &v8::IsolateHandle,
    budget: Duration,
    specifier: &ModuleSpecifier,
    code: String,
    main: bool,
) -> Phase {
    let watchdog = Watchdog::arm(isolate.clone(), budget);
    let result = tokio::time::timeout(budget, async {
        let loaded = if main {
            runtime.load_main_es_module_from_code(specifier, code).await
        } else {
            runtime.load_side_es_module_from_code(specifier, code).await
        };
        let id = match loaded {
            Ok(id) => id,
            Err(e) => return Phase::LoadFailed(e),
        };
        let eval = runtime.mod_evaluate(id);
        match drive(runtime, eval).await {
            Phase::Completed if main => await_settlement(runtime).await,
            phase => phase,
        }
    })
    .await;
    let fired = watchdog.disarm();

    match result {
        _ if fired => Phase::TimedOut,
        Err(_) => Phase::TimedOut,
        Ok(phase) => phase,
    }
}

/// Poll the event loop until module evaluation `eval` settles.
async fn drive(
    runtime: &mut JsRuntime,
    eval: impl Future<Output = Result<(), CoreError>>,
) -> Phase {
    let mut eval = std::pin::pin!(eval);
    poll_fn(|cx| {
        if let Poll::Ready(result) = eval.as_mut().poll(cx) {
            return Poll::Ready(settled(result));
        }
        match runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
            Poll::Ready(Err(e)) => Poll::Ready(Phase::Failed(e)),
            Poll::Ready(Ok(())) => match eval.as_mut().poll(cx) {
                Poll::Ready(result) => Poll::Ready(settled(result)),
                Poll::Pending => Poll::Ready(Phase::Stalled),
            },
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Poll the event loop until the entry module records a [`Settlement`].
///
/// The entry module does not await the handler at top level, so its own
/// evaluation finishes right away. Returns [`Phase::Stalled`] when the loop
/// goes idle with no settlement: nothing is left that could ever produce one.
async fn await_settlement(runtime: &mut JsRuntime) -> Phase {
    poll_fn(|cx| {
        if has_settlement(runtime) {
            return Poll::Ready(Phase::Completed);
        }
        match runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
            Poll::Ready(Err(e)) => Poll::Ready(Phase::Failed(e)),
            Poll::Ready(Ok(())) if has_settlement(runtime) => Poll::Ready(Phase::Completed),
            Poll::Ready(Ok(())) => Poll::Ready(Phase::Stalled),
            Poll::Pending if has_settlement(runtime) => Poll::Ready(Phase::Completed),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

fn has_settlement(runtime: &mut JsRuntime) -> bool {
    runtime.op_state().borrow().has::<Settlement>()
}

fn settled(result: Result<(), CoreError>) -> Phase {
    match result {
        Ok(()) => Phase::Completed,
        Err(e) => Phase::Failed(e),
    }
}

/// Turn a phase result into a final outcome, or `None` to carry on.
fn classify(
    signals: &ContextSignals,
    phase: Phase,
    budget: Duration,
    module: bool,
) -> Result<Option<InvocationOutcome>, SandboxError> {
    if signals.heap_exceeded.load(Ordering::SeqCst) {
        tracing::warn!("context exceeded its heap limit");
        return Ok(Some(InvocationOutcome::failed(ErrorInfo::new(
            ErrorKind::OutOfMemory,
            "script exceeded the memory limit",
        ))));
    }
    if signals.disposed.load(Ordering::SeqCst) {
        return Err(SandboxError::ContextDisposed);
    }

    let what = if module { "module evaluation" } else { "handler" };
    let error = match phase {
        Phase::Completed => return Ok(None),
        Phase::TimedOut => ErrorInfo::new(
            ErrorKind::Timeout,
            format!("{what} timed out after {}ms", budget.as_millis()),
        ),
        Phase::Stalled => ErrorInfo::new(
            ErrorKind::Timeout,
            format!("{what} is waiting on a promise that can never settle"),
        ),
        Phase::LoadFailed(e) if module => {
            let (message, _) = split_js_error(&e.to_string());
            ErrorInfo::new(ErrorKind::CompileError, message)
        }
        Phase::LoadFailed(e) | Phase::Failed(e) => {
            let (message, stack) = split_js_error(&e.to_string());
            ErrorInfo::new(ErrorKind::RuntimeError, message).with_stack(stack)
        }
    };
    tracing::debug!(kind = %error.kind, "{what} failed");
    Ok(Some(InvocationOutcome::failed(error)))
}

/// Read the handler's settlement envelope out of the op state.
fn settle(runtime: &mut JsRuntime, max_output_size: usize) -> Result<InvocationOutcome, SandboxError> {
    let settlement = runtime.op_state().borrow_mut().try_take::<Settlement>();
    let Some(Settlement(raw)) = settlement else {
        return Ok(InvocationOutcome::failed(ErrorInfo::new(
            ErrorKind::RuntimeError,
            "handler finished without producing a result",
        )));
    };

    if raw.len() > max_output_size {
        tracing::warn!(size = raw.len(), max = max_output_size, "result too large");
        return Ok(InvocationOutcome::failed(ErrorInfo::new(
            ErrorKind::RuntimeError,
            format!(
                "result exceeds maximum output size of {max_output_size} bytes (got {})",
                raw.len()
            ),
        )));
    }

    let envelope: Value = serde_json::from_str(&raw)?;
    if let Some(error) = envelope.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let stack = error
            .get("stack")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(InvocationOutcome::failed(
            ErrorInfo::new(ErrorKind::RuntimeError, message).with_stack(stack),
        ));
    }

    Ok(InvocationOutcome {
        data: envelope.get("ok").cloned(),
        ..Default::default()
    })
}

/// Split engine error text into a bare message and the stack lines.
///
/// `Uncaught (in promise) TypeError: x is not a function\n    at ...`
/// becomes `x is not a function` plus the `at` lines.
fn split_js_error(text: &str) -> (String, Option<String>) {
    let (head, rest) = text.split_once('\n').unwrap_or((text, ""));
    let mut message = head.trim();
    for prefix in ["Uncaught (in promise) ", "Uncaught "] {
        if let Some(stripped) = message.strip_prefix(prefix) {
            message = stripped;
            break;
        }
    }
    if let Some((name, tail)) = message.split_once(": ") {
        if name.ends_with("Error") && name.chars().all(|c| c.is_ascii_alphanumeric()) {
            message = tail;
        }
    }
    let stack = rest.trim_end();
    (
        message.to_string(),
        (!stack.is_empty()).then(|| stack.to_string()),
    )
}

/// Runs guest scripts. `Send + Sync`; share it behind an `Arc`.
pub struct SandboxExecutor {
    config: SandboxConfig,
    manager: Arc<IsolateManager>,
    fetcher: Arc<dyn Fetcher>,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    /// Start the engine and build the default HTTP fetcher.
    ///
    /// Fails with [`SandboxError::EngineUnavailable`] if the engine cannot
    /// start.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let manager = IsolateManager::with_warm_contexts(
            config.max_heap_size,
            config.max_concurrent,
            config.warm_contexts,
        )?;
        let fetcher = HttpFetcher::new(config.network.clone()).map_err(|e| {
            SandboxError::EngineUnavailable {
                reason: format!("failed to build HTTP client: {e}"),
            }
        })?;
        Ok(Self {
            config,
            manager: Arc::new(manager),
            fetcher: Arc::new(fetcher),
            audit_logger: Arc::new(NoopAuditLogger),
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }

    /// Replace the fetcher behind guest `fetch()`.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Emit one audit entry per execution to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// Share an existing isolate manager.
    pub fn with_manager(mut self, manager: Arc<IsolateManager>) -> Self {
        self.manager = manager;
        self
    }

    /// Record executions into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The isolate manager backing this executor.
    pub fn manager(&self) -> &Arc<IsolateManager> {
        &self.manager
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `request` with the configured default timeout.
    pub async fn execute_default(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        self.execute(request, self.config.timeout).await
    }

    /// Run one script invocation.
    ///
    /// Guest failures come back as `Ok` with [`ExecutionResult::error`] set,
    /// along with whatever logs and trace were gathered. `Err` is reserved
    /// for host failures.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let audit = AuditEntryBuilder::new(&request.source);
        let started = Instant::now();
        tracing::info!(
            execution_id = audit.execution_id(),
            source_len = request.source.len(),
            timeout_ms = timeout.as_millis() as u64,
            "execution started"
        );

        let result = self.execute_inner(request, timeout).await;

        let entry = audit.finish(&result);
        self.audit_logger.log(&entry).await;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(entry.outcome.label(), started.elapsed().as_secs_f64());
            metrics.set_contexts_live(self.manager.live_contexts());
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(res) => match &res.error {
                None => tracing::info!(
                    execution_id = %entry.execution_id,
                    duration_ms,
                    logs = res.logs.len(),
                    fetches = res.network_trace.len(),
                    "execution complete"
                ),
                Some(err) => tracing::info!(
                    execution_id = %entry.execution_id,
                    duration_ms,
                    kind = %err.kind,
                    "execution failed"
                ),
            },
            Err(e) => tracing::warn!(
                execution_id = %entry.execution_id,
                duration_ms,
                error = %e,
                "execution aborted by host failure"
            ),
        }

        result
    }

    async fn execute_inner(
        &self,
        request: ExecutionRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let ExecutionRequest {
            source,
            params,
            secrets,
        } = request;

        let compiled = match validate_source(&source, self.config.max_source_size)
            .and_then(|()| compile(&source))
        {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::debug!(error = %e, "compile failed");
                return Ok(ExecutionResult::failure(e.into()));
            }
        };

        let redactor = if self.config.redact_secrets {
            SecretRedactor::new(&secrets)
        } else {
            SecretRedactor::default()
        };

        let context = self.manager.create_context().await?;

        let (trace_tx, mut trace_rx) = mpsc::unbounded_channel();
        let fetcher: Arc<dyn Fetcher> = Arc::new(InstrumentedFetcher::new(
            Arc::new(HostLoopFetcher::new(
                Arc::clone(&self.fetcher),
                tokio::runtime::Handle::current(),
            )),
            trace_tx,
        ));

        let invocation = Invocation {
            code: compiled.code,
            input: InvocationInput { params, secrets },
            fetcher,
            limits: BridgeLimits::from(&self.config),
            module_timeout: self.config.module_timeout,
            timeout,
            max_output_size: self.config.max_output_size,
        };

        let outcome = context.run(invocation).await;
        context.dispose();
        let outcome = outcome?;

        let mut records = Vec::new();
        while let Ok(record) = trace_rx.try_recv() {
            records.push(record);
        }
        records.sort_by_key(|r| r.seq);

        let mut result = ExecutionResult {
            data: outcome.data,
            error: outcome.error,
            logs: outcome.logs,
            network_trace: records.into_iter().map(|r| r.entry).collect(),
        };
        if !redactor.is_empty() {
            redactor.redact_logs(&mut result.logs);
            redactor.redact_trace(&mut result.network_trace);
        }
        Ok(result)
    }
}
