//! Isolate lifecycle manager.
//!
//! The [`IsolateManager`] is created once per host process. It warms up the
//! V8 platform, hands out execution contexts under a concurrency limit, and
//! keeps a registry of live contexts so they can all be terminated at
//! shutdown.
//!
//! A [`Context`] is one fresh `JsRuntime` with its own heap and global scope.
//! V8 handles are `!Send`, so each context lives on a dedicated OS thread
//! running a single-threaded tokio runtime. The public API is fully async and
//! `Send`-safe. A context runs at most one invocation and is never reused.
//!
//! Building a runtime is the expensive step, so the manager keeps a few
//! contexts built ahead of demand. Handing one out is a queue pop; the
//! replacement is built in the background.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deno_core::{v8, JsRuntime, RuntimeOptions};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::allocator::{bounded_allocator, BufferBudget};
use crate::error::SandboxError;
use crate::executor::{run_invocation, Invocation, InvocationOutcome};
use crate::loader::ClosedModuleLoader;
use crate::ops::scriptbox_ext;

/// Extra heap granted once the limit is hit, so termination can unwind.
const HEAP_GRACE: usize = 1024 * 1024;

/// Attempts made to construct a context before giving up.
const CONSTRUCT_ATTEMPTS: usize = 2;

/// Contexts kept built ahead of demand unless configured otherwise.
pub const DEFAULT_WARM_CONTEXTS: usize = 2;

type Registry = Arc<Mutex<HashMap<u64, v8::IsolateHandle>>>;
type WarmPool = Arc<Mutex<VecDeque<ContextParts>>>;
type Reply = oneshot::Sender<Result<InvocationOutcome, SandboxError>>;

/// What a claimed context thread is told to do. The permit rides along so
/// it is released only after the runtime is gone.
enum Command {
    Run(Invocation, Reply),
    Release,
}

type Job = (Command, OwnedSemaphorePermit);

/// Flags shared between a context's thread and its owners.
#[derive(Debug, Default)]
pub struct ContextSignals {
    /// Set by the near-heap-limit callback or the buffer allocator.
    pub heap_exceeded: AtomicBool,
    /// Set when the owner disposed the context.
    pub disposed: AtomicBool,
}

/// Process-wide owner of engine resources.
pub struct IsolateManager {
    max_heap_size: usize,
    max_concurrent: usize,
    warm_target: usize,
    permits: Arc<Semaphore>,
    live: Registry,
    warm: WarmPool,
    warming: Arc<AtomicUsize>,
    shut_down: AtomicBool,
    next_id: AtomicU64,
}

impl std::fmt::Debug for IsolateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateManager")
            .field("max_heap_size", &self.max_heap_size)
            .field("max_concurrent", &self.max_concurrent)
            .field("live_contexts", &self.live_contexts())
            .field("warm_contexts", &self.warm_contexts())
            .finish()
    }
}

impl IsolateManager {
    /// Initialize the engine and verify a context can be built.
    ///
    /// Fails with [`SandboxError::EngineUnavailable`] when the engine cannot
    /// start, so a broken host is detected at startup rather than on the
    /// first request.
    pub fn new(max_heap_size: usize, max_concurrent: usize) -> Result<Self, SandboxError> {
        Self::with_warm_contexts(max_heap_size, max_concurrent, DEFAULT_WARM_CONTEXTS)
    }

    /// Like [`IsolateManager::new`], keeping up to `warm_contexts` contexts
    /// built ahead of demand (never more than `max_concurrent`).
    pub fn with_warm_contexts(
        max_heap_size: usize,
        max_concurrent: usize,
        warm_contexts: usize,
    ) -> Result<Self, SandboxError> {
        let probe = std::thread::Builder::new()
            .name("scriptbox-probe".into())
            .spawn(move || build_runtime(max_heap_size, &Arc::default()).map(drop))
            .map_err(|e| SandboxError::EngineUnavailable {
                reason: format!("failed to spawn probe thread: {e}"),
            })?;
        match probe.join() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(SandboxError::EngineUnavailable { reason }),
            Err(_) => {
                return Err(SandboxError::EngineUnavailable {
                    reason: "engine probe panicked".into(),
                })
            }
        }

        let warm_target = warm_contexts.min(max_concurrent);
        tracing::info!(max_heap_size, max_concurrent, warm_target, "script engine initialized");

        let manager = Self {
            max_heap_size,
            max_concurrent,
            warm_target,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            live: Arc::default(),
            warm: Arc::default(),
            warming: Arc::default(),
            shut_down: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        };
        manager.replenish();
        Ok(manager)
    }

    /// Create a fresh context. Fails fast when every permit is taken.
    pub async fn create_context(&self) -> Result<Context, SandboxError> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => SandboxError::EngineUnavailable {
                    reason: "isolate manager has been shut down".into(),
                },
                TryAcquireError::NoPermits => {
                    tracing::warn!(max = self.max_concurrent, "context concurrency limit reached");
                    SandboxError::ConcurrencyLimit {
                        max: self.max_concurrent,
                    }
                }
            })?;

        let parts = match self.take_warm() {
            Some(parts) => parts,
            None => self.construct().await?,
        };
        self.replenish();
        Ok(self.claim(parts, permit))
    }

    fn take_warm(&self) -> Option<ContextParts> {
        let mut pool = self.warm.lock().ok()?;
        while let Some(parts) = pool.pop_front() {
            if !parts.job.is_closed() {
                return Some(parts);
            }
        }
        None
    }

    async fn construct(&self) -> Result<ContextParts, SandboxError> {
        let mut last_reason = String::new();
        for attempt in 1..=CONSTRUCT_ATTEMPTS {
            let (ready_tx, ready_rx) = oneshot::channel();
            let outcome = match self.spawn_thread(Ready::Caller(ready_tx)) {
                Ok(()) => match ready_rx.await {
                    Ok(result) => result,
                    Err(_) => Err("context thread panicked during construction".into()),
                },
                Err(reason) => Err(reason),
            };
            match outcome {
                Ok(parts) => return Ok(parts),
                Err(reason) => {
                    tracing::warn!(attempt, reason = %reason, "context construction failed");
                    last_reason = reason;
                }
            }
        }
        Err(SandboxError::EngineUnavailable {
            reason: last_reason,
        })
    }

    /// Start building contexts until the warm pool is back at its target.
    fn replenish(&self) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let queued = self.warm.lock().map(|pool| pool.len()).unwrap_or(0);
        let building = self.warming.load(Ordering::SeqCst);
        for _ in (queued + building)..self.warm_target {
            self.warming.fetch_add(1, Ordering::SeqCst);
            let ready = Ready::Pool(Arc::clone(&self.warm), Arc::clone(&self.warming));
            if let Err(reason) = self.spawn_thread(ready) {
                self.warming.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(reason = %reason, "failed to warm a context");
                break;
            }
        }
    }

    fn spawn_thread(&self, ready: Ready) -> Result<(), String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let max_heap_size = self.max_heap_size;
        let live = Arc::clone(&self.live);
        std::thread::Builder::new()
            .name(format!("scriptbox-ctx-{id}"))
            .spawn(move || context_thread(id, max_heap_size, live, ready))
            .map(drop)
            .map_err(|e| format!("failed to spawn context thread: {e}"))
    }

    fn claim(&self, parts: ContextParts, permit: OwnedSemaphorePermit) -> Context {
        if let Ok(mut map) = self.live.lock() {
            map.insert(parts.id, parts.isolate.clone());
        }
        Context {
            id: parts.id,
            job: Mutex::new(Some((parts.job, permit))),
            isolate: parts.isolate,
            signals: parts.signals,
        }
    }

    /// Contexts handed out whose runtime has not yet been dropped.
    pub fn live_contexts(&self) -> usize {
        self.live.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Contexts built and waiting to be handed out.
    pub fn warm_contexts(&self) -> usize {
        self.warm.lock().map(|pool| pool.len()).unwrap_or(0)
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Heap ceiling applied to each context.
    pub fn max_heap_size(&self) -> usize {
        self.max_heap_size
    }

    /// Terminate every live context and refuse new ones.
    ///
    /// Returns how many contexts were terminated.
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::SeqCst);
        self.permits.close();
        if let Ok(mut pool) = self.warm.lock() {
            pool.clear();
        }
        let handles: Vec<v8::IsolateHandle> = match self.live.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return 0,
        };
        for handle in &handles {
            handle.terminate_execution();
        }
        tracing::info!(terminated = handles.len(), "isolate manager shut down");
        handles.len()
    }
}

struct ContextParts {
    id: u64,
    job: oneshot::Sender<Job>,
    isolate: v8::IsolateHandle,
    signals: Arc<ContextSignals>,
}

/// Where a freshly built context is delivered.
enum Ready {
    Caller(oneshot::Sender<Result<ContextParts, String>>),
    Pool(WarmPool, Arc<AtomicUsize>),
}

impl Ready {
    fn deliver(self, built: Result<ContextParts, String>) {
        match self {
            Ready::Caller(tx) => {
                let _ = tx.send(built);
            }
            Ready::Pool(pool, warming) => {
                match built {
                    Ok(parts) => {
                        if let Ok(mut pool) = pool.lock() {
                            pool.push_back(parts);
                        }
                    }
                    Err(reason) => tracing::warn!(reason = %reason, "failed to warm a context"),
                }
                warming.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// One isolated execution context.
///
/// Dropping the context disposes it.
pub struct Context {
    id: u64,
    job: Mutex<Option<(oneshot::Sender<Job>, OwnedSemaphorePermit)>>,
    isolate: v8::IsolateHandle,
    signals: Arc<ContextSignals>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Context {
    /// Registry id of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run one invocation. A context accepts exactly one.
    ///
    /// Resolves after the context's runtime has been torn down.
    pub async fn run(&self, invocation: Invocation) -> Result<InvocationOutcome, SandboxError> {
        let (sender, permit) = self
            .job
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(SandboxError::ContextDisposed)?;
        if self.is_disposed() {
            return Err(SandboxError::ContextDisposed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send((Command::Run(invocation, reply_tx), permit))
            .map_err(|_| SandboxError::ContextDisposed)?;

        reply_rx
            .await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("context thread panicked")))?
    }

    /// Terminate any running guest code and release the context.
    ///
    /// Idempotent.
    pub fn dispose(&self) {
        if self.signals.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.isolate.terminate_execution();
        // An unused context still holds its permit; hand it to the thread so
        // it is released after teardown.
        if let Some((sender, permit)) = self.job.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = sender.send((Command::Release, permit));
        }
        tracing::debug!(context = self.id, "context disposed");
    }

    /// Whether [`Context::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.signals.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn context_thread(id: u64, max_heap_size: usize, live: Registry, ready: Ready) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            ready.deliver(Err(format!("failed to build context runtime: {e}")));
            return;
        }
    };

    let signals = Arc::new(ContextSignals::default());
    let mut runtime = match build_runtime(max_heap_size, &signals) {
        Ok(runtime) => runtime,
        Err(reason) => {
            ready.deliver(Err(reason));
            return;
        }
    };

    let (job_tx, job_rx) = oneshot::channel::<Job>();
    ready.deliver(Ok(ContextParts {
        id,
        job: job_tx,
        isolate: runtime.v8_isolate().thread_safe_handle(),
        signals: Arc::clone(&signals),
    }));

    // An error here means the context was dropped unclaimed.
    let (outcome, permit) = match rt.block_on(job_rx) {
        Ok((Command::Run(invocation, reply), permit)) => {
            let result = rt.block_on(run_invocation(&mut runtime, &signals, invocation));
            (Some((result, reply)), Some(permit))
        }
        Ok((Command::Release, permit)) => (None, Some(permit)),
        Err(_) => (None, None),
    };

    // Teardown happens before the reply so callers observe a released context.
    {
        let _enter = rt.enter();
        drop(runtime);
    }
    if let Ok(mut map) = live.lock() {
        map.remove(&id);
    }
    drop(permit);

    if let Some((result, reply)) = outcome {
        if reply.send(result).is_err() {
            tracing::warn!(context = id, "invocation receiver dropped before result was sent");
        }
    }
}

fn build_runtime(max_heap_size: usize, signals: &Arc<ContextSignals>) -> Result<JsRuntime, String> {
    let budget = BufferBudget::new(max_heap_size, Arc::clone(signals));
    let create_params = v8::CreateParams::default()
        .heap_limits(0, max_heap_size)
        .array_buffer_allocator(bounded_allocator(&budget));

    let built = std::panic::catch_unwind(AssertUnwindSafe(|| {
        JsRuntime::try_new(RuntimeOptions {
            extensions: vec![scriptbox_ext::init()],
            module_loader: Some(Rc::new(ClosedModuleLoader)),
            create_params: Some(create_params),
            ..Default::default()
        })
    }));
    let mut runtime = match built {
        Ok(Ok(runtime)) => runtime,
        Ok(Err(e)) => return Err(format!("failed to create runtime: {e}")),
        Err(_) => return Err("runtime construction panicked".into()),
    };

    let handle = runtime.v8_isolate().thread_safe_handle();
    budget.attach(handle.clone());
    let signals = Arc::clone(signals);
    runtime.add_near_heap_limit_callback(move |current_limit, _initial_limit| {
        if !signals.heap_exceeded.swap(true, Ordering::SeqCst) {
            handle.terminate_execution();
        }
        current_limit + HEAP_GRACE
    });

    Ok(runtime)
}

/// Terminates a context's guest code if a phase overruns its budget.
///
/// Covers CPU-bound loops that never yield to the event loop, which an async
/// timeout alone cannot interrupt.
pub struct Watchdog {
    cancel: std::sync::mpsc::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    /// Start a watchdog that terminates `isolate` after `budget`.
    pub fn arm(isolate: v8::IsolateHandle, budget: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let (cancel, cancel_rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(budget)
            {
                flag.store(true, Ordering::SeqCst);
                isolate.terminate_execution();
            }
        });
        Self {
            cancel,
            thread: Some(thread),
            fired,
        }
    }

    /// Stop the watchdog and report whether it fired.
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        let _ = self.cancel.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn contexts_are_limited_and_released() {
        let manager = IsolateManager::new(64 * 1024 * 1024, 1).unwrap();
        let first = manager.create_context().await.unwrap();
        assert_eq!(manager.available_permits(), 0);

        let err = manager.create_context().await.unwrap_err();
        assert!(matches!(err, SandboxError::ConcurrencyLimit { max: 1 }));

        first.dispose();
        drop(first);
        // The idle thread tears down asynchronously once its job sender is gone.
        for _ in 0..200 {
            if manager.available_permits() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.available_permits(), 1);
        assert_eq!(manager.live_contexts(), 0);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let manager = IsolateManager::new(64 * 1024 * 1024, 2).unwrap();
        let ctx = manager.create_context().await.unwrap();
        ctx.dispose();
        ctx.dispose();
        assert!(ctx.is_disposed());
    }

    async fn wait_for_warm(manager: &IsolateManager, expected: usize) {
        for _ in 0..500 {
            if manager.warm_contexts() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.warm_contexts(), expected);
    }

    #[tokio::test]
    async fn warm_contexts_are_handed_out_and_replaced() {
        let manager = IsolateManager::with_warm_contexts(64 * 1024 * 1024, 4, 1).unwrap();
        wait_for_warm(&manager, 1).await;
        assert_eq!(manager.live_contexts(), 0);

        let ctx = manager.create_context().await.unwrap();
        assert_eq!(manager.live_contexts(), 1);
        wait_for_warm(&manager, 1).await;

        drop(ctx);
        for _ in 0..200 {
            if manager.live_contexts() == 0 && manager.available_permits() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.live_contexts(), 0);
        assert_eq!(manager.available_permits(), 4);
    }

    #[tokio::test]
    async fn warm_pool_never_exceeds_the_concurrency_limit() {
        let manager = IsolateManager::with_warm_contexts(64 * 1024 * 1024, 1, 8).unwrap();
        wait_for_warm(&manager, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.warm_contexts(), 1);
    }

    #[tokio::test]
    async fn shutdown_drops_warm_contexts() {
        let manager = IsolateManager::with_warm_contexts(64 * 1024 * 1024, 2, 2).unwrap();
        wait_for_warm(&manager, 2).await;
        manager.shutdown();
        assert_eq!(manager.warm_contexts(), 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_contexts() {
        let manager = IsolateManager::new(64 * 1024 * 1024, 2).unwrap();
        manager.shutdown();
        let err = manager.create_context().await.unwrap_err();
        assert!(matches!(err, SandboxError::EngineUnavailable { .. }), "{err}");
    }
}
