//! Bounded `ArrayBuffer` allocator.
//!
//! Typed array backing stores are allocated outside the V8 heap, so the heap
//! limit never sees them. Each context gets its own allocator that counts
//! live buffer bytes against the context's memory ceiling. An allocation past
//! the ceiling is refused, flags the context as out of memory and terminates
//! it, so the guest cannot catch the failure and carry on.

use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use deno_core::v8;

use crate::isolate::ContextSignals;

/// Matches the platform malloc alignment.
const ALIGN: usize = 16;

/// Byte accounting shared between a context and its allocator.
pub(crate) struct BufferBudget {
    used: AtomicUsize,
    limit: usize,
    signals: Arc<ContextSignals>,
    isolate: OnceLock<v8::IsolateHandle>,
}

impl BufferBudget {
    pub(crate) fn new(limit: usize, signals: Arc<ContextSignals>) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicUsize::new(0),
            limit,
            signals,
            isolate: OnceLock::new(),
        })
    }

    /// Bind the isolate to terminate once the budget is exhausted.
    pub(crate) fn attach(&self, isolate: v8::IsolateHandle) {
        let _ = self.isolate.set(isolate);
    }

    /// Bytes currently held by live buffers.
    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    fn allocate(&self, len: usize, zeroed: bool) -> *mut c_void {
        if len == 0 {
            return std::ptr::null_mut();
        }
        let prev = self.used.fetch_add(len, Ordering::SeqCst);
        if prev.saturating_add(len) > self.limit {
            self.used.fetch_sub(len, Ordering::SeqCst);
            self.exhausted(len);
            return std::ptr::null_mut();
        }
        let Ok(layout) = Layout::from_size_align(len, ALIGN) else {
            self.used.fetch_sub(len, Ordering::SeqCst);
            return std::ptr::null_mut();
        };
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe {
            if zeroed {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        if ptr.is_null() {
            self.used.fetch_sub(len, Ordering::SeqCst);
        }
        ptr.cast()
    }

    /// # Safety
    ///
    /// `data` must come from [`BufferBudget::allocate`] with the same `len`.
    unsafe fn free(&self, data: *mut c_void, len: usize) {
        if data.is_null() || len == 0 {
            return;
        }
        let Ok(layout) = Layout::from_size_align(len, ALIGN) else {
            return;
        };
        // SAFETY: upheld by the caller.
        unsafe { dealloc(data.cast(), layout) };
        self.used.fetch_sub(len, Ordering::SeqCst);
    }

    fn exhausted(&self, requested: usize) {
        if self.signals.heap_exceeded.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(
            requested,
            used = self.used(),
            limit = self.limit,
            "array buffer allocation exceeds the memory limit"
        );
        if let Some(isolate) = self.isolate.get() {
            isolate.terminate_execution();
        }
    }
}

unsafe extern "C" fn budget_allocate(budget: &Arc<BufferBudget>, len: usize) -> *mut c_void {
    budget.allocate(len, true)
}

unsafe extern "C" fn budget_allocate_uninitialized(
    budget: &Arc<BufferBudget>,
    len: usize,
) -> *mut c_void {
    budget.allocate(len, false)
}

unsafe extern "C" fn budget_free(budget: &Arc<BufferBudget>, data: *mut c_void, len: usize) {
    // SAFETY: V8 only frees buffers this allocator handed out, with their length.
    unsafe { budget.free(data, len) }
}

unsafe extern "C" fn budget_drop(budget: *const Arc<BufferBudget>) {
    // SAFETY: `budget` is the pointer leaked in `bounded_allocator`.
    drop(unsafe { Box::from_raw(budget as *mut Arc<BufferBudget>) });
}

static BUDGET_VTABLE: v8::RustAllocatorVtable<Arc<BufferBudget>> = v8::RustAllocatorVtable {
    allocate: budget_allocate,
    allocate_uninitialized: budget_allocate_uninitialized,
    free: budget_free,
    drop: budget_drop,
};

/// Build an `ArrayBuffer` allocator that draws from `budget`.
pub(crate) fn bounded_allocator(budget: &Arc<BufferBudget>) -> v8::UniqueRef<v8::Allocator> {
    let raw = Box::into_raw(Box::new(Arc::clone(budget)));
    // SAFETY: `raw` stays valid until V8 calls `budget_drop` on it.
    unsafe { v8::new_rust_allocator(raw, &BUDGET_VTABLE) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_counted_and_released() {
        let budget = BufferBudget::new(1024, Arc::default());
        let ptr = budget.allocate(512, true);
        assert!(!ptr.is_null());
        assert_eq!(budget.used(), 512);
        unsafe { budget.free(ptr, 512) };
        assert_eq!(budget.used(), 0);
        assert!(!budget.signals.heap_exceeded.load(Ordering::SeqCst));
    }

    #[test]
    fn allocation_past_the_limit_flags_the_context() {
        let signals = Arc::new(ContextSignals::default());
        let budget = BufferBudget::new(1024, Arc::clone(&signals));
        let kept = budget.allocate(800, false);
        assert!(!kept.is_null());

        assert!(budget.allocate(800, true).is_null());
        assert_eq!(budget.used(), 800);
        assert!(signals.heap_exceeded.load(Ordering::SeqCst));

        unsafe { budget.free(kept, 800) };
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn zero_length_allocations_are_not_failures() {
        let signals = Arc::new(ContextSignals::default());
        let budget = BufferBudget::new(0, Arc::clone(&signals));
        assert!(budget.allocate(0, true).is_null());
        assert!(!signals.heap_exceeded.load(Ordering::SeqCst));
    }
}
