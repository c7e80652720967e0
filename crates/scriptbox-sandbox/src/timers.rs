//! Host-side timer registry backing guest `setTimeout` / `clearTimeout`.
//!
//! A guest timer is a [`HandleId`] plus a cancellation channel. The guest
//! awaits `op_sandbox_timer_wait(id)`, which resolves `true` when the deadline
//! passes and `false` when the timer was cleared or the context was torn down.
//! Dropping an entry drops its sender, so every cancellation path is the same.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::marshal::{HandleId, HandleTable};

/// Largest delay accepted, matching the browser `setTimeout` ceiling.
pub const MAX_DELAY_MS: f64 = 2_147_483_647.0;

/// A scheduled timer that has not fired or been cleared.
#[derive(Debug)]
struct PendingTimer {
    deadline: Instant,
    cancel: oneshot::Sender<()>,
    cancelled: Option<oneshot::Receiver<()>>,
}

/// A timer armed for waiting. Resolves once, to `true` if it fired.
#[derive(Debug)]
pub struct TimerWait {
    deadline: Instant,
    cancelled: oneshot::Receiver<()>,
}

impl TimerWait {
    /// Wait for the deadline or for cancellation, whichever comes first.
    pub async fn wait(self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancelled => false,
            _ = tokio::time::sleep_until(self.deadline) => true,
        }
    }
}

/// Timer limit exceeded.
#[derive(Debug, thiserror::Error)]
#[error("too many pending timers (max {max})")]
pub struct TimerLimitExceeded {
    /// Maximum pending timers per invocation.
    pub max: usize,
}

/// Per-invocation map of pending timers.
#[derive(Debug)]
pub struct TimeoutRegistry {
    timers: HandleTable<PendingTimer>,
    max_pending: usize,
}

impl TimeoutRegistry {
    /// Create a registry that allows at most `max_pending` live timers.
    pub fn new(max_pending: usize) -> Self {
        Self {
            timers: HandleTable::default(),
            max_pending,
        }
    }

    /// Schedule a timer `delay_ms` from now. Non-finite or negative delays are zero.
    pub fn start(&mut self, delay_ms: f64) -> Result<HandleId, TimerLimitExceeded> {
        if self.timers.len() >= self.max_pending {
            return Err(TimerLimitExceeded {
                max: self.max_pending,
            });
        }
        let delay = if delay_ms.is_finite() {
            delay_ms.clamp(0.0, MAX_DELAY_MS)
        } else {
            0.0
        };
        let (cancel, cancelled) = oneshot::channel();
        Ok(self.timers.insert(PendingTimer {
            deadline: Instant::now() + Duration::from_millis(delay as u64),
            cancel,
            cancelled: Some(cancelled),
        }))
    }

    /// Hand out the waiter for a timer. `None` if it was already cleared or armed.
    pub fn arm(&mut self, id: HandleId) -> Option<TimerWait> {
        let timer = self.timers.get_mut(id)?;
        let cancelled = timer.cancelled.take()?;
        Some(TimerWait {
            deadline: timer.deadline,
            cancelled,
        })
    }

    /// Forget a timer after it fired.
    pub fn finish(&mut self, id: HandleId) {
        self.timers.remove(id);
    }

    /// Cancel a pending timer. Clearing an unknown or fired timer is a no-op.
    pub fn clear(&mut self, id: HandleId) -> bool {
        match self.timers.take(id) {
            Ok(timer) => {
                let _ = timer.cancel.send(());
                true
            }
            Err(_) => false,
        }
    }

    /// Cancel every pending timer, returning how many there were.
    pub fn cancel_all(&mut self) -> usize {
        let mut count = 0;
        for timer in self.timers.drain() {
            let _ = timer.cancel.send(());
            count += 1;
        }
        count
    }

    /// Number of timers that have neither fired nor been cleared.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_deadline() {
        let mut reg = TimeoutRegistry::new(10);
        let id = reg.start(25.0).unwrap();
        let wait = reg.arm(id).unwrap();
        let started = Instant::now();
        assert!(wait.wait().await);
        assert!(started.elapsed() >= Duration::from_millis(25));
        reg.finish(id);
        assert_eq!(reg.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timer_resolves_false() {
        let mut reg = TimeoutRegistry::new(10);
        let id = reg.start(1_000.0).unwrap();
        let wait = reg.arm(id).unwrap();
        assert!(reg.clear(id));
        assert!(!wait.wait().await);
    }

    #[tokio::test]
    async fn clear_before_arm_prevents_waiting() {
        let mut reg = TimeoutRegistry::new(10);
        let id = reg.start(5.0).unwrap();
        assert!(reg.clear(id));
        assert!(reg.arm(id).is_none());
    }

    #[test]
    fn clear_after_fire_is_noop() {
        let mut reg = TimeoutRegistry::new(10);
        let id = reg.start(0.0).unwrap();
        reg.finish(id);
        assert!(!reg.clear(id));
        assert!(!reg.clear(HandleId(999)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_releases_every_waiter() {
        let mut reg = TimeoutRegistry::new(10);
        let waits: Vec<_> = (0..3)
            .map(|_| {
                let id = reg.start(60_000.0).unwrap();
                reg.arm(id).unwrap()
            })
            .collect();
        assert_eq!(reg.cancel_all(), 3);
        for wait in waits {
            assert!(!wait.wait().await);
        }
    }

    #[test]
    fn pending_limit_is_enforced() {
        let mut reg = TimeoutRegistry::new(2);
        reg.start(10.0).unwrap();
        reg.start(10.0).unwrap();
        let err = reg.start(10.0).unwrap_err();
        assert_eq!(err.max, 2);
    }

    #[test]
    fn nonsense_delays_are_clamped() {
        let mut reg = TimeoutRegistry::new(4);
        assert!(reg.start(f64::NAN).is_ok());
        assert!(reg.start(-50.0).is_ok());
        assert!(reg.start(f64::INFINITY).is_ok());
    }
}
