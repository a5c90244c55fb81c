//! A single orchestrator-level cancellation flag, observed by every
//! listener and handler worker (§5, §9).
//!
//! This is the device that avoids the canonical deadlock described in
//! the design notes: a worker never blocks indefinitely on a mutex held
//! by `stop`, because `stop` never holds a lock while waiting on I/O —
//! it only ever flips this flag and then joins threads with a timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared between the orchestrator and every worker it owns. Cheap to
/// clone; clones observe the same underlying state.
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    cancelled: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            forced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal every worker watching this flag to stop. Idempotent.
    pub fn cancel(&self, force: bool) {
        self.cancelled.store(true, Ordering::SeqCst);
        if force {
            self.forced.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Resets the flag so the same handle can be reused across a
    /// stop/start cycle (`restart()`).
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.forced.store(false, Ordering::SeqCst);
    }
}

/// Polls `done` until it returns true or `deadline` elapses, sleeping
/// briefly between checks. Used by graceful `stop` to wait for workers to
/// drain before escalating to a forced close.
pub fn wait_until<F: Fn() -> bool>(done: F, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(poll.min(deadline.saturating_duration_since(Instant::now())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_cancelled());
        assert!(!flag.is_forced());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        flag.cancel(false);
        assert!(clone.is_cancelled());
        assert!(!clone.is_forced());
    }

    #[test]
    fn forced_cancel_sets_both_flags() {
        let flag = ShutdownFlag::new();
        flag.cancel(true);
        assert!(flag.is_cancelled());
        assert!(flag.is_forced());
    }

    #[test]
    fn reset_allows_reuse_across_restart() {
        let flag = ShutdownFlag::new();
        flag.cancel(true);
        flag.reset();
        assert!(!flag.is_cancelled());
        assert!(!flag.is_forced());
    }

    #[test]
    fn wait_until_returns_true_once_condition_flips() {
        let flag = ShutdownFlag::new();
        let flag2 = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag2.cancel(false);
        });
        let ok = wait_until(
            || flag.is_cancelled(),
            Duration::from_secs(1),
            Duration::from_millis(5),
        );
        assert!(ok);
    }

    #[test]
    fn wait_until_times_out_when_condition_never_true() {
        let ok = wait_until(|| false, Duration::from_millis(30), Duration::from_millis(5));
        assert!(!ok);
    }
}
