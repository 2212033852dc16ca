//! Counted activity signal used to wake the client thread.
//!
//! Semaphore semantics on top of a mutex and condvar: every packet-side
//! event that may have made a period available posts; the client waits with
//! a timeout. Posts are never lost, so a wait after a post returns at once.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Outcome of a wait on the activity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityResult {
    Activity,
    Timeout,
}

pub struct ActivitySignal {
    count: Mutex<u32>,
    cond: Condvar,
}

impl ActivitySignal {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Posts one unit of activity and wakes a waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        self.cond.notify_all();
    }

    /// Waits until activity was posted, up to `timeout`. Consumes one unit.
    pub fn wait(&self, timeout: Duration) -> ActivityResult {
        let mut count = self.count.lock();
        if *count == 0 {
            let deadline = std::time::Instant::now() + timeout;
            while *count == 0 {
                if self.cond.wait_until(&mut count, deadline).timed_out() {
                    if *count == 0 {
                        return ActivityResult::Timeout;
                    }
                    break;
                }
            }
        }
        *count -= 1;
        ActivityResult::Activity
    }

    /// Clears any pending activity.
    pub fn drain(&self) {
        *self.count.lock() = 0;
    }
}

impl Default for ActivitySignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_signal_then_wait() {
        let sig = ActivitySignal::new();
        sig.signal();
        assert_eq!(sig.wait(Duration::from_millis(10)), ActivityResult::Activity);
    }

    #[test]
    fn test_wait_times_out() {
        let sig = ActivitySignal::new();
        assert_eq!(sig.wait(Duration::from_millis(5)), ActivityResult::Timeout);
    }

    #[test]
    fn test_wakes_waiter_across_threads() {
        let sig = Arc::new(ActivitySignal::new());
        let sig2 = sig.clone();
        let waiter = std::thread::spawn(move || sig2.wait(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(10));
        sig.signal();
        assert_eq!(waiter.join().unwrap(), ActivityResult::Activity);
    }

    #[test]
    fn test_posts_accumulate() {
        let sig = ActivitySignal::new();
        sig.signal();
        sig.signal();
        assert_eq!(sig.wait(Duration::from_millis(1)), ActivityResult::Activity);
        assert_eq!(sig.wait(Duration::from_millis(1)), ActivityResult::Activity);
        assert_eq!(sig.wait(Duration::from_millis(1)), ActivityResult::Timeout);
    }
}
