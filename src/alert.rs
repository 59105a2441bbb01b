//! Process-wide alert flag shared by the alert feed and the Recorder.
//!
//! A single slot, not a queue: raising while an alert is already pending is a
//! no-op, and one `wait_and_clear` consumes whatever is pending.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct AlertSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl AlertSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an alert as pending. Returns `false` if one already was.
    pub fn raise(&self) -> bool {
        let mut pending = self.lock();
        if *pending {
            return false;
        }
        *pending = true;
        self.cond.notify_one();
        true
    }

    pub fn is_pending(&self) -> bool {
        *self.lock()
    }

    /// Block until an alert is pending, then clear it.
    pub fn wait_and_clear(&self) {
        let mut pending = self.lock();
        while !*pending {
            pending = self
                .cond
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *pending = false;
    }

    /// Like [`AlertSignal::wait_and_clear`] but gives up after `timeout`.
    /// Returns whether an alert was consumed.
    pub fn wait_and_clear_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.lock();
        while !*pending {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }
        *pending = false;
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn double_raise_coalesces_into_one_pending_alert() {
        let signal = AlertSignal::new();
        assert!(signal.raise());
        assert!(!signal.raise());
        assert!(signal.wait_and_clear_timeout(Duration::from_millis(10)));
        assert!(!signal.is_pending());
        assert!(!signal.wait_and_clear_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn waiter_wakes_on_raise_from_another_thread() {
        let signal = Arc::new(AlertSignal::new());
        let setter = Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.raise();
        });
        signal.wait_and_clear();
        handle.join().expect("setter thread");
        assert!(!signal.is_pending());
    }
}
