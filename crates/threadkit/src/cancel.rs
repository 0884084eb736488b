// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! AtomicBool flag for cheap polling, plus a mutex/condvar pair so threads
//! sleeping in `wait()` wake the moment the flag flips.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::Cancelled;

/// Cancellation flag shared between a controller and a worker.
///
/// Monotonic: once cancelled it stays cancelled.
#[derive(Debug)]
pub struct CancelToken {
    flag: AtomicBool,
    notify: (Mutex<bool>, Condvar),
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: (Mutex::new(false), Condvar::new()),
        }
    }

    /// Set the cancellation flag and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        let (lock, cvar) = &self.notify;
        let mut set = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *set = true;
        cvar.notify_all();
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancelled, so targets can bail out with `?`.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for up to `timeout`, waking early on cancellation.
    ///
    /// `None` waits until cancelled. Returns `true` if the token is
    /// cancelled, `false` if the timeout ran out first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let (lock, cvar) = &self.notify;
        let mut set = lock.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            None => {
                while !*set {
                    set = cvar.wait(set).unwrap_or_else(PoisonError::into_inner);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now().checked_add(timeout);
                while !*set {
                    let remaining = match deadline {
                        Some(d) => d.saturating_duration_since(Instant::now()),
                        None => timeout,
                    };
                    if remaining.is_zero() {
                        return false;
                    }
                    set = cvar
                        .wait_timeout(set, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                true
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cancel_is_monotonic() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.check(), Ok(()));
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(Cancelled));
    }

    #[test]
    fn wait_times_out() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn wait_zero_returns_current_state() {
        let token = CancelToken::new();
        assert!(!token.wait(Some(Duration::ZERO)));
        token.cancel();
        assert!(token.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn wait_wakes_on_cancel() {
        let token = Arc::new(CancelToken::new());
        let t = token.clone();
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let cancelled = t.wait(Some(Duration::from_secs(10)));
            (cancelled, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn wait_forever_returns_after_cancel() {
        let token = Arc::new(CancelToken::new());
        let t = token.clone();
        let waiter = std::thread::spawn(move || t.wait(None));
        std::thread::sleep(Duration::from_millis(10));
        token.cancel();
        assert!(waiter.join().unwrap());
    }
}
