// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timeout helpers.
//!
//! `TimeoutIter` drives an iterator on a helper thread and races each item
//! against a timer. `timed` logs how long a closure took.

use std::iter::FusedIterator;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ThreadError;

/// Iterator that ends once the source takes longer than `timeout` to
/// produce its next item.
///
/// The source runs on its own thread. If it stalls forever, that thread
/// stays parked in `next()` after this iterator is gone; it exits on its
/// next item.
#[derive(Debug)]
pub struct TimeoutIter<T> {
    rx: Receiver<T>,
    timeout: Option<Duration>,
    done: bool,
}

impl<T: Send + 'static> TimeoutIter<T> {
    /// `None` never times out; the iterator then ends with the source.
    pub fn new<I>(source: I, timeout: Option<Duration>) -> Result<Self, ThreadError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        // Rendezvous: the helper pulls at most one item ahead.
        let (tx, rx) = mpsc::sync_channel(0);
        let source = source.into_iter();
        thread::Builder::new()
            .name("timeout-iter".to_string())
            .spawn(move || {
                for item in source {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            rx,
            timeout,
            done: false,
        })
    }
}

impl<T> Iterator for TimeoutIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        let item = match self.timeout {
            None => self.rx.recv().ok(),
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(item) => Some(item),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
        };
        if item.is_none() {
            self.done = true;
        }
        item
    }
}

impl<T> FusedIterator for TimeoutIter<T> {}

/// Run `f`, logging its wall-clock duration at debug level under `label`.
pub fn timed<R>(label: &str, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let result = f();
    let elapsed = start.elapsed();
    tracing::debug!(
        label,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "{} took {:.3} ms",
        label,
        elapsed.as_secs_f64() * 1000.0
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_fast_source() {
        let it = TimeoutIter::new(0..5, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(it.collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn no_timeout_runs_to_end() {
        let it = TimeoutIter::new(vec!["a", "b"], None).unwrap();
        assert_eq!(it.collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn stalls_end_iteration() {
        let source = (0..10).map(|i| {
            if i == 2 {
                std::thread::sleep(Duration::from_millis(500));
            }
            i
        });
        let mut it = TimeoutIter::new(source, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(it.next(), Some(0));
        assert_eq!(it.next(), Some(1));
        assert_eq!(it.next(), None);
        // Fused: later items never show up.
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn timed_returns_result() {
        assert_eq!(timed("add", || 2 + 2), 4);
    }
}
