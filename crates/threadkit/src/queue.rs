// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded FIFO with evicting puts and blocking gets.
//!
//! `put` never blocks: at capacity the oldest item is pushed out. `get`
//! blocks on a condvar until an item arrives, the queue is stopped, or the
//! timeout runs out. Stopping wakes every blocked reader; items already
//! buffered are still handed out before readers see `QueueError::Stopped`.
//!
//! Written for one producer and one consumer. More of either stays
//! memory-safe under the lock, but "oldest" then only has meaning relative
//! to each producer's own submission order.

use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{CapacityError, QueueError};

/// Thread-safe evicting queue.
///
/// ```
/// use threadkit::{EvictingQueue, QueueError};
/// use std::time::Duration;
///
/// let q = EvictingQueue::new(2).unwrap();
/// q.put(1);
/// q.put(2);
/// q.put(3); // evicts 1
/// assert_eq!(q.get(None), Ok(2));
/// assert_eq!(q.get(None), Ok(3));
/// assert_eq!(q.get(Some(Duration::from_millis(10))), Err(QueueError::Timeout));
/// ```
#[derive(Debug)]
pub struct EvictingQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

#[derive(Debug)]
struct QueueState<T> {
    buf: VecDeque<T>,
    stopped: bool,
}

impl<T> EvictingQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self, CapacityError> {
        if capacity == 0 {
            return Err(CapacityError);
        }
        Ok(Self {
            capacity,
            state: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            available: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buf.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Append `item`, evicting the oldest entry when full. Never blocks.
    ///
    /// Returns whatever did not make it into the buffer: the evicted entry,
    /// or `item` itself once the queue has been stopped.
    pub fn put(&self, item: T) -> Option<T> {
        let mut state = self.lock();
        if state.stopped {
            return Some(item);
        }
        let evicted = if state.buf.len() >= self.capacity {
            state.buf.pop_front()
        } else {
            None
        };
        state.buf.push_back(item);
        drop(state);
        self.available.notify_one();
        evicted
    }

    /// Pop the oldest item, blocking for at most `timeout` (`None` = forever).
    pub fn get(&self, timeout: Option<Duration>) -> Result<T, QueueError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.lock();
        loop {
            if let Some(item) = state.buf.pop_front() {
                return Ok(item);
            }
            if state.stopped {
                return Err(QueueError::Stopped);
            }
            state = match timeout {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    // Deadline overflow only happens for absurd timeouts;
                    // re-arming the full timeout is indistinguishable there.
                    let remaining = match deadline {
                        Some(d) => d.saturating_duration_since(Instant::now()),
                        None => timeout,
                    };
                    if remaining.is_zero() {
                        return Err(QueueError::Timeout);
                    }
                    self.available
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Non-blocking `get`.
    pub fn try_get(&self) -> Result<T, QueueError> {
        self.get(Some(Duration::ZERO))
    }

    /// Take everything currently buffered, oldest first. Never blocks.
    pub fn flush(&self) -> Vec<T> {
        self.lock().buf.drain(..).collect()
    }

    /// Stop the queue and wake all blocked readers. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock();
        if !state.stopped {
            state.stopped = true;
            tracing::debug!(buffered = state.buf.len(), "evicting queue stopped");
        }
        drop(state);
        self.available.notify_all();
    }

    /// Blocking iterator; ends once the queue is stopped and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            timeout: None,
            done: false,
        }
    }

    /// Like [`iter`](Self::iter), but also ends when no item arrives
    /// within `timeout` of the previous one.
    pub fn iter_timeout(&self, timeout: Option<Duration>) -> Iter<'_, T> {
        Iter {
            queue: self,
            timeout,
            done: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> EvictingQueue<T> {
    /// Newest buffered item, without removing it.
    pub fn peek_back(&self) -> Option<T> {
        self.lock().buf.back().cloned()
    }

    /// Oldest buffered item, without removing it.
    pub fn peek_front(&self) -> Option<T> {
        self.lock().buf.front().cloned()
    }
}

impl<T: PartialEq> EvictingQueue<T> {
    /// Whether `item` is currently buffered.
    pub fn contains(&self, item: &T) -> bool {
        self.lock().buf.contains(item)
    }
}

/// Lazy reader over an [`EvictingQueue`]. Once it returns `None` it stays
/// exhausted.
#[derive(Debug)]
pub struct Iter<'a, T> {
    queue: &'a EvictingQueue<T>,
    timeout: Option<Duration>,
    done: bool,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.done {
            return None;
        }
        match self.queue.get(self.timeout) {
            Ok(item) => Some(item),
            Err(QueueError::Stopped | QueueError::Timeout) => {
                self.done = true;
                None
            }
        }
    }
}

impl<T> FusedIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a EvictingQueue<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
