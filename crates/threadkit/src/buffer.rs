// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Background buffering of a live stream.
//!
//! A [`StoppableThread`] pulls items from an iterator into an
//! [`EvictingQueue`] so the owner can flush them on demand. Only the most
//! recent `capacity` items are kept.
//!
//! A `next()` call that is already blocked on the source cannot be
//! interrupted; `stop()` takes effect once it returns. Sources that may
//! block forever should carry their own timeout.

use std::sync::Arc;

use crate::error::{CapacityError, JoinError, ThreadError};
use crate::queue::EvictingQueue;
use crate::thread::{Builder, StoppableThread};

pub struct StreamBuffer<T> {
    queue: Arc<EvictingQueue<T>>,
    thread: StoppableThread<()>,
}

impl<T: Send + 'static> StreamBuffer<T> {
    /// Buffer up to `capacity` items from `stream`. Nothing is read until
    /// [`start`](Self::start).
    pub fn new<I>(stream: I, capacity: usize) -> Result<Self, CapacityError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let queue = Arc::new(EvictingQueue::new(capacity)?);
        let sink = queue.clone();
        let mut source = stream.into_iter();
        let thread = Builder::new().name("stream-buffer").build_fn(move |token| {
            while !token.is_cancelled() {
                match source.next() {
                    Some(item) => {
                        sink.put(item);
                    }
                    None => break,
                }
            }
        });
        Ok(Self { queue, thread })
    }

    pub fn start(&self) -> Result<(), ThreadError> {
        self.thread.start()
    }

    /// Stop collecting and wait for the reader thread to exit.
    pub fn stop(&self) -> Result<(), JoinError> {
        self.thread.stop();
        self.thread.join(None).map(|_| ())
    }

    /// Whether the reader has exited (stopped or source exhausted).
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Everything buffered since the last flush, oldest first.
    pub fn flush(&self) -> Vec<T> {
        self.queue.flush()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<T: Send + Clone + 'static> StreamBuffer<T> {
    /// Most recent buffered item.
    pub fn peek_back(&self) -> Option<T> {
        self.queue.peek_back()
    }

    /// Oldest buffered item.
    pub fn peek_front(&self) -> Option<T> {
        self.queue.peek_front()
    }
}

impl<T: Send + PartialEq + 'static> StreamBuffer<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.queue.contains(item)
    }
}

impl<T> std::fmt::Debug for StreamBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("capacity", &self.queue.capacity())
            .field("thread", &self.thread)
            .finish()
    }
}
