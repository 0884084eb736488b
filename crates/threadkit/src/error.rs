// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error kinds for the queue, thread, and store primitives.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::store::SubscriberId;

/// Expected terminal conditions of a blocking queue read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was stopped and every buffered item has been drained.
    #[error("queue stopped")]
    Stopped,

    /// No item arrived before the timeout elapsed.
    #[error("timed out waiting for a queue item")]
    Timeout,
}

/// Requested a queue that can hold nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue capacity must be at least 1")]
pub struct CapacityError;

/// Misuse of the `StoppableThread` lifecycle.
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("thread already started")]
    AlreadyStarted,

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}

/// How a thread target ended when it did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// Target panicked with the given message.
    #[error("thread panicked: {0}")]
    Panicked(String),

    /// Target returned an error.
    #[error("thread failed: {0}")]
    Failed(String),

    /// Target bailed out after observing cancellation.
    #[error("thread was cancelled")]
    Cancelled,

    /// `join` was called before `start`.
    #[error("thread has not been started")]
    NotStarted,

    /// The output was already taken by an earlier call.
    #[error("thread output already taken")]
    OutputTaken,
}

/// Marker returned by [`CancelToken::check`](crate::CancelToken::check) once
/// cancellation has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancellation requested")]
pub struct Cancelled;

/// One subscriber invocation that failed during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure {
    pub subscriber: SubscriberId,
    pub name: Option<String>,
    pub message: String,
    /// True if the callback panicked rather than returning an error.
    pub panicked: bool,
}

impl fmt::Display for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.panicked { "panicked" } else { "failed" };
        match &self.name {
            Some(name) => write!(f, "subscriber {} ({}) {}: {}", self.subscriber, name, kind, self.message),
            None => write!(f, "subscriber {} {}: {}", self.subscriber, kind, self.message),
        }
    }
}

impl std::error::Error for CallbackFailure {}

/// Render a `catch_unwind` payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
