// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread-safety primitives for OS-thread programs.
//!
//! Components:
//! - queue  : bounded FIFO, evicting puts, blocking/timeout gets, stop
//! - thread : OS thread with cooperative cancellation and captured failures
//! - store  : multi-writer callback registry with off-thread dispatch
//! - cancel : cancellation token shared by the above
//! - buffer : background stream buffering (thread + queue)
//! - timeout: timeout-bounded iteration, timing helper
//!
//! Nothing here installs a `tracing` subscriber; the host application
//! decides where log output goes.

pub mod buffer;
pub mod cancel;
pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod thread;
pub mod timeout;

mod pool;

pub use buffer::StreamBuffer;
pub use cancel::CancelToken;
pub use config::StoreConfig;
pub use error::{CallbackFailure, Cancelled, CapacityError, JoinError, QueueError, ThreadError};
pub use queue::EvictingQueue;
pub use store::{Delivery, DeliveryReport, Store, SubscriberId, Writer};
pub use thread::{Builder as ThreadBuilder, StoppableThread, ThreadState};
pub use timeout::{timed, TimeoutIter};
