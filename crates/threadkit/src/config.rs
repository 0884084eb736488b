// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Store configuration.
//!
//! `workers = 0` is a sentinel for "one worker per available core".

use std::thread;

/// Worker count used when the core count cannot be queried.
const FALLBACK_WORKERS: usize = 4;

/// Settings for a [`Store`](crate::Store)'s dispatch pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Number of dispatch threads (`0` = available parallelism).
    pub workers: usize,

    /// Prefix for dispatch thread names; workers are `{thread_name}-{id}`.
    pub thread_name: String,
}

impl StoreConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Resolve the `0` sentinel to a concrete worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(FALLBACK_WORKERS)
        } else {
            self.workers
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            thread_name: "threadkit-store".to_string(),
        }
    }
}
