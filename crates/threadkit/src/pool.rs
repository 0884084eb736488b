// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fixed-size worker pool used to run store callbacks off the writer's
//! thread.
//!
//! N named worker threads pop jobs from one shared FIFO. Submitting never
//! blocks. Shutdown lets the workers drain what is already queued, then
//! joins them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::ThreadError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
    shared: Arc<PoolShared>,
}

struct PoolShared {
    jobs: Mutex<VecDeque<Job>>,
    work_available: Condvar,
    shutdown: AtomicBool,
}

impl PoolShared {
    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkerPool {
    /// Start `size` workers named `{name}-{id}`. `size` must be at least 1.
    pub fn new(size: usize, name: &str) -> Result<Self, ThreadError> {
        let shared = Arc::new(PoolShared {
            jobs: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Tear down whatever already started before bailing.
                    {
                        let _jobs = shared.jobs();
                        shared.shutdown.store(true, Ordering::Release);
                        shared.work_available.notify_all();
                    }
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(ThreadError::Spawn(e));
                }
            }
        }

        tracing::debug!(workers = size, name, "worker pool started");
        let worker_ids = handles.iter().map(|h| h.thread().id()).collect();
        Ok(Self {
            workers: Mutex::new(handles),
            worker_ids,
            shared,
        })
    }

    pub fn size(&self) -> usize {
        self.worker_ids.len()
    }

    /// Queue a job. Never blocks beyond the queue lock.
    ///
    /// After shutdown the job is handed back instead of queued.
    pub fn execute(&self, job: Job) -> Result<(), Job> {
        let mut jobs = self.shared.jobs();
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(job);
        }
        jobs.push_back(job);
        drop(jobs);
        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Stop accepting jobs, let workers drain the queue, and join them.
    ///
    /// Called from one of the pool's own workers (a callback dropping the
    /// last store handle) the workers are left to exit on their own.
    pub fn shutdown(&self) {
        {
            // Flip the flag under the queue lock: every accepted job is then
            // already queued, and no worker can miss the wakeup.
            let _jobs = self.shared.jobs();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            self.shared.work_available.notify_all();
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.worker_ids.contains(&thread::current().id()) {
            workers.clear();
            tracing::debug!("worker pool shut down from a worker; detaching");
            return;
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut jobs = shared.jobs();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                jobs = shared
                    .work_available
                    .wait(jobs)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}
