// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stoppable OS thread.
//!
//! A target closure runs on its own thread with a shared [`CancelToken`].
//! `stop()` only flips the token; the target has to notice and return.
//! Panics and returned errors are captured and reported by `join()`.

use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{panic_message, Cancelled, JoinError, ThreadError};

type Target<T> = Box<dyn FnOnce(&CancelToken) -> Result<T, JoinError> + Send>;
type ExitHook = Box<dyn FnOnce(Result<(), JoinError>) + Send>;

/// Lifecycle of a [`StoppableThread`].
///
/// Stop requests are tracked separately by the token; a thread asked to
/// stop is still `Running` until its target returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Running,
    Stopped,
}

/// Completion slot written by the thread, read by `join()`.
struct ExitSlot<T> {
    inner: Mutex<ExitState<T>>,
    cvar: Condvar,
}

struct ExitState<T> {
    finished: bool,
    outcome: Option<Result<T, JoinError>>,
}

impl<T> ExitSlot<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ExitState {
                finished: false,
                outcome: None,
            }),
            cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExitState<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, outcome: Result<T, JoinError>) {
        let mut state = self.lock();
        state.finished = true;
        state.outcome = Some(outcome);
        self.cvar.notify_all();
    }

    fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Block until finished or `timeout` runs out. Returns the guard so the
    /// caller can inspect the outcome without racing the writer.
    fn wait(&self, timeout: Option<Duration>) -> MutexGuard<'_, ExitState<T>> {
        let mut state = self.lock();
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        while !state.finished {
            match timeout {
                None => {
                    state = self.cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Some(timeout) => {
                    let remaining = match deadline {
                        Some(d) => d.saturating_duration_since(Instant::now()),
                        None => timeout,
                    };
                    if remaining.is_zero() {
                        break;
                    }
                    state = self
                        .cvar
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        state
    }
}

/// A thread that can be asked to stop.
///
/// All methods take `&self`, so the thread can sit behind an `Arc` and be
/// stopped from one place while another joins it.
///
/// ```
/// use threadkit::StoppableThread;
/// use std::time::Duration;
///
/// let worker = StoppableThread::from_fn(|token| {
///     let mut ticks = 0;
///     while !token.wait(Some(Duration::from_millis(5))) {
///         ticks += 1;
///     }
///     ticks
/// });
/// worker.start().unwrap();
/// worker.stop();
/// assert_eq!(worker.join(None), Ok(true));
/// ```
pub struct StoppableThread<T> {
    name: Option<String>,
    token: Arc<CancelToken>,
    target: Mutex<Option<Target<T>>>,
    on_exit: Mutex<Option<ExitHook>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    exit: Arc<ExitSlot<T>>,
    started: AtomicBool,
}

impl<T: Send + 'static> StoppableThread<T> {
    /// Wrap a fallible target.
    ///
    /// An `Err` of type [`Cancelled`] is reported as `JoinError::Cancelled`;
    /// any other error becomes `JoinError::Failed` with its display text.
    pub fn new<F, E>(target: F) -> Self
    where
        F: FnOnce(&CancelToken) -> Result<T, E> + Send + 'static,
        E: Display + 'static,
    {
        Builder::new().build(target)
    }

    /// Wrap a target that cannot fail (other than by panicking).
    pub fn from_fn<F>(target: F) -> Self
    where
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        Builder::new().build_fn(target)
    }

    /// Run the target on a new OS thread.
    pub fn start(&self) -> Result<(), ThreadError> {
        let target = lock(&self.target)
            .take()
            .ok_or(ThreadError::AlreadyStarted)?;
        let on_exit = lock(&self.on_exit).take();
        self.started.store(true, Ordering::Release);

        let token = self.token.clone();
        let exit = self.exit.clone();
        let label = self.name.clone().unwrap_or_else(|| "<unnamed>".to_string());

        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }

        let spawned = builder.spawn(move || {
            tracing::debug!(thread = %label, "stoppable thread running");
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| target(token.as_ref()))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(JoinError::Panicked(panic_message(&*payload))),
            };
            let status = outcome.as_ref().map(|_| ()).map_err(|e| e.clone());
            match &status {
                Ok(()) => tracing::debug!(thread = %label, "stoppable thread exited"),
                Err(e) => tracing::debug!(thread = %label, error = %e, "stoppable thread exited with failure"),
            }
            exit.finish(outcome);
            if let Some(hook) = on_exit {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(status))) {
                    tracing::error!(
                        thread = %label,
                        reason = %panic_message(&*payload),
                        "exit hook panicked"
                    );
                }
            }
        });

        match spawned {
            Ok(handle) => {
                *lock(&self.handle) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.exit
                    .finish(Err(JoinError::Failed(format!("failed to spawn thread: {}", e))));
                Err(ThreadError::Spawn(e))
            }
        }
    }

    /// Request a cooperative stop. Returns immediately.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether a stop has been requested (not whether the thread exited).
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the target has returned.
    pub fn is_finished(&self) -> bool {
        self.exit.is_finished()
    }

    pub fn state(&self) -> ThreadState {
        if !self.started.load(Ordering::Acquire) {
            ThreadState::Created
        } else if self.exit.is_finished() {
            ThreadState::Stopped
        } else {
            ThreadState::Running
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The cancellation token handed to the target.
    pub fn token(&self) -> &Arc<CancelToken> {
        &self.token
    }

    /// Wait up to `timeout` (`None` = forever) for the target to return.
    ///
    /// `Ok(true)` once finished successfully, `Ok(false)` on timeout. A
    /// target that panicked or failed reports its error on every call that
    /// observes completion. Only `join(None)` also waits for the exit hook.
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool, JoinError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(JoinError::NotStarted);
        }
        let state = self.exit.wait(timeout);
        if !state.finished {
            return Ok(false);
        }
        let failure = match &state.outcome {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        };
        drop(state);

        // The exit hook may still be running. A bounded join only reaps an
        // OS thread that has already exited; otherwise a later join or drop
        // picks it up.
        let handle = {
            let mut slot = lock(&self.handle);
            match slot.as_ref() {
                Some(h) if timeout.is_none() || h.is_finished() => slot.take(),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Block until the target returns and take its value.
    pub fn into_output(self) -> Result<T, JoinError> {
        self.join(None)?;
        self.exit
            .lock()
            .outcome
            .take()
            .unwrap_or(Err(JoinError::OutputTaken))
    }
}

impl<T> std::fmt::Debug for StoppableThread<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoppableThread")
            .field("name", &self.name)
            .field("started", &self.started.load(Ordering::Acquire))
            .field("finished", &self.exit.is_finished())
            .field("stop_requested", &self.token.is_cancelled())
            .finish()
    }
}

impl<T> Drop for StoppableThread<T> {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) && !self.exit.is_finished() {
            // No forced teardown: ask the target to stop and let it finish
            // on its own.
            self.token.cancel();
            tracing::warn!(
                thread = self.name.as_deref().unwrap_or("<unnamed>"),
                "stoppable thread dropped while running; stop requested and detached"
            );
        }
    }
}

/// Configures a [`StoppableThread`] before it is built.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    token: Option<Arc<CancelToken>>,
    on_exit: Option<ExitHook>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// OS thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Share an externally owned token instead of creating a fresh one.
    pub fn token(mut self, token: Arc<CancelToken>) -> Self {
        self.token = Some(token);
        self
    }

    /// Run `hook` on the worker thread right after the target returns.
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Result<(), JoinError>) + Send + 'static,
    {
        self.on_exit = Some(Box::new(hook));
        self
    }

    pub fn build<T, F, E>(self, target: F) -> StoppableThread<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T, E> + Send + 'static,
        E: Display + 'static,
    {
        self.finish(Box::new(move |token| target(token).map_err(classify)))
    }

    pub fn build_fn<T, F>(self, target: F) -> StoppableThread<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        self.finish(Box::new(move |token| Ok(target(token))))
    }

    fn finish<T>(self, target: Target<T>) -> StoppableThread<T> {
        StoppableThread {
            name: self.name,
            token: self.token.unwrap_or_default(),
            target: Mutex::new(Some(target)),
            on_exit: Mutex::new(self.on_exit),
            handle: Mutex::new(None),
            exit: Arc::new(ExitSlot::new()),
            started: AtomicBool::new(false),
        }
    }
}

fn classify<E: Display + 'static>(err: E) -> JoinError {
    if (&err as &dyn Any).is::<Cancelled>() {
        JoinError::Cancelled
    } else {
        JoinError::Failed(err.to_string())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
