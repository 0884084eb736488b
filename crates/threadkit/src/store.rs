// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Callback store: many writers, many subscribers, off-thread dispatch.
//!
//! ```text
//! writer.write(v)
//!     │  snapshot = current subscriber list (Arc clone)
//!     ├──► pool job ──► subscriber 1
//!     ├──► pool job ──► subscriber 2   (panic/error → log + error sink)
//!     └──► pool job ──► subscriber N
//! ```
//!
//! Subscribers and writers meet on a channel. `register`/`writer` use the
//! default channel; `register_for(key, ..)`/`writer_for(key)` use the
//! channel named `key`. Channels are disjoint: a write only reaches the
//! subscribers of its writer's channel.
//!
//! Each channel's subscriber list is copy-on-write: register/unregister
//! build a new list and swap it in, so a write in flight keeps delivering
//! to exactly the subscribers it saw when it started.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::StoreConfig;
use crate::error::{panic_message, CallbackFailure, ThreadError};
use crate::pool::WorkerPool;

type Callback<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;
type ErrorSink = Arc<dyn Fn(&CallbackFailure) + Send + Sync>;

/// Channel name; `None` is the default channel.
type Channel = Option<Arc<str>>;
type Subscribers<T> = Arc<Vec<Subscriber<T>>>;

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Subscriber<T> {
    id: SubscriberId,
    name: Option<Arc<str>>,
    callback: Callback<T>,
}

impl<T> Subscriber<T> {
    fn failure(&self, message: String, panicked: bool) -> CallbackFailure {
        CallbackFailure {
            subscriber: self.id,
            name: self.name.as_deref().map(str::to_string),
            message,
            panicked,
        }
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            callback: self.callback.clone(),
        }
    }
}

struct StoreInner<T> {
    channels: Mutex<HashMap<Channel, Subscribers<T>>>,
    error_sink: Mutex<Option<ErrorSink>>,
    next_id: AtomicU64,
    writers: AtomicUsize,
    pool: WorkerPool,
}

impl<T> StoreInner<T> {
    fn channels(&self) -> MutexGuard<'_, HashMap<Channel, Subscribers<T>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, channel: &Channel) -> Subscribers<T> {
        self.channels().get(channel).cloned().unwrap_or_default()
    }

    fn error_sink(&self) -> Option<ErrorSink> {
        self.error_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Registry of callbacks that writers on any thread push values into.
///
/// ```
/// use threadkit::Store;
/// use std::sync::{Arc, Mutex};
///
/// let store = Store::with_workers(2).unwrap();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// store.register(move |v: &i32| sink.lock().unwrap().push(*v));
///
/// let writer = store.writer();
/// let report = writer.write(5).wait();
/// assert_eq!(report.delivered, 1);
/// assert_eq!(*seen.lock().unwrap(), vec![5]);
/// ```
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T: Send + Sync + 'static> Store<T> {
    /// Store with the default config (one dispatch worker per core).
    pub fn new() -> Result<Self, ThreadError> {
        Self::with_config(StoreConfig::default())
    }

    /// Store with `workers` dispatch threads (`0` = one per core).
    pub fn with_workers(workers: usize) -> Result<Self, ThreadError> {
        Self::with_config(StoreConfig::default().with_workers(workers))
    }

    pub fn with_config(config: StoreConfig) -> Result<Self, ThreadError> {
        let pool = WorkerPool::new(config.worker_count(), &config.thread_name)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                channels: Mutex::new(HashMap::new()),
                error_sink: Mutex::new(None),
                next_id: AtomicU64::new(1),
                writers: AtomicUsize::new(0),
                pool,
            }),
        })
    }

    /// Subscribe `callback` to every future write on the default channel.
    pub fn register<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(
            None,
            None,
            Arc::new(move |value: &T| {
                callback(value);
                Ok(())
            }),
        )
    }

    /// Like [`register`](Self::register); `name` labels failures in logs
    /// and in [`CallbackFailure`].
    pub fn register_named<F>(&self, name: impl Into<String>, callback: F) -> SubscriberId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let name: String = name.into();
        self.insert(
            None,
            Some(Arc::from(name)),
            Arc::new(move |value: &T| {
                callback(value);
                Ok(())
            }),
        )
    }

    /// Subscribe a callback that reports failure by returning `Err`.
    pub fn register_fallible<F, E>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&T) -> Result<(), E> + Send + Sync + 'static,
        E: Display,
    {
        self.insert(
            None,
            None,
            Arc::new(move |value: &T| callback(value).map_err(|e| e.to_string())),
        )
    }

    /// Subscribe `callback` to writes made through [`writer_for`](Self::writer_for)
    /// with the same `key`.
    pub fn register_for<F>(&self, key: &str, callback: F) -> SubscriberId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(
            Some(Arc::from(key)),
            None,
            Arc::new(move |value: &T| {
                callback(value);
                Ok(())
            }),
        )
    }

    /// Fallible variant of [`register_for`](Self::register_for).
    pub fn register_fallible_for<F, E>(&self, key: &str, callback: F) -> SubscriberId
    where
        F: Fn(&T) -> Result<(), E> + Send + Sync + 'static,
        E: Display,
    {
        self.insert(
            Some(Arc::from(key)),
            None,
            Arc::new(move |value: &T| callback(value).map_err(|e| e.to_string())),
        )
    }

    /// Remove a subscriber from whichever channel it is on. Returns `false`
    /// if it was already gone.
    ///
    /// Writes already dispatched keep delivering to it.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut channels = self.inner.channels();
        let channel = channels
            .iter()
            .find(|(_, subs)| subs.iter().any(|s| s.id == id))
            .map(|(channel, _)| channel.clone());
        let Some(channel) = channel else {
            return false;
        };
        let next: Vec<_> = channels[&channel]
            .iter()
            .filter(|s| s.id != id)
            .cloned()
            .collect();
        if next.is_empty() {
            channels.remove(&channel);
        } else {
            channels.insert(channel.clone(), Arc::new(next));
        }
        drop(channels);
        tracing::debug!(subscriber = %id, key = channel.as_deref(), "store subscriber unregistered");
        true
    }

    /// Number of registered subscribers across all channels.
    pub fn len(&self) -> usize {
        self.inner.channels().values().map(|subs| subs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscribers on the channel named `key`.
    pub fn len_for(&self, key: &str) -> usize {
        let channel: Channel = Some(Arc::from(key));
        self.inner
            .channels()
            .get(&channel)
            .map_or(0, |subs| subs.len())
    }

    /// Names of the keyed channels that currently have subscribers.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .channels()
            .keys()
            .flatten()
            .map(|k| k.to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Install the sink that receives every callback failure.
    ///
    /// Failures are always logged; the sink is an additional channel.
    pub fn on_error<F>(&self, sink: F)
    where
        F: Fn(&CallbackFailure) + Send + Sync + 'static,
    {
        *self
            .inner
            .error_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(sink));
    }

    /// Open a writer session on the default channel. Released when the
    /// returned guard drops.
    pub fn writer(&self) -> Writer<T> {
        Writer::open(self.inner.clone(), None)
    }

    /// Open a writer session on the channel named `key`.
    pub fn writer_for(&self, key: &str) -> Writer<T> {
        Writer::open(self.inner.clone(), Some(Arc::from(key)))
    }

    /// Writers currently open against this store.
    pub fn active_writers(&self) -> usize {
        self.inner.writers.load(Ordering::Acquire)
    }

    /// Number of dispatch threads.
    pub fn workers(&self) -> usize {
        self.inner.pool.size()
    }

    /// Deliver everything already dispatched, then stop the pool.
    ///
    /// Writes made afterwards (through writers still open) are reported as
    /// failures rather than delivered.
    pub fn shutdown(self) {
        self.inner.pool.shutdown();
    }

    fn insert(
        &self,
        channel: Channel,
        name: Option<Arc<str>>,
        callback: Callback<T>,
    ) -> SubscriberId {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.inner.channels();
        let current = channels.entry(channel.clone()).or_default();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Subscriber {
            id,
            name: name.clone(),
            callback,
        });
        *current = Arc::new(next);
        drop(channels);
        tracing::debug!(
            subscriber = %id,
            name = name.as_deref(),
            key = channel.as_deref(),
            "store subscriber registered"
        );
        id
    }
}

impl<T> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers: usize = self.inner.channels().values().map(|subs| subs.len()).sum();
        f.debug_struct("Store")
            .field("subscribers", &subscribers)
            .field("writers", &self.inner.writers.load(Ordering::Acquire))
            .field("workers", &self.inner.pool.size())
            .finish()
    }
}

/// Scoped write session on a [`Store`].
///
/// Counted in [`Store::active_writers`] from creation until drop. Cloning
/// opens another session on the same channel. Writers are `Send`, so each
/// thread can hold its own.
pub struct Writer<T> {
    inner: Arc<StoreInner<T>>,
    key: Channel,
}

impl<T: Send + Sync + 'static> Writer<T> {
    fn open(inner: Arc<StoreInner<T>>, key: Channel) -> Self {
        inner.writers.fetch_add(1, Ordering::AcqRel);
        Self { inner, key }
    }

    /// Channel name, `None` for the default channel.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Hand `value` to every subscriber on this writer's channel right now.
    ///
    /// Returns as soon as the deliveries are queued. The returned
    /// [`Delivery`] can be waited on; dropping it changes nothing.
    pub fn write(&self, value: T) -> Delivery {
        let snapshot = self.inner.snapshot(&self.key);
        let progress = Arc::new(Progress::new(snapshot.len()));
        if snapshot.is_empty() {
            return Delivery { progress };
        }

        let value = Arc::new(value);
        let sink = self.inner.error_sink();
        for sub in snapshot.iter() {
            let job_key = self.key.clone();
            let job_sub = sub.clone();
            let job_value = value.clone();
            let job_sink = sink.clone();
            let job_progress = progress.clone();
            let job = Box::new(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    (job_sub.callback)(job_value.as_ref())
                }));
                let outcome = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(message)) => Some((message, false)),
                    Err(payload) => Some((panic_message(&*payload), true)),
                };
                match outcome {
                    None => job_progress.delivered(),
                    Some((message, panicked)) => {
                        let failure = job_sub.failure(message, panicked);
                        report(&failure, job_key.as_deref(), job_sink.as_ref());
                        job_progress.failed(failure);
                    }
                }
            });
            if self.inner.pool.execute(job).is_err() {
                let failure = sub.failure("store is shut down".to_string(), false);
                report(&failure, self.key.as_deref(), sink.as_ref());
                progress.failed(failure);
            }
        }
        Delivery { progress }
    }
}

impl<T: Send + Sync + 'static> Clone for Writer<T> {
    fn clone(&self) -> Self {
        Writer::open(self.inner.clone(), self.key.clone())
    }
}

impl<T> Drop for Writer<T> {
    fn drop(&mut self) {
        self.inner.writers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T> fmt::Debug for Writer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("key", &self.key.as_deref())
            .finish_non_exhaustive()
    }
}

fn report(failure: &CallbackFailure, key: Option<&str>, sink: Option<&ErrorSink>) {
    tracing::error!(
        subscriber = %failure.subscriber,
        name = failure.name.as_deref(),
        key,
        reason = %failure.message,
        panicked = failure.panicked,
        "store callback failed"
    );
    if let Some(sink) = sink {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(failure))) {
            tracing::error!(reason = %panic_message(&*payload), "store error sink panicked");
        }
    }
}

/// Outcome of one write once every snapshot subscriber has run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Subscribers that returned normally.
    pub delivered: usize,
    pub failures: Vec<CallbackFailure>,
}

struct Progress {
    state: Mutex<ProgressState>,
    done: Condvar,
    subscribers: usize,
}

struct ProgressState {
    remaining: usize,
    report: DeliveryReport,
}

impl Progress {
    fn new(subscribers: usize) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                remaining: subscribers,
                report: DeliveryReport::default(),
            }),
            done: Condvar::new(),
            subscribers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivered(&self) {
        let mut state = self.lock();
        state.report.delivered += 1;
        self.settle(state);
    }

    fn failed(&self, failure: CallbackFailure) {
        let mut state = self.lock();
        state.report.failures.push(failure);
        self.settle(state);
    }

    fn settle(&self, mut state: MutexGuard<'_, ProgressState>) {
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.done.notify_all();
        }
    }
}

/// Tracks the deliveries of a single [`Writer::write`].
pub struct Delivery {
    progress: Arc<Progress>,
}

impl Delivery {
    /// Size of the subscriber snapshot this write was sent to.
    pub fn subscribers(&self) -> usize {
        self.progress.subscribers
    }

    pub fn is_complete(&self) -> bool {
        self.progress.lock().remaining == 0
    }

    /// Block until every subscriber in the snapshot has run.
    pub fn wait(&self) -> DeliveryReport {
        let mut state = self.progress.lock();
        while state.remaining > 0 {
            state = self
                .progress
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.report.clone()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DeliveryReport> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.progress.lock();
        while state.remaining > 0 {
            let remaining = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining.is_zero() {
                return None;
            }
            state = self
                .progress
                .done
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(state.report.clone())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subscribers", &self.progress.subscribers)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn collector<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |v: &T| sink.lock().unwrap().push(v.clone()))
    }

    #[test]
    fn write_reaches_every_subscriber_once() {
        let store = Store::with_workers(2).unwrap();
        let (a, cb_a) = collector::<i32>();
        let (b, cb_b) = collector::<i32>();
        store.register(cb_a);
        store.register(cb_b);

        let report = store.writer().write(5).wait();
        assert_eq!(report.delivered, 2);
        assert!(report.failures.is_empty());
        assert_eq!(*a.lock().unwrap(), vec![5]);
        assert_eq!(*b.lock().unwrap(), vec![5]);
    }

    #[test]
    fn write_without_subscribers_is_complete() {
        let store = Store::<u8>::with_workers(1).unwrap();
        let delivery = store.writer().write(1);
        assert_eq!(delivery.subscribers(), 0);
        assert!(delivery.is_complete());
        assert_eq!(delivery.wait(), DeliveryReport::default());
    }

    #[test]
    fn unregister_stops_future_deliveries() {
        let store = Store::with_workers(1).unwrap();
        let (seen, cb) = collector::<&'static str>();
        let id = store.register(cb);
        let w = store.writer();
        w.write("a").wait();
        assert!(store.unregister(id));
        assert!(!store.unregister(id));
        assert!(store.is_empty());
        assert_eq!(w.write("b").wait().delivered, 0);
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn snapshot_is_fixed_at_write_time() {
        let store = Store::with_workers(1).unwrap();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let g = gate.clone();
        // First subscriber blocks the single worker until released.
        let blocker = store.register(move |_: &u32| {
            let (lock, cvar) = &*g;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        });
        let (seen, cb) = collector::<u32>();
        let target = store.register(cb);

        let delivery = store.writer().write(7);
        // Changes after the snapshot do not affect the in-flight write.
        assert!(store.unregister(target));
        let (late, late_cb) = collector::<u32>();
        store.register(late_cb);

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        assert_eq!(delivery.wait().delivered, 2);
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert!(late.lock().unwrap().is_empty());
        assert!(store.unregister(blocker));
    }

    #[test]
    fn failures_are_isolated_and_reported() {
        let store = Store::with_workers(2).unwrap();
        let sunk = Arc::new(Mutex::new(Vec::new()));
        let s = sunk.clone();
        store.on_error(move |f: &CallbackFailure| s.lock().unwrap().push(f.clone()));

        let panicky = store.register_named("panicky", |_: &i32| panic!("kaboom"));
        let erring = store.register_fallible(|v: &i32| Err(format!("bad value {}", v)));
        let (seen, cb) = collector::<i32>();
        store.register(cb);

        let report = store.writer().write(3).wait();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![3]);

        let mut failures = report.failures.clone();
        failures.sort_by_key(|f| f.subscriber);
        assert_eq!(failures[0].subscriber, panicky);
        assert_eq!(failures[0].name.as_deref(), Some("panicky"));
        assert!(failures[0].panicked);
        assert!(failures[0].message.contains("kaboom"));
        assert_eq!(failures[1].subscriber, erring);
        assert_eq!(failures[1].message, "bad value 3");
        assert!(!failures[1].panicked);

        assert_eq!(sunk.lock().unwrap().len(), 2);
    }

    #[test]
    fn writer_sessions_are_counted() {
        let store = Store::<i32>::with_workers(1).unwrap();
        assert_eq!(store.active_writers(), 0);
        let w1 = store.writer();
        let w2 = w1.clone();
        assert_eq!(store.active_writers(), 2);
        drop(w1);
        assert_eq!(store.active_writers(), 1);
        drop(w2);
        assert_eq!(store.active_writers(), 0);
    }

    #[test]
    fn writer_released_on_panic() {
        let store = Arc::new(Store::<i32>::with_workers(1).unwrap());
        let s = store.clone();
        let r = std::thread::spawn(move || {
            let _w = s.writer();
            panic!("writer thread failed");
        })
        .join();
        assert!(r.is_err());
        assert_eq!(store.active_writers(), 0);
    }

    #[test]
    fn slow_subscriber_does_not_block_writer() {
        let store = Store::with_workers(2).unwrap();
        store.register(|_: &()| std::thread::sleep(Duration::from_millis(100)));
        let start = Instant::now();
        let delivery = store.writer().write(());
        assert!(start.elapsed() < Duration::from_millis(80));
        assert_eq!(delivery.wait_timeout(Duration::from_secs(5)).map(|r| r.delivered), Some(1));
    }

    #[test]
    fn wait_timeout_gives_up() {
        let store = Store::with_workers(1).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let r = release.clone();
        store.register(move |_: &()| {
            while !r.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let delivery = store.writer().write(());
        assert_eq!(delivery.wait_timeout(Duration::from_millis(10)), None);
        release.store(true, Ordering::SeqCst);
        assert!(delivery.wait_timeout(Duration::from_secs(5)).is_some());
    }

    #[test]
    fn writes_after_shutdown_fail_without_hanging() {
        let store = Store::with_workers(1).unwrap();
        let (seen, cb) = collector::<i32>();
        store.register(cb);
        let w = store.writer();
        w.write(1).wait();
        store.shutdown();
        let report = w.write(2).wait();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failures[0].message, "store is shut down");
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn debug_shows_counts() {
        let store = Store::<i32>::with_workers(1).unwrap();
        store.register(|_| ());
        let _w = store.writer();
        let text = format!("{:?}", store);
        assert!(text.contains("subscribers: 1"));
        assert!(text.contains("writers: 1"));
    }

    #[test]
    fn keyed_writes_stay_on_their_channel() {
        let store = Store::with_workers(2).unwrap();
        let (a, cb_a) = collector::<i32>();
        let (b, cb_b) = collector::<i32>();
        let (plain, cb_plain) = collector::<i32>();
        store.register_for("a", cb_a);
        store.register_for("b", cb_b);
        store.register(cb_plain);
        assert_eq!(store.len(), 3);
        assert_eq!(store.len_for("a"), 1);
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);

        let wa = store.writer_for("a");
        assert_eq!(wa.key(), Some("a"));
        assert_eq!(wa.write(1).wait().delivered, 1);
        assert_eq!(wa.clone().write(2).wait().delivered, 1);
        assert_eq!(store.writer().write(3).wait().delivered, 1);
        assert_eq!(store.writer_for("nobody").write(4).subscribers(), 0);

        assert_eq!(*a.lock().unwrap(), vec![1, 2]);
        assert!(b.lock().unwrap().is_empty());
        assert_eq!(*plain.lock().unwrap(), vec![3]);
    }

    #[test]
    fn unregister_finds_keyed_subscriber() {
        let store = Store::with_workers(1).unwrap();
        let (seen, cb) = collector::<u8>();
        let id = store.register_for("data", cb);
        let erring = store.register_fallible_for("data", |_: &u8| Err("nope"));
        let w = store.writer_for("data");
        let report = w.write(1).wait();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures[0].subscriber, erring);

        assert!(store.unregister(id));
        assert!(store.unregister(erring));
        assert!(!store.unregister(id));
        assert_eq!(store.len_for("data"), 0);
        assert!(store.keys().is_empty());
        assert_eq!(w.write(2).wait().delivered, 0);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn unregister_during_dispatch_never_duplicates() {
        let store = Arc::new(Store::with_workers(4).unwrap());
        let (stable, cb_stable) = collector::<u32>();
        let (leaving, cb_leaving) = collector::<u32>();
        store.register(cb_stable);
        let leaving_id = store.register(cb_leaving);

        let s = store.clone();
        let writer = std::thread::spawn(move || {
            let w = s.writer();
            (0..500u32).map(|i| w.write(i)).collect::<Vec<_>>()
        });
        while leaving.lock().unwrap().len() < 50 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(store.unregister(leaving_id));
        for delivery in writer.join().unwrap() {
            assert!(delivery.wait().failures.is_empty());
        }

        let mut stable = stable.lock().unwrap().clone();
        stable.sort_unstable();
        assert_eq!(stable, (0..500).collect::<Vec<_>>());

        let mut leaving = leaving.lock().unwrap().clone();
        let received = leaving.len();
        leaving.sort_unstable();
        leaving.dedup();
        assert_eq!(leaving.len(), received);
        assert!((50..=500).contains(&received));
    }
}
