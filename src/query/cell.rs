//! Per-key query execution.
//!
//! A [`QueryCell`] owns everything the cache knows about one key: the
//! observable [`QueryState`], the registered fetch function, the observers, the
//! shared in-flight request and the entry's timers. All read-modify-write of the
//! state happens under the cell's mutex, which is never held across an `.await`.
//!
//! # Fetch generations
//!
//! Every started fetch gets the next generation number. Only the completion of
//! the most recently started generation may write to the entry; older
//! completions are discarded. This is what makes "latest request wins" hold even
//! when an older fetch resolves after a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{AnyQuery, CacheRef, FetchStatus, QueryCache, QueryState};
use crate::config::{QueryConfig, RetryPolicy};
use crate::error::QueryError;
use crate::key::{CanonicalKey, QueryKey};
use crate::timer::{TimerHandle, spawn_after, spawn_interval};

pub(crate) type BoxFetch<V> = BoxFuture<'static, Result<V, QueryError>>;

/// Type-erased fetch function. Receives the data held by the entry when the
/// fetch started, which infinite queries use to refetch every loaded page.
pub(crate) type Fetcher<V> = Arc<dyn Fn(QueryContext, Option<V>) -> BoxFetch<V> + Send + Sync>;

pub(crate) type SharedFetch<V> = Shared<BoxFetch<V>>;

/// Information passed to a query function on every attempt.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// The key being fetched.
    pub key: QueryKey,
    /// Zero for the first attempt, incremented on every retry.
    pub attempt: u32,
}

/// How [`QueryCell::ensure_fresh`] decides whether to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Fetch only if stale; join an in-flight request.
    IfStale,
    /// Fetch regardless of staleness; join an in-flight request.
    IgnoreStale,
    /// Start a new generation, superseding any in-flight request.
    Force,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ObserverSlot {
    pub(crate) refetch_interval: Option<Duration>,
}

impl From<&QueryConfig> for ObserverSlot {
    fn from(config: &QueryConfig) -> Self {
        Self {
            refetch_interval: config.refetch_interval,
        }
    }
}

struct InFlight<V> {
    generation: u64,
    future: SharedFetch<V>,
    token: CancellationToken,
}

struct CellInner<V> {
    state: QueryState<V>,
    fetcher: Option<Fetcher<V>>,
    retry: RetryPolicy,
    cache_time: Duration,
    observers: HashMap<u64, ObserverSlot>,
    in_flight: Option<InFlight<V>>,
    generation: u64,
    gc_timer: Option<TimerHandle>,
    /// Collection came due while a fetch was running; retried when it settles.
    gc_deferred: bool,
    refetch_timer: Option<(Duration, TimerHandle)>,
}

pub(crate) struct QueryCell<V> {
    key: QueryKey,
    canonical: CanonicalKey,
    cache: CacheRef,
    online: watch::Receiver<bool>,
    inner: Mutex<CellInner<V>>,
    state_tx: watch::Sender<QueryState<V>>,
}

impl<V> QueryCell<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        key: QueryKey,
        canonical: CanonicalKey,
        cache: CacheRef,
        online: watch::Receiver<bool>,
        config: &QueryConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(QueryState::default());
        Arc::new(Self {
            key,
            canonical,
            cache,
            online,
            inner: Mutex::new(CellInner {
                state: QueryState::default(),
                fetcher: None,
                retry: config.retry,
                cache_time: config.cache_time,
                observers: HashMap::new(),
                in_flight: None,
                generation: 0,
                gc_timer: None,
                gc_deferred: false,
                refetch_timer: None,
            }),
            state_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, CellInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers the current state to every observer of this key.
    fn publish(&self, state: &QueryState<V>) {
        self.state_tx.send_replace(state.clone());
    }

    pub(crate) fn snapshot(&self) -> QueryState<V> {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<QueryState<V>> {
        self.state_tx.subscribe()
    }

    /// Registers the latest fetch function and merges `config` into the
    /// entry's shared settings.
    pub(crate) fn configure(&self, fetcher: Option<Fetcher<V>>, config: &QueryConfig) {
        let mut inner = self.lock();
        if let Some(fetcher) = fetcher {
            inner.fetcher = Some(fetcher);
            inner.retry = config.retry;
        }
        inner.cache_time = inner.cache_time.max(config.cache_time);
    }

    /// Writes `data` directly, as a mutation's cache update would.
    pub(crate) fn set_data(&self, data: V) {
        let mut inner = self.lock();
        inner.state.set(data);
        self.publish(&inner.state);
    }

    /// Replaces the data with `update(current)`.
    pub(crate) fn update_data(&self, update: impl FnOnce(Option<&V>) -> V) {
        let mut inner = self.lock();
        let data = update(inner.state.data.as_ref());
        inner.state.set(data);
        self.publish(&inner.state);
    }

    /// Runs the fetch decision algorithm and returns the request to await, if
    /// any.
    pub(crate) fn ensure_fresh(
        self: &Arc<Self>,
        stale_time: Duration,
        mode: FetchMode,
    ) -> Option<SharedFetch<V>> {
        let mut inner = self.lock();

        if mode == FetchMode::IfStale && !inner.state.is_stale(stale_time) {
            trace!(key = %self.key, "serving fresh data from cache");
            return None;
        }

        if mode != FetchMode::Force {
            if let Some(in_flight) = &inner.in_flight {
                trace!(key = %self.key, generation = in_flight.generation, "joining in-flight fetch");
                return Some(in_flight.future.clone());
            }
        }

        let fetcher = inner.fetcher.clone()?;
        Some(self.start_fetch(&mut inner, fetcher))
    }

    /// Joins the in-flight request or starts one with a one-off `fetcher`.
    ///
    /// The registered fetch function is left untouched, so later refetches
    /// keep using it.
    pub(crate) fn fetch_with(self: &Arc<Self>, fetcher: Fetcher<V>) -> SharedFetch<V> {
        let mut inner = self.lock();
        if let Some(in_flight) = &inner.in_flight {
            return in_flight.future.clone();
        }
        self.start_fetch(&mut inner, fetcher)
    }

    fn start_fetch(
        self: &Arc<Self>,
        inner: &mut CellInner<V>,
        fetcher: Fetcher<V>,
    ) -> SharedFetch<V> {
        inner.generation += 1;
        let generation = inner.generation;
        let token = CancellationToken::new();
        let previous = inner.state.data.clone();

        inner.state.begin_fetch(*self.online.borrow());
        self.publish(&inner.state);
        debug!(key = %self.key, generation, "starting fetch");

        let future = Arc::clone(self)
            .run(generation, fetcher, inner.retry, token.clone(), previous)
            .boxed()
            .shared();

        if let Some(superseded) = inner.in_flight.replace(InFlight {
            generation,
            future: future.clone(),
            token,
        }) {
            debug!(
                key = %self.key,
                superseded = superseded.generation,
                generation,
                "fetch superseded by a newer generation"
            );
        }

        // Drive the request even when nobody awaits it. Without a runtime the
        // first awaiter drives it instead.
        if let Ok(runtime) = Handle::try_current() {
            runtime.spawn(future.clone());
        }

        future
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        fetcher: Fetcher<V>,
        retry: RetryPolicy,
        token: CancellationToken,
        previous: Option<V>,
    ) -> Result<V, QueryError> {
        let mut failures = 0;
        loop {
            if !self.wait_online(generation, &token).await {
                return self.cancelled(generation);
            }

            let context = QueryContext {
                key: self.key.clone(),
                attempt: failures,
            };
            let attempt = fetcher(context, previous.clone());
            let outcome = tokio::select! {
                () = token.cancelled() => return self.cancelled(generation),
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(data) => {
                    self.finish(generation, |state| state.succeed(data.clone()));
                    return Ok(data);
                }
                Err(error) => {
                    failures += 1;
                    if !retry.should_retry(failures) {
                        debug!(key = %self.key, generation, failures, %error, "fetch failed");
                        self.finish(generation, |state| state.fail(error.clone(), failures));
                        return Err(error);
                    }

                    let delay = retry.delay_for(failures);
                    debug!(key = %self.key, generation, failures, ?delay, %error, "retrying fetch");
                    self.update_if_current(generation, |state| state.record_retry(failures));

                    tokio::select! {
                        () = token.cancelled() => return self.cancelled(generation),
                        () = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Waits until the client is online. Returns `false` if cancelled first.
    async fn wait_online(&self, generation: u64, token: &CancellationToken) -> bool {
        let mut online = self.online.clone();
        if *online.borrow() {
            return true;
        }

        debug!(key = %self.key, generation, "offline; fetch paused");
        self.update_if_current(generation, |state| state.fetch_status = FetchStatus::Paused);

        let resumed = tokio::select! {
            () = token.cancelled() => false,
            result = online.wait_for(|is_online| *is_online) => result.is_ok(),
        };
        if resumed {
            self.update_if_current(generation, |state| {
                state.fetch_status = FetchStatus::Fetching;
            });
        }
        resumed
    }

    fn cancelled(self: &Arc<Self>, generation: u64) -> Result<V, QueryError> {
        debug!(key = %self.key, generation, "fetch cancelled");
        self.finish(generation, |state| state.fetch_status = FetchStatus::Idle);
        Err(QueryError::Cancelled)
    }

    /// Applies a mid-flight update if `generation` is still the latest.
    fn update_if_current(&self, generation: u64, update: impl FnOnce(&mut QueryState<V>)) {
        let mut inner = self.lock();
        if inner.generation == generation {
            update(&mut inner.state);
            self.publish(&inner.state);
        }
    }

    /// Settles `generation`, discarding the outcome if a newer fetch started.
    fn finish(self: &Arc<Self>, generation: u64, settle: impl FnOnce(&mut QueryState<V>)) {
        let mut inner = self.lock();
        if inner
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            inner.in_flight = None;
        }

        if inner.generation != generation {
            debug!(
                key = %self.key,
                generation,
                latest = inner.generation,
                "discarding superseded fetch result"
            );
            return;
        }

        settle(&mut inner.state);
        self.publish(&inner.state);

        if inner.gc_deferred && inner.observers.is_empty() && inner.in_flight.is_none() {
            inner.gc_deferred = false;
            inner.gc_timer = self.schedule_gc(inner.cache_time);
        }
    }

    /// Registers an observer and cancels any pending garbage collection.
    pub(crate) fn attach(self: &Arc<Self>, id: u64, slot: ObserverSlot) {
        let mut inner = self.lock();
        inner.observers.insert(id, slot);
        inner.gc_timer = None;
        inner.gc_deferred = false;
        self.reschedule_refetch(&mut inner);
    }

    /// Removes an observer; the last one out starts the GC timer and stops
    /// background refetching. In-flight fetches keep running.
    pub(crate) fn detach(self: &Arc<Self>, id: u64) {
        let mut inner = self.lock();
        if inner.observers.remove(&id).is_none() {
            return;
        }
        self.reschedule_refetch(&mut inner);
        if inner.observers.is_empty() {
            inner.gc_timer = self.schedule_gc(inner.cache_time);
        }
    }

    /// Starts the GC timer for an entry created without observers.
    pub(crate) fn schedule_gc_if_unobserved(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.observers.is_empty() && inner.gc_timer.is_none() {
            inner.gc_timer = self.schedule_gc(inner.cache_time);
        }
    }

    fn schedule_gc(self: &Arc<Self>, cache_time: Duration) -> Option<TimerHandle> {
        let cache = self.cache.clone();
        let canonical = self.canonical.clone();
        let cell: Weak<Self> = Arc::downgrade(self);

        trace!(key = %self.key, ?cache_time, "scheduling garbage collection");
        spawn_after(cache_time, move || {
            let (Some(cache), Some(cell)) = (cache.upgrade(), cell.upgrade()) else {
                return;
            };
            cell.collect(&cache, &canonical);
        })
    }

    /// Evicts the entry once it is unobserved and no fetch is running. A
    /// running fetch defers collection until it settles, so its result stays
    /// available to later subscribers.
    fn collect(self: &Arc<Self>, cache: &QueryCache, canonical: &CanonicalKey) {
        let query: Arc<dyn AnyQuery> = Arc::clone(self) as Arc<dyn AnyQuery>;
        loop {
            {
                let mut inner = self.lock();
                if !inner.observers.is_empty() {
                    return;
                }
                if inner.state.is_fetching() {
                    trace!(key = %self.key, "fetch running; deferring garbage collection");
                    inner.gc_deferred = true;
                    return;
                }
            }
            // The entry lock is released before the map is touched.
            if cache.remove_if_idle(canonical, &query) || !cache.holds(canonical, &query) {
                return;
            }
        }
    }

    fn reschedule_refetch(self: &Arc<Self>, inner: &mut CellInner<V>) {
        let period = inner
            .observers
            .values()
            .filter_map(|slot| slot.refetch_interval)
            .filter(|period| !period.is_zero())
            .min();

        let current = inner.refetch_timer.as_ref().map(|(current, _)| *current);
        if period == current {
            return;
        }

        inner.refetch_timer = period.and_then(|period| {
            let cell = Arc::downgrade(self);
            spawn_interval(period, move || {
                let Some(cell) = cell.upgrade() else {
                    return false;
                };
                trace!(key = %cell.key, "interval refetch");
                let _ = cell.ensure_fresh(Duration::ZERO, FetchMode::IgnoreStale);
                true
            })
            .map(|handle| (period, handle))
        });
    }
}

impl<V> AnyQuery for QueryCell<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn query_key(&self) -> &QueryKey {
        &self.key
    }

    fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    fn is_fetching(&self) -> bool {
        self.lock().state.is_fetching()
    }

    fn invalidate(self: Arc<Self>, refetch_active: bool) {
        let active = {
            let mut inner = self.lock();
            inner.state.invalidate();
            self.publish(&inner.state);
            !inner.observers.is_empty()
        };

        if active && refetch_active {
            debug!(key = %self.key, "invalidated; refetching for active observers");
            let _ = self.ensure_fresh(Duration::ZERO, FetchMode::Force);
        }
    }

    fn detach_all(&self) {
        let mut inner = self.lock();
        inner.gc_timer = None;
        inner.gc_deferred = false;
        inner.refetch_timer = None;
        if let Some(in_flight) = inner.in_flight.take() {
            in_flight.token.cancel();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
