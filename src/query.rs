//! Query operations with caching and automatic refetching.
//!
//! This module provides the [`QueryClient`], the explicitly owned cache engine,
//! and [`QueryOptions`], the per-query description passed to it.
//!
//! # Design Pattern: Subscription-based State Management
//!
//! Queries are **subscriptions** that continuously monitor and manage cached
//! data. When you subscribe to a query:
//!
//! 1. If fresh cached data exists, it's served without a fetch
//! 2. If data is stale or missing, a fetch is triggered (and shared with any
//!    fetch already running for the key)
//! 3. When the key is invalidated, active observers refetch automatically
//!
//! # Example
//!
//! ```rust,ignore
//! use tears_query::{InvalidateOptions, QueryClient, QueryOptions};
//!
//! let client = QueryClient::new();
//!
//! let mut posts = client.subscribe(QueryOptions::new(["posts"], |_| api::get_posts()))?;
//! let state = posts.settled().await;
//!
//! // After creating a post, refetch the list (but not individual posts)
//! client.invalidate(["posts"], InvalidateOptions::exact())?;
//! ```

pub(crate) mod cell;
mod observer;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::debug;

use crate::cache::{QueryCache, QueryState};
use crate::config::{ClientConfig, QueryConfig, RetryPolicy};
use crate::error::{InvalidKeyError, QueryError};
use crate::key::{CanonicalKey, QueryKey};

use cell::{FetchMode, Fetcher, QueryCell};

pub use cell::QueryContext;
pub use observer::QueryObserver;

/// Per-field overrides of the client's default [`QueryConfig`].
#[derive(Debug, Clone, Default)]
struct Overrides {
    base: Option<QueryConfig>,
    stale_time: Option<Duration>,
    cache_time: Option<Duration>,
    retry: Option<RetryPolicy>,
    refetch_interval: Option<Option<Duration>>,
    enabled: Option<bool>,
}

impl Overrides {
    fn resolve(&self, defaults: &QueryConfig) -> QueryConfig {
        let mut config = self.base.clone().unwrap_or_else(|| defaults.clone());
        if let Some(stale_time) = self.stale_time {
            config.stale_time = stale_time;
        }
        if let Some(cache_time) = self.cache_time {
            config.cache_time = cache_time;
        }
        if let Some(retry) = self.retry {
            config.retry = retry;
        }
        if let Some(refetch_interval) = self.refetch_interval {
            config.refetch_interval = refetch_interval;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        config
    }
}

/// Describes a query: its key, how to fetch it, and how to cache it.
///
/// Settings that are not overridden fall back to the client's
/// [`ClientConfig::queries`].
pub struct QueryOptions<V> {
    key: QueryKey,
    fetcher: Fetcher<V>,
    overrides: Overrides,
}

impl<V> Clone for QueryOptions<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetcher: self.fetcher.clone(),
            overrides: self.overrides.clone(),
        }
    }
}

impl<V> QueryOptions<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates query options with the given key and query function.
    ///
    /// # Arguments
    ///
    /// * `key` - A structured key uniquely identifying the resource
    /// * `query_fn` - An async function that fetches the data; it should only
    ///   depend on the key, since concurrent requests for one key are shared
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let post = QueryOptions::new(query_key!["posts", id], move |_| api::get_post(id));
    /// ```
    pub fn new<F, Fut>(key: impl Into<QueryKey>, query_fn: F) -> Self
    where
        F: Fn(QueryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let fetcher: Fetcher<V> =
            Arc::new(move |context: QueryContext, _previous: Option<V>| query_fn(context).boxed());
        Self::from_fetcher(key.into(), fetcher)
    }

    pub(crate) fn from_fetcher(key: QueryKey, fetcher: Fetcher<V>) -> Self {
        Self {
            key,
            fetcher,
            overrides: Overrides::default(),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Replaces the client defaults entirely.
    #[must_use]
    pub fn config(mut self, config: QueryConfig) -> Self {
        self.overrides.base = Some(config);
        self
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.overrides.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.overrides.cache_time = Some(cache_time);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.overrides.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.overrides.refetch_interval = Some(Some(interval));
        self
    }

    /// Gates the query; see [`QueryObserver::set_enabled`].
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.overrides.enabled = Some(enabled);
        self
    }
}

/// Selects which entries [`QueryClient::invalidate`] affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateOptions {
    /// Match only the entry whose key equals the given key, not its family.
    pub exact: bool,
    /// Immediately refetch invalidated entries that have observers.
    pub refetch_active: bool,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        Self {
            exact: false,
            refetch_active: true,
        }
    }
}

impl InvalidateOptions {
    /// Options matching a single key exactly.
    #[must_use]
    pub fn exact() -> Self {
        Self {
            exact: true,
            ..Self::default()
        }
    }

    /// Only mark entries invalid; they refetch on their next subscription.
    #[must_use]
    pub const fn without_refetch(mut self) -> Self {
        self.refetch_active = false;
        self
    }
}

struct ClientInner {
    cache: QueryCache,
    config: ClientConfig,
    online: watch::Sender<bool>,
    next_observer: AtomicU64,
}

/// A client for managing the query cache.
///
/// The `QueryClient` is the central state manager for queries. It handles:
/// - Caching query results by structured key
/// - Deduplicating, retrying and refetching fetches
/// - Invalidation of single keys or key families
/// - Direct cache writes after mutations
///
/// The client is a cheap handle: clones share the same cache. It must be used
/// from within a Tokio runtime, which runs background fetches and timers.
///
/// # Example
///
/// ```rust
/// use tears_query::{ClientConfig, QueryClient, QueryConfig};
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     queries: QueryConfig::new(
///         Duration::from_secs(30),  // stale_time
///         Duration::from_secs(300), // cache_time
///     ),
///     ..ClientConfig::default()
/// };
///
/// let client = QueryClient::with_config(config);
/// assert!(client.is_empty());
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            inner: Arc::new(ClientInner {
                cache: QueryCache::default(),
                config,
                online,
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    /// Gets the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub(crate) fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub(crate) fn new_cell<V>(
        &self,
        key: &QueryKey,
        canonical: &CanonicalKey,
        config: &QueryConfig,
    ) -> Arc<QueryCell<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        QueryCell::new(
            key.clone(),
            canonical.clone(),
            self.cache().downgrade(),
            self.inner.online.subscribe(),
            config,
        )
    }

    /// Finds or creates the entry for `key` without attaching an observer.
    fn unobserved_cell<V>(
        &self,
        key: &QueryKey,
        fetcher: Option<Fetcher<V>>,
        config: &QueryConfig,
    ) -> Result<Arc<QueryCell<V>>, InvalidKeyError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let canonical = key.canonicalize()?;
        let (cell, created) = self.cache().upsert(
            &canonical,
            || self.new_cell(key, &canonical, config),
            |cell| cell.configure(fetcher, config),
        )?;
        if created {
            cell.schedule_gc_if_unobserved();
        }
        Ok(cell)
    }

    /// Starts observing a query.
    ///
    /// Registers the observer, cancels any pending garbage collection of the
    /// key and fetches if the cached data is missing or stale. A disabled query
    /// creates nothing until it is enabled.
    ///
    /// # Errors
    ///
    /// Fails synchronously if the key is malformed or already cached with a
    /// different value type. Fetch failures are never returned here; they show
    /// up in the observer's state.
    pub fn subscribe<V>(&self, options: QueryOptions<V>) -> Result<QueryObserver<V>, InvalidKeyError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let canonical = options.key.canonicalize()?;
        let config = options.overrides.resolve(&self.inner.config.queries);
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        QueryObserver::new(id, self.clone(), options.key, canonical, options.fetcher, config)
    }

    /// Populates the cache ahead of a subscription.
    ///
    /// Behaves like a subscription's freshness check without registering an
    /// observer. Fetch failures are recorded on the entry, not returned.
    pub async fn prefetch<V>(&self, options: QueryOptions<V>) -> Result<(), InvalidKeyError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let config = options.overrides.resolve(&self.inner.config.queries);
        if !config.enabled {
            return Ok(());
        }
        let cell = self.unobserved_cell(&options.key, Some(options.fetcher), &config)?;
        if let Some(pending) = cell.ensure_fresh(config.stale_time, FetchMode::IfStale) {
            if let Err(error) = pending.await {
                debug!(key = %options.key, %error, "prefetch failed");
            }
        }
        Ok(())
    }

    /// Returns the data for a query, fetching it if missing or stale.
    ///
    /// Unlike [`prefetch`](Self::prefetch), the fetch error is returned.
    pub async fn fetch_query<V>(&self, options: QueryOptions<V>) -> Result<V, QueryError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let config = options.overrides.resolve(&self.inner.config.queries);
        let cell = self.unobserved_cell(&options.key, Some(options.fetcher), &config)?;
        if let Some(pending) = cell.ensure_fresh(config.stale_time, FetchMode::IfStale) {
            return pending.await;
        }
        let state = cell.snapshot();
        match (state.data, state.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            (None, None) => Err(QueryError::fetch("query has no data")),
        }
    }

    /// Returns the state of the entry for `key`, if one exists with value type `V`.
    pub fn get_query_state<V>(&self, key: impl Into<QueryKey>) -> Option<QueryState<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let canonical = key.into().canonicalize().ok()?;
        self.cache()
            .get::<V>(&canonical)
            .ok()
            .flatten()
            .map(|cell| cell.snapshot())
    }

    /// Returns the cached data for `key`, if any.
    pub fn get_query_data<V>(&self, key: impl Into<QueryKey>) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.get_query_state(key).and_then(|state| state.data)
    }

    /// Writes `data` into the cache for `key`, creating the entry if needed.
    ///
    /// The entry becomes fresh and valid, and its observers are notified.
    pub fn set_query_data<V>(&self, key: impl Into<QueryKey>, data: V) -> Result<(), InvalidKeyError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let key = key.into();
        let cell = self.unobserved_cell::<V>(&key, None, &self.inner.config.queries)?;
        cell.set_data(data);
        Ok(())
    }

    /// Replaces the cached data for `key` with `update(current)`.
    ///
    /// `update` receives the previous data by reference and must build a new
    /// value rather than mutating it.
    pub fn update_query_data<V, F>(&self, key: impl Into<QueryKey>, update: F) -> Result<(), InvalidKeyError>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(Option<&V>) -> V,
    {
        let key = key.into();
        let cell = self.unobserved_cell::<V>(&key, None, &self.inner.config.queries)?;
        cell.update_data(update);
        Ok(())
    }

    /// Marks every entry selected by `key` as invalid.
    ///
    /// Observed entries refetch immediately (unless disabled in `options`),
    /// superseding any fetch already running. Unobserved entries refetch on
    /// their next subscription. Returns the number of entries matched.
    ///
    /// # Errors
    ///
    /// Fails if `key` contains a non-finite number, or if it is empty and
    /// `options.exact` is set. An empty non-exact key matches every entry.
    pub fn invalidate(
        &self,
        key: impl Into<QueryKey>,
        options: InvalidateOptions,
    ) -> Result<usize, InvalidKeyError> {
        let key = key.into();
        if options.exact {
            key.validate()?;
        } else {
            key.check_segments()?;
        }

        let count = self
            .cache()
            .for_each_matching(&key, options.exact, |query| query.invalidate(options.refetch_active));
        debug!(key = %key, exact = options.exact, count, "invalidated queries");
        Ok(count)
    }

    /// Removes the entry for `key`, cancelling its timers and any running fetch.
    pub fn remove(&self, key: impl Into<QueryKey>) -> bool {
        match key.into().canonicalize() {
            Ok(canonical) => self.cache().remove(&canonical),
            Err(_) => false,
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.cache().clear();
    }

    pub fn contains(&self, key: impl Into<QueryKey>) -> bool {
        key.into()
            .canonicalize()
            .is_ok_and(|canonical| self.cache().contains(&canonical))
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries with a fetch running or paused.
    pub fn is_fetching(&self) -> usize {
        self.cache().fetching_count()
    }

    /// Sets connectivity. While offline, fetch attempts pause (reported as
    /// [`FetchStatus::Paused`](crate::FetchStatus::Paused)) and resume once
    /// back online.
    pub fn set_online(&self, online: bool) {
        self.inner.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.inner.cache)
            .field("config", &self.inner.config)
            .field("online", &self.is_online())
            .finish()
    }
}
