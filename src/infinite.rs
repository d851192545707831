//! Infinite queries: one cache entry accumulating pages fetched by cursor.
//!
//! The entry's value is an [`InfiniteData`] holding every loaded page together
//! with the cursor it was fetched with. [`InfiniteQueryObserver::fetch_next_page`]
//! appends one page; any refetch (invalidation, interval or explicit) reloads
//! every page in order, starting from the first page's stored cursor and
//! recomputing each following cursor from the freshly fetched pages. Until the
//! refetch completes, observers keep seeing the old pages.
//!
//! Paginated (non-infinite) queries need no support here: make the page number
//! a key segment and each page becomes its own entry.
//!
//! # Example
//!
//! ```rust,ignore
//! let options = InfiniteQueryOptions::new(
//!     ["posts", "infinite"],
//!     1,
//!     |_, page| api::get_posts_page(page),
//!     |last: &PostsPage, _all| last.next_page,
//! );
//!
//! let mut posts = client.subscribe_infinite(options)?;
//! posts.settled().await;
//!
//! while posts.has_next_page() {
//!     posts.fetch_next_page().await;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::trace;

use crate::cache::QueryState;
use crate::config::{QueryConfig, RetryPolicy};
use crate::error::{InvalidKeyError, QueryError};
use crate::key::QueryKey;
use crate::query::cell::Fetcher;
use crate::query::{QueryClient, QueryContext, QueryObserver, QueryOptions};

/// Pages of an infinite query and the cursors they were fetched with.
///
/// `pages[i]` was fetched with `page_params[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteData<P, C> {
    pub pages: Vec<P>,
    pub page_params: Vec<C>,
}

impl<P, C> Default for InfiniteData<P, C> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

impl<P, C> InfiniteData<P, C> {
    fn push(&mut self, page: P, cursor: C) {
        self.pages.push(page);
        self.page_params.push(cursor);
    }
}

type PageFetcher<P, C> =
    Arc<dyn Fn(QueryContext, C) -> BoxFuture<'static, Result<P, QueryError>> + Send + Sync>;
type NextCursor<P, C> = Arc<dyn Fn(&P, &[P]) -> Option<C> + Send + Sync>;

struct Pager<P, C> {
    fetch_page: PageFetcher<P, C>,
    next_cursor: NextCursor<P, C>,
    initial_cursor: C,
}

impl<P, C> Pager<P, C>
where
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn next_cursor(&self, data: &InfiniteData<P, C>) -> Option<C> {
        let last = data.pages.last()?;
        (self.next_cursor)(last, &data.pages)
    }

    async fn fetch(&self, context: &QueryContext, cursor: C) -> Result<P, QueryError> {
        trace!(key = %context.key, attempt = context.attempt, "fetching page");
        (self.fetch_page)(context.clone(), cursor).await
    }

    /// Reloads as many pages as `previous` holds (at least one).
    async fn reload(
        self: Arc<Self>,
        context: QueryContext,
        previous: Option<InfiniteData<P, C>>,
    ) -> Result<InfiniteData<P, C>, QueryError> {
        let (first, count) = match previous {
            Some(previous) if !previous.pages.is_empty() => {
                let first = previous
                    .page_params
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.initial_cursor.clone());
                (first, previous.pages.len())
            }
            _ => (self.initial_cursor.clone(), 1),
        };

        let mut data = InfiniteData::default();
        let mut cursor = Some(first);
        while let Some(current) = cursor.take() {
            let page = self.fetch(&context, current.clone()).await?;
            data.push(page, current);
            if data.pages.len() >= count {
                break;
            }
            cursor = self.next_cursor(&data);
        }
        Ok(data)
    }

    /// Appends the page after the last one in `previous`.
    async fn append(
        self: Arc<Self>,
        context: QueryContext,
        previous: Option<InfiniteData<P, C>>,
    ) -> Result<InfiniteData<P, C>, QueryError> {
        let Some(mut data) = previous.filter(|data| !data.pages.is_empty()) else {
            return self.reload(context, None).await;
        };
        let Some(cursor) = self.next_cursor(&data) else {
            return Ok(data);
        };
        let page = self.fetch(&context, cursor.clone()).await?;
        data.push(page, cursor);
        Ok(data)
    }

    fn reload_fetcher(self: &Arc<Self>) -> Fetcher<InfiniteData<P, C>> {
        let pager = Arc::clone(self);
        Arc::new(move |context, previous| Arc::clone(&pager).reload(context, previous).boxed())
    }

    fn append_fetcher(self: &Arc<Self>) -> Fetcher<InfiniteData<P, C>> {
        let pager = Arc::clone(self);
        Arc::new(move |context, previous| Arc::clone(&pager).append(context, previous).boxed())
    }
}

/// Describes an infinite query.
pub struct InfiniteQueryOptions<P, C> {
    query: QueryOptions<InfiniteData<P, C>>,
    pager: Arc<Pager<P, C>>,
}

impl<P, C> InfiniteQueryOptions<P, C>
where
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    /// Creates infinite query options.
    ///
    /// # Arguments
    ///
    /// * `key` - Key of the single entry holding all pages
    /// * `initial_cursor` - Cursor of the first page
    /// * `fetch_page` - Fetches one page at a cursor
    /// * `get_next_cursor` - Cursor following `last_page`, or `None` if it is
    ///   the last one
    pub fn new<F, Fut, N>(
        key: impl Into<QueryKey>,
        initial_cursor: C,
        fetch_page: F,
        get_next_cursor: N,
    ) -> Self
    where
        F: Fn(QueryContext, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P, QueryError>> + Send + 'static,
        N: Fn(&P, &[P]) -> Option<C> + Send + Sync + 'static,
    {
        let pager = Arc::new(Pager {
            fetch_page: Arc::new(move |context, cursor| fetch_page(context, cursor).boxed()),
            next_cursor: Arc::new(get_next_cursor),
            initial_cursor,
        });
        let query = QueryOptions::from_fetcher(key.into(), pager.reload_fetcher());
        Self { query, pager }
    }

    pub fn key(&self) -> &QueryKey {
        self.query.key()
    }

    #[must_use]
    pub fn config(mut self, config: QueryConfig) -> Self {
        self.query = self.query.config(config);
        self
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.query = self.query.stale_time(stale_time);
        self
    }

    #[must_use]
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.query = self.query.cache_time(cache_time);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.query = self.query.retry(retry);
        self
    }

    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.query = self.query.refetch_interval(interval);
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.query = self.query.enabled(enabled);
        self
    }
}

/// A live subscription to an infinite query.
///
/// Wraps a [`QueryObserver`] over the accumulated [`InfiniteData`] and adds
/// page navigation.
pub struct InfiniteQueryObserver<P, C>
where
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    observer: QueryObserver<InfiniteData<P, C>>,
    pager: Arc<Pager<P, C>>,
}

impl<P, C> InfiniteQueryObserver<P, C>
where
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &QueryKey {
        self.observer.key()
    }

    pub fn state(&self) -> QueryState<InfiniteData<P, C>> {
        self.observer.state()
    }

    pub fn data(&self) -> Option<InfiniteData<P, C>> {
        self.observer.data()
    }

    /// The loaded pages, oldest first.
    pub fn pages(&self) -> Vec<P> {
        self.data().map(|data| data.pages).unwrap_or_default()
    }

    /// Returns `true` if pages are loaded and the last one has a successor.
    pub fn has_next_page(&self) -> bool {
        self.data().is_some_and(|data| self.pager.next_cursor(&data).is_some())
    }

    /// Fetches the page after the last loaded one and waits for it.
    ///
    /// Does nothing when the last page has no successor. While another fetch
    /// of this key is running, waits for that fetch instead of starting one.
    pub async fn fetch_next_page(&mut self) -> QueryState<InfiniteData<P, C>> {
        let Some(cell) = self.observer.cell().cloned() else {
            return self.state();
        };

        let exhausted = self
            .data()
            .is_some_and(|data| !data.pages.is_empty() && self.pager.next_cursor(&data).is_none());
        if exhausted {
            trace!(key = %self.key(), "no next page");
            return self.state();
        }

        let _ = cell.fetch_with(self.pager.append_fetcher()).await;
        self.state()
    }

    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), InvalidKeyError> {
        self.observer.set_enabled(enabled)
    }

    pub async fn changed(&mut self) -> bool {
        self.observer.changed().await
    }

    pub async fn settled(&mut self) -> QueryState<InfiniteData<P, C>> {
        self.observer.settled().await
    }

    /// Reloads every loaded page.
    pub async fn refetch(&mut self) -> QueryState<InfiniteData<P, C>> {
        self.observer.refetch().await
    }

    pub fn stream(&self) -> BoxStream<'static, QueryState<InfiniteData<P, C>>> {
        self.observer.stream()
    }
}

impl QueryClient {
    /// Starts observing an infinite query. The first page is fetched like any
    /// other query.
    pub fn subscribe_infinite<P, C>(
        &self,
        options: InfiniteQueryOptions<P, C>,
    ) -> Result<InfiniteQueryObserver<P, C>, InvalidKeyError>
    where
        P: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
    {
        let observer = self.subscribe(options.query)?;
        Ok(InfiniteQueryObserver {
            observer,
            pager: options.pager,
        })
    }

    /// Loads the first page of an infinite query ahead of a subscription.
    pub async fn prefetch_infinite<P, C>(
        &self,
        options: InfiniteQueryOptions<P, C>,
    ) -> Result<(), InvalidKeyError>
    where
        P: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
    {
        self.prefetch(options.query).await
    }
}
