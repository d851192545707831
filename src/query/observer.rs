use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

use crate::cache::QueryState;
use crate::config::QueryConfig;
use crate::error::InvalidKeyError;
use crate::key::{CanonicalKey, QueryKey};

use super::QueryClient;
use super::cell::{FetchMode, Fetcher, ObserverSlot, QueryCell};

struct Attached<V> {
    cell: Arc<QueryCell<V>>,
    rx: watch::Receiver<QueryState<V>>,
}

/// A live subscription to one query key.
///
/// Created by [`QueryClient::subscribe`]. While enabled, the observer keeps its
/// entry alive, receives every state change of the key and drives background
/// refetching. Dropping the observer unsubscribes it; once the last observer of
/// a key is gone the entry is garbage collected after its `cache_time`.
///
/// # Example
///
/// ```rust,ignore
/// let mut posts = client.subscribe(QueryOptions::new(["posts"], |_| fetch_posts()))?;
///
/// while posts.changed().await {
///     let state = posts.state();
///     if state.is_loading() {
///         render_spinner();
///     } else if let Some(posts) = state.data() {
///         render_posts(posts);
///     }
/// }
/// ```
pub struct QueryObserver<V>
where
    V: Clone + Send + Sync + 'static,
{
    id: u64,
    client: QueryClient,
    key: QueryKey,
    canonical: CanonicalKey,
    fetcher: Fetcher<V>,
    config: QueryConfig,
    attached: Option<Attached<V>>,
}

impl<V> QueryObserver<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: u64,
        client: QueryClient,
        key: QueryKey,
        canonical: CanonicalKey,
        fetcher: Fetcher<V>,
        config: QueryConfig,
    ) -> Result<Self, InvalidKeyError> {
        let mut observer = Self {
            id,
            client,
            key,
            canonical,
            fetcher,
            config,
            attached: None,
        };
        if observer.config.enabled {
            observer.attach()?;
        }
        Ok(observer)
    }

    fn attach(&mut self) -> Result<(), InvalidKeyError> {
        let slot = ObserverSlot::from(&self.config);
        let (cell, _) = self.client.cache().upsert(
            &self.canonical,
            || self.client.new_cell(&self.key, &self.canonical, &self.config),
            |cell| {
                cell.configure(Some(self.fetcher.clone()), &self.config);
                cell.attach(self.id, slot);
            },
        )?;

        trace!(key = %self.key, observer = self.id, "observer attached");
        let rx = cell.watch();
        let _ = cell.ensure_fresh(self.config.stale_time, FetchMode::IfStale);
        self.attached = Some(Attached { cell, rx });
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(attached) = self.attached.take() {
            trace!(key = %self.key, observer = self.id, "observer detached");
            attached.cell.detach(self.id);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Enables or disables the observer.
    ///
    /// This is how dependent queries are expressed: keep the observer disabled
    /// until the value it depends on is available. Enabling runs the usual
    /// freshness check, so it fetches at most once.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), InvalidKeyError> {
        self.config.enabled = enabled;
        match (enabled, self.attached.is_some()) {
            (true, false) => self.attach(),
            (false, true) => {
                self.detach();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The current state of the key.
    ///
    /// A disabled observer reports whatever the cache holds for its key, or the
    /// initial pending state if there is no entry.
    pub fn state(&self) -> QueryState<V> {
        match &self.attached {
            Some(attached) => attached.rx.borrow().clone(),
            None => self
                .client
                .cache()
                .get::<V>(&self.canonical)
                .ok()
                .flatten()
                .map(|cell| cell.snapshot())
                .unwrap_or_default(),
        }
    }

    /// Returns the data if the query has any.
    pub fn data(&self) -> Option<V> {
        self.state().data
    }

    /// Waits for the next state change. Returns `false` if the observer is
    /// disabled.
    pub async fn changed(&mut self) -> bool {
        match self.attached.as_mut() {
            Some(attached) => attached.rx.changed().await.is_ok(),
            None => false,
        }
    }

    /// Waits until no fetch is running for the key and returns the state.
    pub async fn settled(&mut self) -> QueryState<V> {
        if let Some(attached) = self.attached.as_mut() {
            let settled = attached
                .rx
                .wait_for(|state| !state.is_fetching())
                .await
                .map(|state| state.clone());
            return settled.unwrap_or_else(|_| attached.rx.borrow().clone());
        }
        self.state()
    }

    /// Starts a new fetch regardless of staleness and waits for it to settle.
    pub async fn refetch(&mut self) -> QueryState<V> {
        let pending = self
            .attached
            .as_ref()
            .and_then(|attached| attached.cell.ensure_fresh(self.config.stale_time, FetchMode::Force));
        if let Some(pending) = pending {
            let _ = pending.await;
        }
        self.state()
    }

    /// A stream of states: the current one first, then every change.
    pub fn stream(&self) -> BoxStream<'static, QueryState<V>> {
        match &self.attached {
            Some(attached) => WatchStream::new(attached.rx.clone()).boxed(),
            None => stream::once(futures::future::ready(self.state())).boxed(),
        }
    }

    pub(crate) fn cell(&self) -> Option<&Arc<QueryCell<V>>> {
        self.attached.as_ref().map(|attached| &attached.cell)
    }
}

impl<V> Drop for QueryObserver<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.detach();
    }
}
