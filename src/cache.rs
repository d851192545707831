//! The cache store: entries addressed by canonical key.
//!
//! Values of different types live side by side, so entries are stored behind
//! the object-safe [`AnyQuery`] trait and downcast back to their concrete
//! `QueryCell<V>` on typed access. Requesting a key with the wrong value type
//! is reported as [`InvalidKeyError::TypeMismatch`] instead of panicking.
//!
//! Lock order is always map shard first, then entry. Entries never touch the
//! map while holding their own lock.

mod entry;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::error::InvalidKeyError;
use crate::key::{CanonicalKey, QueryKey};
use crate::query::cell::QueryCell;

pub use entry::{FetchStatus, QueryState, QueryStatus};

/// Type-erased view of a cache entry used by key-family operations.
pub(crate) trait AnyQuery: Send + Sync {
    fn query_key(&self) -> &QueryKey;

    fn observer_count(&self) -> usize;

    fn is_fetching(&self) -> bool;

    /// Marks the entry invalid and, if it is observed and `refetch_active`,
    /// starts a new fetch generation.
    fn invalidate(self: Arc<Self>, refetch_active: bool);

    /// Cancels timers and any in-flight fetch. Called once the entry has left
    /// the map.
    fn detach_all(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

type Entries = DashMap<CanonicalKey, Arc<dyn AnyQuery>>;

/// Sharded map of every live entry.
#[derive(Clone, Default)]
pub(crate) struct QueryCache {
    entries: Arc<Entries>,
}

/// Weak handle held by entries so their GC timers can remove them.
#[derive(Clone)]
pub(crate) struct CacheRef(Weak<Entries>);

impl CacheRef {
    pub(crate) fn upgrade(&self) -> Option<QueryCache> {
        self.0.upgrade().map(|entries| QueryCache { entries })
    }
}

fn downcast<V>(
    canonical: &CanonicalKey,
    query: Arc<dyn AnyQuery>,
) -> Result<Arc<QueryCell<V>>, InvalidKeyError>
where
    V: Clone + Send + Sync + 'static,
{
    query.into_any().downcast::<QueryCell<V>>().map_err(|_| {
        warn!(key = %canonical, "query key requested with a different value type");
        InvalidKeyError::TypeMismatch {
            key: canonical.to_string(),
        }
    })
}

impl QueryCache {
    pub(crate) fn downgrade(&self) -> CacheRef {
        CacheRef(Arc::downgrade(&self.entries))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, canonical: &CanonicalKey) -> bool {
        self.entries.contains_key(canonical)
    }

    /// Looks up the typed entry for `canonical`.
    pub(crate) fn get<V>(
        &self,
        canonical: &CanonicalKey,
    ) -> Result<Option<Arc<QueryCell<V>>>, InvalidKeyError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let Some(query) = self.entries.get(canonical).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        downcast(canonical, query).map(Some)
    }

    /// Returns the entry for `canonical`, creating it with `create` if absent.
    ///
    /// `prepare` runs while the map shard is still locked, so an observer
    /// attached there cannot race with garbage collection of the same entry.
    /// The returned flag is `true` if the entry was created.
    pub(crate) fn upsert<V>(
        &self,
        canonical: &CanonicalKey,
        create: impl FnOnce() -> Arc<QueryCell<V>>,
        prepare: impl FnOnce(&Arc<QueryCell<V>>),
    ) -> Result<(Arc<QueryCell<V>>, bool), InvalidKeyError>
    where
        V: Clone + Send + Sync + 'static,
    {
        match self.entries.entry(canonical.clone()) {
            Entry::Occupied(occupied) => {
                let cell = downcast::<V>(canonical, occupied.get().clone())?;
                prepare(&cell);
                Ok((cell, false))
            }
            Entry::Vacant(vacant) => {
                let cell = create();
                prepare(&cell);
                let query: Arc<dyn AnyQuery> = cell.clone();
                vacant.insert(query);
                debug!(key = %canonical, "created cache entry");
                Ok((cell, true))
            }
        }
    }

    /// Collects the entries selected by `prefix`.
    ///
    /// With `exact`, only the entry whose canonical key equals the prefix's is
    /// selected. The map is released before the caller touches the entries.
    pub(crate) fn matching(&self, prefix: &QueryKey, exact: bool) -> Vec<Arc<dyn AnyQuery>> {
        if exact {
            return prefix
                .canonicalize()
                .ok()
                .and_then(|canonical| self.entries.get(&canonical))
                .map(|entry| vec![entry.value().clone()])
                .unwrap_or_default();
        }

        self.entries
            .iter()
            .filter(|entry| prefix.is_prefix_of(entry.value().query_key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Calls `f` on every entry matched by `prefix`.
    pub(crate) fn for_each_matching(
        &self,
        prefix: &QueryKey,
        exact: bool,
        mut f: impl FnMut(Arc<dyn AnyQuery>),
    ) -> usize {
        let matched = self.matching(prefix, exact);
        let count = matched.len();
        for query in matched {
            f(query);
        }
        count
    }

    pub(crate) fn fetching_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().is_fetching())
            .count()
    }

    /// Removes the entry unconditionally, cancelling its timers and fetch.
    pub(crate) fn remove(&self, canonical: &CanonicalKey) -> bool {
        match self.entries.remove(canonical) {
            Some((_, query)) => {
                query.detach_all();
                debug!(key = %canonical, "removed cache entry");
                true
            }
            None => false,
        }
    }

    /// Returns `true` if the entry stored under `canonical` is `query`.
    pub(crate) fn holds(&self, canonical: &CanonicalKey, query: &Arc<dyn AnyQuery>) -> bool {
        self.entries
            .get(canonical)
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current.value()), Arc::as_ptr(query)))
    }

    /// Removes the entry if it is still `query`, nobody observes it and no
    /// fetch is running for it.
    pub(crate) fn remove_if_idle(&self, canonical: &CanonicalKey, query: &Arc<dyn AnyQuery>) -> bool {
        let removed = self.entries.remove_if(canonical, |_, current| {
            std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(query))
                && current.observer_count() == 0
                && !current.is_fetching()
        });

        match removed {
            Some((_, query)) => {
                query.detach_all();
                debug!(key = %canonical, "garbage collected idle cache entry");
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&self) {
        let keys: Vec<CanonicalKey> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.remove(&key);
        }
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}
