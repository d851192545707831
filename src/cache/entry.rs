use std::time::Duration;

use tokio::time::Instant;

use crate::error::QueryError;

/// Whether a query has produced data yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data and no final error yet.
    Pending,
    /// The last completed fetch (or direct write) produced data.
    Success,
    /// Retries were exhausted; `error` holds the last failure.
    Error,
}

/// Whether a fetch is currently running for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    /// A fetch is due but the client is offline.
    Paused,
}

/// Observable state of one cache entry.
///
/// `status` and `fetch_status` are independent: a query can be `Success` and
/// `Fetching` at the same time while stale data is revalidated in the
/// background.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub error: Option<QueryError>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    /// When data was last written.
    pub updated_at: Option<Instant>,
    pub is_invalidated: bool,
    /// Consecutive failures of the current (or last) fetch.
    pub retry_count: u32,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            updated_at: None,
            is_invalidated: false,
            retry_count: 0,
        }
    }
}

impl<T> QueryState<T> {
    /// Returns the data if any has been fetched.
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub const fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Returns `true` while the first fetch of a query is running.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Returns `true` while a fetch is running or paused.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status != FetchStatus::Idle
    }

    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// Checks whether the entry is due for a refetch under `stale_time`.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.is_stale_at(stale_time, Instant::now())
    }

    pub(crate) fn is_stale_at(&self, stale_time: Duration, now: Instant) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.updated_at {
            Some(updated_at) => now.saturating_duration_since(updated_at) >= stale_time,
            None => true,
        }
    }

    /// Writes `data` as the authoritative value.
    pub(crate) fn set(&mut self, data: T) {
        self.data = Some(data);
        self.error = None;
        self.status = QueryStatus::Success;
        self.updated_at = Some(Instant::now());
        self.is_invalidated = false;
    }

    pub(crate) fn begin_fetch(&mut self, online: bool) {
        self.fetch_status = if online {
            FetchStatus::Fetching
        } else {
            FetchStatus::Paused
        };
        self.retry_count = 0;
        if self.data.is_none() {
            self.status = QueryStatus::Pending;
            self.error = None;
        }
    }

    pub(crate) fn succeed(&mut self, data: T) {
        self.set(data);
        self.retry_count = 0;
        self.fetch_status = FetchStatus::Idle;
    }

    /// Records a failed attempt that will be retried.
    pub(crate) fn record_retry(&mut self, failures: u32) {
        self.retry_count = failures;
    }

    /// Records the final failure once retries are exhausted. Existing data is kept.
    pub(crate) fn fail(&mut self, error: QueryError, failures: u32) {
        self.error = Some(error);
        self.status = QueryStatus::Error;
        self.fetch_status = FetchStatus::Idle;
        self.retry_count = failures;
    }

    pub(crate) fn invalidate(&mut self) {
        self.is_invalidated = true;
    }
}
