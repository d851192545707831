//! # Tears Query - Asynchronous Query Cache
//!
//! Tears Query is a key-addressed cache of asynchronously produced values,
//! modelled on [TanStack Query](https://tanstack.com/query). It is
//! UI-framework-agnostic: consumers supply plain async fetch functions and
//! observe the cache's state through watch channels or streams.
//!
//! ## Architecture
//!
//! 1. **Keys**: structured [`QueryKey`]s identify resources and form families
//!    for invalidation (`["posts"]` covers `["posts", 1]`)
//! 2. **Client**: an explicitly owned [`QueryClient`] holds every entry
//! 3. **Observers**: [`QueryObserver`]s subscribe to one key, trigger fetches of
//!    missing or stale data and keep the entry alive
//! 4. **Mutations**: [`Mutation`]s run writes and update or invalidate the cache
//!    afterwards
//!
//! ## Core Components
//!
//! - [`QueryClient`]: cache, deduplication, invalidation and direct writes
//! - [`QueryObserver`]: a live subscription with stale-while-revalidate state
//! - [`Mutation`]: a reusable write operation with success/error hooks
//! - [`InfiniteQueryObserver`]: cursor-based page accumulation in one entry
//!
//! ## Example
//!
//! ```rust,no_run
//! use tears_query::{InvalidateOptions, Mutation, MutationError, QueryClient, QueryError, QueryOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = QueryClient::new();
//!
//! let mut posts = client.subscribe(QueryOptions::new(["posts"], |_| async {
//!     Ok::<_, QueryError>(vec!["first post".to_string()])
//! }))?;
//! let state = posts.settled().await;
//! assert_eq!(state.data().map(Vec::len), Some(1));
//!
//! let create = Mutation::new(&client, |title: String| async move {
//!     Ok::<_, MutationError>(title)
//! })
//! .on_success(|client, _post, _title| {
//!     let _ = client.invalidate(["posts"], InvalidateOptions::exact());
//! });
//! create.mutate("second post".to_string()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Runtime
//!
//! Background fetches, retries and timers run on the ambient Tokio runtime.
//! The library only emits [`tracing`] events and never installs a subscriber.

pub mod cache;
pub mod config;
pub mod error;
pub mod infinite;
pub mod key;
pub mod mutation;
pub mod prelude;
pub mod query;
mod timer;

pub use cache::{FetchStatus, QueryState, QueryStatus};
pub use config::{ClientConfig, MutationConfig, QueryConfig, RetryPolicy};
pub use error::{InvalidKeyError, MutationError, QueryError};
pub use infinite::{InfiniteData, InfiniteQueryObserver, InfiniteQueryOptions};
pub use key::{CanonicalKey, KeySegment, QueryKey};
pub use mutation::{Mutation, MutationState};
pub use query::{InvalidateOptions, QueryClient, QueryContext, QueryObserver, QueryOptions};
