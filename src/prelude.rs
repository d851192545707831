//! Prelude module for convenient imports.
//!
//! ```
//! use tears_query::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The cache every operation goes through
//! - [`QueryOptions`] and [`QueryObserver`] - Describing and observing queries
//! - [`Mutation`] - For performing writes
//! - [`InfiniteQueryOptions`] and [`InfiniteQueryObserver`] - Paged accumulation
//! - [`QueryKey`] and [`query_key!`](crate::query_key) - Structured keys
//! - Error types and configuration

pub use crate::config::{ClientConfig, MutationConfig, QueryConfig, RetryPolicy};
pub use crate::error::{InvalidKeyError, MutationError, QueryError};
pub use crate::infinite::{InfiniteData, InfiniteQueryObserver, InfiniteQueryOptions};
pub use crate::key::{KeySegment, QueryKey};
pub use crate::mutation::{Mutation, MutationState};
pub use crate::query::{InvalidateOptions, QueryClient, QueryContext, QueryObserver, QueryOptions};
pub use crate::query_key;
pub use crate::{FetchStatus, QueryState, QueryStatus};
