//! Mutation operations for creating, updating, or deleting resources.
//!
//! This module provides the [`Mutation`] type, a reusable handle around an
//! async write function, similar to mutations in TanStack Query.
//!
//! # Design Pattern: Transaction-based Operations
//!
//! Unlike queries, which are subscriptions to a cached key, mutations are
//! one-off operations. Every call to [`Mutation::mutate`] runs the write
//! function and returns its result. After a successful mutation you typically
//! want to update or invalidate related queries, either by sequencing calls on
//! the returned result or from the `on_success` hook, which receives the client.
//!
//! # Example
//!
//! ```rust,ignore
//! use tears_query::{InvalidateOptions, Mutation, QueryClient};
//!
//! let create_post = Mutation::new(&client, |input: NewPost| api::create_post(input))
//!     .on_success(|client, post, _input| {
//!         let _ = client.set_query_data(query_key!["posts", post.id], post.clone());
//!         let _ = client.invalidate(["posts"], InvalidateOptions::exact());
//!     });
//!
//! match create_post.mutate(NewPost { title, body }).await {
//!     Ok(post) => navigate_to(post.id),
//!     Err(e) => show_error(e),
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use crate::config::{MutationConfig, RetryPolicy};
use crate::error::MutationError;
use crate::query::QueryClient;

/// The state of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState<T> {
    /// Mutation is idle (not yet started, or reset).
    Idle,
    /// Mutation is in progress.
    Pending,
    /// Mutation succeeded with a result.
    Success(T),
    /// Mutation failed with an error.
    Error(MutationError),
}

impl<T> MutationState<T> {
    /// Returns the result data if the mutation succeeded, otherwise `None`.
    pub const fn data(&self) -> Option<&T> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    pub const fn error(&self) -> Option<&MutationError> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns `true` if the mutation is currently running.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `true` if the mutation succeeded.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns `true` if the mutation failed.
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

type MutateFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O, MutationError>> + Send + Sync>;
type SuccessHook<I, O> = Arc<dyn Fn(&QueryClient, &O, &I) + Send + Sync>;
type ErrorHook<I> = Arc<dyn Fn(&QueryClient, &MutationError, &I) + Send + Sync>;
type SettledHook<I, O> = Arc<dyn Fn(&QueryClient, Result<&O, &MutationError>, &I) + Send + Sync>;

/// A reusable write operation bound to a [`QueryClient`].
///
/// Mutations are never deduplicated: every call to [`mutate`](Self::mutate)
/// runs the write function. The handle's [`state`](Self::state) reflects the
/// most recent invocation only; an older invocation finishing after a newer
/// one started does not overwrite it.
pub struct Mutation<I, O> {
    client: QueryClient,
    mutate_fn: MutateFn<I, O>,
    config: MutationConfig,
    on_success: Option<SuccessHook<I, O>>,
    on_error: Option<ErrorHook<I>>,
    on_settled: Option<SettledHook<I, O>>,
    state: watch::Sender<MutationState<O>>,
    invocation: AtomicU64,
}

impl<I, O> Mutation<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    /// Creates a mutation with the client's default mutation configuration.
    ///
    /// # Arguments
    ///
    /// * `client` - The client passed to the hooks
    /// * `mutate_fn` - An async function that performs the write
    pub fn new<F, Fut>(client: &QueryClient, mutate_fn: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, MutationError>> + Send + 'static,
    {
        let (state, _) = watch::channel(MutationState::Idle);
        Self {
            client: client.clone(),
            mutate_fn: Arc::new(move |input| mutate_fn(input).boxed()),
            config: client.config().mutations,
            on_success: None,
            on_error: None,
            on_settled: None,
            state,
            invocation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: MutationConfig) -> Self {
        self.config = config;
        self
    }

    /// Opts into retrying failed writes. Mutations are not retried by default.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Runs after a successful write, once the state is `Success`.
    #[must_use]
    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&QueryClient, &O, &I) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Runs after the final failed attempt, once the state is `Error`.
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&QueryClient, &MutationError, &I) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Runs after `on_success` or `on_error`.
    #[must_use]
    pub fn on_settled<F>(mut self, hook: F) -> Self
    where
        F: Fn(&QueryClient, Result<&O, &MutationError>, &I) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(hook));
        self
    }

    /// Executes the mutation and returns its result.
    ///
    /// The write function runs once, plus any retries the mutation opted into.
    /// The final state is written first, and only if no newer invocation (or
    /// [`reset`](Self::reset)) happened meanwhile. Hooks then run for every
    /// invocation.
    pub async fn mutate(&self, input: I) -> Result<O, MutationError> {
        let invocation = self.invocation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(MutationState::Pending);
        debug!(invocation, "mutation started");

        let result = self.execute(&input).await;

        if self.invocation.load(Ordering::SeqCst) == invocation {
            self.state.send_replace(match &result {
                Ok(data) => MutationState::Success(data.clone()),
                Err(error) => MutationState::Error(error.clone()),
            });
        } else {
            debug!(invocation, "mutation superseded; state left unchanged");
        }

        match &result {
            Ok(data) => {
                debug!(invocation, "mutation succeeded");
                if let Some(hook) = &self.on_success {
                    hook(&self.client, data, &input);
                }
            }
            Err(error) => {
                debug!(invocation, %error, "mutation failed");
                if let Some(hook) = &self.on_error {
                    hook(&self.client, error, &input);
                }
            }
        }
        if let Some(hook) = &self.on_settled {
            hook(&self.client, result.as_ref(), &input);
        }

        result
    }

    async fn execute(&self, input: &I) -> Result<O, MutationError> {
        let retry = self.config.retry;
        let mut failures = 0;
        loop {
            match (self.mutate_fn)(input.clone()).await {
                Ok(data) => return Ok(data),
                Err(error) => {
                    failures += 1;
                    if !retry.should_retry(failures) {
                        return Err(error);
                    }
                    let delay = retry.delay_for(failures);
                    debug!(failures, ?delay, %error, "retrying mutation");
                    sleep(delay).await;
                }
            }
        }
    }

    /// The state of the most recent invocation.
    pub fn state(&self) -> MutationState<O> {
        self.state.borrow().clone()
    }

    /// Subscribes to state changes.
    pub fn watch(&self) -> watch::Receiver<MutationState<O>> {
        self.state.subscribe()
    }

    /// Returns the state to `Idle`. Invocations still running will not
    /// overwrite it.
    pub fn reset(&self) {
        self.invocation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(MutationState::Idle);
    }
}

impl<I, O> std::fmt::Debug for Mutation<I, O>
where
    O: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_mutation_state_idle() {
        let state: MutationState<i32> = MutationState::Idle;
        assert!(state.is_idle());
        assert!(!state.is_pending());
        assert!(!state.is_success());
        assert!(!state.is_error());
        assert_eq!(state.data(), None);
    }

    #[test]
    fn test_mutation_state_success() {
        let state = MutationState::Success(42);
        assert!(state.is_success());
        assert_eq!(state.data(), Some(&42));
        assert_eq!(state.error(), None);
    }

    #[test]
    fn test_mutation_state_error() {
        let state: MutationState<i32> = MutationState::Error(MutationError::failed("boom"));
        assert!(state.is_error());
        assert_eq!(state.error(), Some(&MutationError::Failed("boom".to_string())));
    }

    #[tokio::test]
    async fn test_mutate_success() {
        let client = QueryClient::new();
        let mutation = Mutation::new(&client, |x: i32| async move { Ok::<_, MutationError>(x * 2) });

        assert!(mutation.state().is_idle());
        assert_eq!(mutation.mutate(21).await, Ok(42));
        assert_eq!(mutation.state(), MutationState::Success(42));
    }

    #[tokio::test]
    async fn test_mutate_error_runs_once() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mutation = Mutation::new(&client, move |_: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(MutationError::failed("rejected")) }
        });

        let result = mutation.mutate(()).await;
        assert_eq!(result, Err(MutationError::Failed("rejected".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(mutation.state().is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opt_in_retry() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mutation = Mutation::new(&client, move |_: ()| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(MutationError::failed("flaky"))
                } else {
                    Ok("saved")
                }
            }
        })
        .retry(RetryPolicy::new(2).with_delays(Duration::from_millis(10), Duration::from_millis(10)));

        assert_eq!(mutation.mutate(()).await, Ok("saved"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hooks_see_the_final_state() {
        let client = QueryClient::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mutation = Mutation::new(&client, |x: i32| async move {
            if x > 0 {
                Ok(x)
            } else {
                Err(MutationError::failed("negative"))
            }
        });

        let rx = mutation.watch();
        let on_success = seen.clone();
        let on_error = seen.clone();
        let error_rx = rx.clone();
        let mutation = mutation
            .on_success(move |_, _, _| on_success.lock().expect("not poisoned").push(rx.borrow().clone()))
            .on_error(move |_, _, _| on_error.lock().expect("not poisoned").push(error_rx.borrow().clone()));

        mutation.mutate(7).await.expect("mutation succeeds");
        assert!(mutation.mutate(-1).await.is_err());

        let seen = seen.lock().expect("not poisoned");
        assert_eq!(seen[0], MutationState::Success(7));
        assert_eq!(seen[1], MutationState::Error(MutationError::failed("negative")));
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let client = QueryClient::new();
        let mutation = Mutation::new(&client, |x: i32| async move { Ok::<_, MutationError>(x) });

        mutation.mutate(1).await.expect("mutation succeeds");
        mutation.reset();
        assert!(mutation.state().is_idle());
    }
}
