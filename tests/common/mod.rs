// Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tears_query::{QueryError, QueryOptions, RetryPolicy};
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly tracing subscriber once; controlled by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Counts how many times a fetch function was invoked.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A query that resolves to `value` after `delay`, counting its invocations.
pub fn delayed_query<V>(key: &'static str, value: V, delay: Duration, calls: &Calls) -> QueryOptions<V>
where
    V: Clone + Send + Sync + 'static,
{
    let calls = calls.clone();
    QueryOptions::new([key], move |_| {
        calls.record();
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok::<_, QueryError>(value)
        }
    })
}

/// A query that always fails, counting its invocations.
pub fn failing_query(key: &'static str, calls: &Calls) -> QueryOptions<i32> {
    let calls = calls.clone();
    QueryOptions::new([key], move |_| {
        calls.record();
        async { Err(QueryError::fetch("server unavailable")) }
    })
}

/// A retry policy with short, fixed delays.
pub fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries).with_delays(Duration::from_millis(10), Duration::from_millis(10))
}
