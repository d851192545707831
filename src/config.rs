use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Retry behaviour for failed fetches or mutations.
///
/// After the `n`-th consecutive failure the executor waits
/// `min(base_delay * 2^n, max_delay)` before trying again, for as long as
/// `n <= max_retries`.
///
/// ```
/// use std::time::Duration;
/// use tears_query::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for(1), Duration::from_secs(2));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(8));
/// assert_eq!(policy.delay_for(10), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of retries after the first failed attempt.
    pub max_retries: u32,

    #[serde(rename = "base_delay_ms", deserialize_with = "millis")]
    pub base_delay: Duration,

    #[serde(rename = "max_delay_ms", deserialize_with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default backoff and the given retry count.
    #[must_use]
    pub const fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn never() -> Self {
        Self::new(0)
    }

    #[must_use]
    pub const fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Returns `true` if another attempt follows `failures` consecutive failures.
    pub const fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }

    /// Backoff before the retry that follows `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Configuration for query behavior.
///
/// This controls how queries cache data and when they consider it stale.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// When data is fresh, queries will use cached data without refetching.
    /// Once stale, queries will refetch in the background while still showing cached data.
    #[serde(rename = "stale_time_ms", deserialize_with = "millis")]
    pub stale_time: Duration,

    /// How long an unobserved entry is retained before being garbage collected.
    #[serde(rename = "cache_time_ms", deserialize_with = "millis")]
    pub cache_time: Duration,

    pub retry: RetryPolicy,

    /// Refetch on this period while at least one observer is attached,
    /// regardless of staleness.
    #[serde(rename = "refetch_interval_ms", deserialize_with = "optional_millis")]
    pub refetch_interval: Option<Duration>,

    /// Disabled queries neither create entries nor fetch.
    pub enabled: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(0),      // immediately stale
            cache_time: Duration::from_secs(5 * 60), // 5 minutes
            retry: RetryPolicy::default(),
            refetch_interval: None,
            enabled: true,
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given stale and cache times.
    #[must_use]
    pub const fn new(stale_time: Duration, cache_time: Duration) -> Self {
        Self {
            stale_time,
            cache_time,
            retry: RetryPolicy::new(3),
            refetch_interval: None,
            enabled: true,
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Configuration for mutations. Writes are not retried unless asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub retry: RetryPolicy,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::never(),
        }
    }
}

/// Client-wide defaults.
///
/// Deserializable so a host application can embed it in its own config file:
///
/// ```
/// use std::time::Duration;
/// use tears_query::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(
///     r#"{ "queries": { "stale_time_ms": 300000, "retry": { "max_retries": 1 } } }"#,
/// )
/// .unwrap();
///
/// assert_eq!(config.queries.stale_time, Duration::from_secs(300));
/// assert_eq!(config.queries.retry.max_retries, 1);
/// assert_eq!(config.mutations.retry.max_retries, 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub queries: QueryConfig,
    pub mutations: MutationConfig,
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}
