// Integration tests for QueryClient and QueryObserver.
// These drive the cache end to end on a paused Tokio clock.
// Unit tests for individual methods live next to the code in src/.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Calls, delayed_query, failing_query, init_tracing, quick_retry};
use futures::StreamExt;
use tears_query::{
    FetchStatus, InvalidKeyError, InvalidateOptions, QueryClient, QueryError, QueryKey, QueryOptions,
    QueryStatus, RetryPolicy, query_key,
};
use tokio::time::{Instant, sleep};

type TestResult = color_eyre::Result<()>;

#[tokio::test(start_paused = true)]
async fn test_concurrent_subscribers_share_one_fetch() -> TestResult {
    init_tracing();
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("posts", vec![1, 2, 3], Duration::from_millis(100), &calls);

    let mut first = client.subscribe(options.clone())?;
    let mut second = client.subscribe(options.clone())?;
    let third = client.subscribe(options)?;

    assert!(first.state().is_loading());
    let state = first.settled().await;
    second.settled().await;

    assert_eq!(calls.get(), 1);
    assert_eq!(state.data(), Some(&vec![1, 2, 3]));
    assert_eq!(third.data(), Some(vec![1, 2, 3]));
    assert_eq!(client.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fresh_data_is_served_without_fetching() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("user", "alice", Duration::ZERO, &calls).stale_time(Duration::from_secs(60));

    let mut observer = client.subscribe(options.clone())?;
    observer.settled().await;
    drop(observer);

    sleep(Duration::from_secs(59)).await;
    let observer = client.subscribe(options.clone())?;
    assert_eq!(calls.get(), 1);
    assert_eq!(observer.state().fetch_status, FetchStatus::Idle);
    assert_eq!(observer.data(), Some("alice"));
    drop(observer);

    sleep(Duration::from_secs(2)).await;
    let mut observer = client.subscribe(options)?;
    // Stale data stays visible while it is revalidated.
    let state = observer.state();
    assert!(state.is_success());
    assert!(state.is_fetching());
    assert_eq!(state.data(), Some(&"alice"));

    observer.settled().await;
    assert_eq!(calls.get(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exact_invalidation_leaves_the_family_alone() -> TestResult {
    let client = QueryClient::new();
    client.set_query_data(["posts"], vec![1, 2])?;
    client.set_query_data(query_key!["posts", 1], vec![1])?;
    client.set_query_data(["users"], vec![9])?;

    assert_eq!(client.invalidate(["posts"], InvalidateOptions::exact())?, 1);

    let list = client.get_query_state::<Vec<i32>>(["posts"]).expect("list cached");
    let detail = client.get_query_state::<Vec<i32>>(query_key!["posts", 1]).expect("detail cached");
    assert!(list.is_invalidated);
    assert!(!detail.is_invalidated);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_prefix_invalidation_covers_the_family() -> TestResult {
    let client = QueryClient::new();
    client.set_query_data(["posts"], vec![1, 2])?;
    client.set_query_data(query_key!["posts", 1], vec![1])?;
    client.set_query_data(query_key!["posts", 1, "comments"], vec![7])?;
    client.set_query_data(["users"], vec![9])?;

    assert_eq!(client.invalidate(["posts"], InvalidateOptions::default())?, 3);

    let users = client.get_query_state::<Vec<i32>>(["users"]).expect("users cached");
    assert!(!users.is_invalidated);
    assert!(client
        .get_query_state::<Vec<i32>>(query_key!["posts", 1, "comments"])
        .is_some_and(|state| state.is_invalidated));

    // An empty prefix matches everything.
    assert_eq!(client.invalidate(QueryKey::default(), InvalidateOptions::default())?, 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_refetches_active_observers_only() -> TestResult {
    let client = QueryClient::new();
    let active_calls = Calls::default();
    let idle_calls = Calls::default();

    let mut active = client.subscribe(
        delayed_query("posts", 1, Duration::from_millis(10), &active_calls)
            .stale_time(Duration::from_secs(3600)),
    )?;
    active.settled().await;

    let idle_options = QueryOptions::new(query_key!["posts", "archived"], {
        let calls = idle_calls.clone();
        move |_| {
            calls.record();
            async { Ok::<_, QueryError>(0) }
        }
    })
    .stale_time(Duration::from_secs(3600));
    client.prefetch(idle_options.clone()).await?;
    assert_eq!(idle_calls.get(), 1);

    client.invalidate(["posts"], InvalidateOptions::default())?;
    assert!(active.state().is_fetching());
    active.settled().await;

    assert_eq!(active_calls.get(), 2);
    assert_eq!(idle_calls.get(), 1);

    // The unobserved entry refetches on its next subscription.
    let mut idle = client.subscribe(idle_options)?;
    idle.settled().await;
    assert_eq!(idle_calls.get(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failing_fetch_retries_with_backoff() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let started = Instant::now();

    let mut observer = client.subscribe(failing_query("flaky", &calls))?;
    let state = observer.settled().await;

    assert_eq!(calls.get(), 4);
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.retry_count, 4);
    assert_eq!(state.error(), Some(&QueryError::fetch("server unavailable")));
    assert_eq!(state.fetch_status, FetchStatus::Idle);

    // 2s + 4s + 8s of backoff.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(14));
    assert!(elapsed < Duration::from_millis(14100));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failure_keeps_previous_data() -> TestResult {
    let client = QueryClient::new();
    let healthy = Arc::new(AtomicUsize::new(1));
    let options = QueryOptions::new(["balance"], {
        let healthy = healthy.clone();
        move |_| {
            let ok = healthy.load(Ordering::SeqCst) == 1;
            async move {
                if ok {
                    Ok(100)
                } else {
                    Err(QueryError::NetworkError("offline".into()))
                }
            }
        }
    })
    .retry(RetryPolicy::never());

    let mut observer = client.subscribe(options)?;
    observer.settled().await;

    healthy.store(0, Ordering::SeqCst);
    let state = observer.refetch().await;
    assert!(state.is_error());
    assert_eq!(state.data(), Some(&100));
    assert_eq!(state.retry_count, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_latest_started_fetch_wins() -> TestResult {
    init_tracing();
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = QueryOptions::new(["race"], {
        let calls = calls.clone();
        move |_| {
            let (delay, value) = match calls.record() {
                0 => (Duration::from_millis(200), "old"),
                _ => (Duration::from_millis(50), "new"),
            };
            async move {
                sleep(delay).await;
                Ok::<_, QueryError>(value)
            }
        }
    });

    let mut observer = client.subscribe(options)?;
    tokio::task::yield_now().await;
    assert_eq!(calls.get(), 1);

    let state = observer.refetch().await;
    assert_eq!(state.data(), Some(&"new"));

    // The slower, older fetch resolves later and is discarded.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(observer.data(), Some("new"));
    assert!(!observer.state().is_fetching());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_entry_is_collected_after_cache_time() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("todos", 1, Duration::ZERO, &calls).cache_time(Duration::from_secs(1));

    let mut observer = client.subscribe(options.clone())?;
    observer.settled().await;
    drop(observer);

    sleep(Duration::from_millis(999)).await;
    assert!(client.contains(["todos"]));

    sleep(Duration::from_millis(2)).await;
    assert!(!client.contains(["todos"]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resubscribing_cancels_collection() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("todos", 1, Duration::ZERO, &calls)
        .cache_time(Duration::from_secs(1))
        .stale_time(Duration::from_secs(3600));

    let mut observer = client.subscribe(options.clone())?;
    observer.settled().await;
    drop(observer);

    sleep(Duration::from_millis(500)).await;
    let observer = client.subscribe(options)?;
    sleep(Duration::from_secs(10)).await;

    assert!(client.contains(["todos"]));
    assert_eq!(observer.data(), Some(1));
    assert_eq!(calls.get(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_outlives_short_cache_time() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("slow", 7, Duration::from_secs(1), &calls).cache_time(Duration::from_millis(100));

    // Collection comes due mid-fetch and waits for the fetch to settle.
    client.prefetch(options).await?;
    assert!(client.contains(["slow"]));
    assert_eq!(client.get_query_data::<i32>(["slow"]), Some(7));

    sleep(Duration::from_millis(99)).await;
    assert!(client.contains(["slow"]));
    sleep(Duration::from_millis(2)).await;
    assert!(!client.contains(["slow"]));
    assert_eq!(calls.get(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resubscribing_mid_fetch_reuses_the_running_fetch() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("slow", 7, Duration::from_secs(1), &calls).cache_time(Duration::ZERO);

    let observer = client.subscribe(options.clone())?;
    drop(observer);
    sleep(Duration::from_millis(10)).await;
    assert!(client.contains(["slow"]));

    let mut observer = client.subscribe(options)?;
    let state = observer.settled().await;
    assert_eq!(state.data(), Some(&7));
    assert_eq!(calls.get(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_written_entries_without_observers_are_collected() -> TestResult {
    let client = QueryClient::new();
    client.set_query_data(["draft"], "hello".to_string())?;
    assert!(client.contains(["draft"]));

    // Default cache time is five minutes.
    sleep(Duration::from_secs(299)).await;
    assert!(client.contains(["draft"]));
    sleep(Duration::from_secs(2)).await;
    assert!(!client.contains(["draft"]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refetch_interval_runs_while_observed() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("clock", 0, Duration::ZERO, &calls)
        .stale_time(Duration::from_secs(3600))
        .refetch_interval(Duration::from_secs(1));

    let mut observer = client.subscribe(options)?;
    observer.settled().await;
    assert_eq!(calls.get(), 1);

    sleep(Duration::from_millis(3500)).await;
    assert_eq!(calls.get(), 4);

    drop(observer);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.get(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shortest_refetch_interval_wins() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let base = delayed_query("clock", 0, Duration::ZERO, &calls).stale_time(Duration::from_secs(3600));

    let mut slow = client.subscribe(base.clone().refetch_interval(Duration::from_secs(5)))?;
    let _fast = client.subscribe(base.refetch_interval(Duration::from_secs(1)))?;
    slow.settled().await;

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(calls.get(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disabled_query_waits_for_its_dependency() -> TestResult {
    let client = QueryClient::new();
    let post_calls = Calls::default();
    let user_calls = Calls::default();

    let mut post = client.subscribe(delayed_query("post", 7_u32, Duration::from_millis(10), &post_calls))?;

    let mut user = client.subscribe(
        QueryOptions::new(["user"], {
            let calls = user_calls.clone();
            move |_| {
                calls.record();
                async { Ok::<_, QueryError>("ada".to_string()) }
            }
        })
        .enabled(false),
    )?;

    assert!(!client.contains(["user"]));
    assert!(user.state().is_pending());
    assert!(!user.changed().await);

    let author = post.settled().await.data().copied();
    assert_eq!(author, Some(7));
    assert_eq!(user_calls.get(), 0);

    user.set_enabled(author.is_some())?;
    user.settled().await;
    user.set_enabled(true)?;

    assert_eq!(user_calls.get(), 1);
    assert_eq!(user.data().as_deref(), Some("ada"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_offline_fetch_pauses_until_online() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    client.set_online(false);

    let mut observer = client.subscribe(delayed_query("feed", 1, Duration::ZERO, &calls))?;
    sleep(Duration::from_secs(10)).await;

    let state = observer.state();
    assert_eq!(state.fetch_status, FetchStatus::Paused);
    assert!(state.is_paused());
    assert_eq!(calls.get(), 0);
    assert_eq!(client.is_fetching(), 1);

    client.set_online(true);
    let state = observer.settled().await;
    assert!(state.is_success());
    assert_eq!(calls.get(), 1);
    assert_eq!(client.is_fetching(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_swallows_errors_but_fetch_query_returns_them() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = failing_query("broken", &calls).retry(quick_retry(1));

    client.prefetch(options.clone()).await?;
    assert_eq!(calls.get(), 2);
    let state = client.get_query_state::<i32>(["broken"]).expect("entry recorded");
    assert!(state.is_error());

    let result = client.fetch_query(options).await;
    assert_eq!(result, Err(QueryError::fetch("server unavailable")));
    assert_eq!(calls.get(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_prefetched_data_is_served_to_subscribers() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("posts", vec!["a"], Duration::from_millis(50), &calls)
        .stale_time(Duration::from_secs(60));

    client.prefetch(options.clone()).await?;
    let observer = client.subscribe(options.clone())?;
    assert_eq!(observer.data(), Some(vec!["a"]));
    assert_eq!(client.fetch_query(options).await, Ok(vec!["a"]));
    assert_eq!(calls.get(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_direct_writes_notify_observers() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let mut observer = client.subscribe(
        delayed_query("count", 1, Duration::ZERO, &calls).stale_time(Duration::from_secs(60)),
    )?;
    observer.settled().await;

    let mut states = observer.stream();
    assert_eq!(states.next().await.and_then(|state| state.data), Some(1));

    client.set_query_data(["count"], 5)?;
    assert_eq!(states.next().await.and_then(|state| state.data), Some(5));

    client.update_query_data::<i32, _>(["count"], |old| old.copied().unwrap_or(0) * 2)?;
    assert_eq!(states.next().await.and_then(|state| state.data), Some(10));
    assert_eq!(observer.data(), Some(10));
    assert_eq!(calls.get(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_removing_an_entry_cancels_its_fetch() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();
    let options = delayed_query("slow", 1, Duration::from_secs(30), &calls);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.fetch_query(options).await }
    });
    sleep(Duration::from_millis(10)).await;
    assert!(client.remove(["slow"]));

    assert_eq!(pending.await?, Err(QueryError::Cancelled));
    assert!(!client.contains(["slow"]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_clear_empties_the_cache() -> TestResult {
    let client = QueryClient::new();
    client.set_query_data(["a"], 1)?;
    client.set_query_data(["b"], 2)?;
    assert_eq!(client.len(), 2);

    client.clear();
    assert!(client.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_malformed_keys_are_rejected() -> TestResult {
    let client = QueryClient::new();
    let calls = Calls::default();

    let empty = QueryOptions::new(QueryKey::default(), |_| async { Ok::<_, QueryError>(0) });
    assert!(matches!(client.subscribe(empty), Err(InvalidKeyError::Empty)));

    let nan = QueryOptions::new(query_key!["stats", f64::NAN], |_| async { Ok::<_, QueryError>(0) });
    assert!(matches!(
        client.subscribe(nan),
        Err(InvalidKeyError::NonFiniteNumber { index: 1 })
    ));

    client.set_query_data(["shared"], 1_i32)?;
    let mismatched = delayed_query("shared", "text", Duration::ZERO, &calls);
    assert!(matches!(
        client.subscribe(mismatched),
        Err(InvalidKeyError::TypeMismatch { .. })
    ));
    assert_eq!(calls.get(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_attempt_is_passed_to_the_query_function() -> TestResult {
    let client = QueryClient::new();
    let attempts = Arc::new(std::sync::Mutex::new(Vec::new()));
    let options = QueryOptions::new(query_key!["posts", 3], {
        let attempts = attempts.clone();
        move |context| {
            attempts.lock().expect("not poisoned").push(context.attempt);
            let key = context.key.to_string();
            async move {
                if context.attempt < 2 {
                    Err(QueryError::fetch(key))
                } else {
                    Ok(context.attempt)
                }
            }
        }
    })
    .retry(quick_retry(3));

    let mut observer = client.subscribe(options)?;
    let state = observer.settled().await;

    assert_eq!(state.data(), Some(&2));
    assert_eq!(*attempts.lock().expect("not poisoned"), vec![0, 1, 2]);
    Ok(())
}
