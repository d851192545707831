//! Scheduled background tasks owned by cache entries.
//!
//! Garbage-collection and refetch-interval timers are spawned onto the current
//! Tokio runtime and represented by a [`TimerHandle`]. Dropping or cancelling
//! the handle stops the task, so an entry that replaces or clears its handle can
//! never leak a timer.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handle for a running timer task.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Cancel the timer. The task exits at its next wake-up.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn runtime() -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            warn!("no Tokio runtime available; timer not scheduled");
            None
        }
    }
}

/// Runs `task` once after `delay` unless cancelled first.
pub(crate) fn spawn_after<F>(delay: Duration, task: F) -> Option<TimerHandle>
where
    F: FnOnce() + Send + 'static,
{
    let runtime = runtime()?;
    let token = CancellationToken::new();
    let cancelled = token.clone();

    runtime.spawn(async move {
        tokio::select! {
            () = cancelled.cancelled() => {}
            () = sleep(delay) => task(),
        }
    });

    Some(TimerHandle { token })
}

/// Runs `tick` every `period` until cancelled or until `tick` returns `false`.
///
/// The first tick fires one full period after scheduling. Missed ticks are
/// skipped rather than replayed.
pub(crate) fn spawn_interval<F>(period: Duration, mut tick: F) -> Option<TimerHandle>
where
    F: FnMut() -> bool + Send + 'static,
{
    if period.is_zero() {
        return None;
    }
    let runtime = runtime()?;
    let token = CancellationToken::new();
    let cancelled = token.clone();

    runtime.spawn(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticks.tick().await;

        loop {
            tokio::select! {
                () = cancelled.cancelled() => break,
                _ = ticks.tick() => {
                    if !tick() {
                        break;
                    }
                }
            }
        }
    });

    Some(TimerHandle { token })
}
