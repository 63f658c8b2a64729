use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use tether_types::{BackoffPolicy, CoreResult};

/// How often an interval sleep wakes to look for cancellation. Keeps the
/// observed cancellation latency near this bound regardless of interval.
pub const CANCEL_CHECK_INTERVAL_MS: u64 = 100;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 5 * 60 * 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    Success,
    Timeout,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollMetrics {
    pub attempts: u32,
    pub total_duration_ms: u64,
    /// The interval actually used before each attempt after the first.
    pub intervals_ms: Vec<u64>,
    pub outcome: PollOutcome,
}

pub type PollObserver = Arc<dyn Fn(u32, u64) + Send + Sync>;

#[derive(Clone, Default)]
pub struct PollConfig {
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub backoff: Option<BackoffPolicy>,
    /// Invoked after each attempt's outcome is known, before the next sleep.
    pub on_poll: Option<PollObserver>,
}

/// `min(initial * multiplier^(attempt-1), max)`; attempt is 1-based.
pub fn calculate_backoff_interval(policy: &BackoffPolicy, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1);
    let scaled = policy.initial_ms as f64 * policy.multiplier.powi(exponent as i32);
    if !scaled.is_finite() {
        return policy.max_ms;
    }
    (scaled as u64).min(policy.max_ms)
}

#[derive(Debug, Clone)]
pub struct PollResult {
    pub condition_met: bool,
    pub metrics: PollMetrics,
}

/// Poll an async condition until it holds, the timeout elapses, or the
/// token cancels. Sleeps are chunked so cancellation is observed within
/// roughly [`CANCEL_CHECK_INTERVAL_MS`].
pub async fn poll_for_condition<F, Fut>(
    mut condition: F,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> CoreResult<PollResult>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<bool>>,
{
    let started = Instant::now();
    let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS));
    let base_interval = config.interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);

    let mut attempts = 0u32;
    let mut intervals_ms = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Ok(PollResult {
                condition_met: false,
                metrics: PollMetrics {
                    attempts,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                    intervals_ms,
                    outcome: PollOutcome::Cancelled,
                },
            });
        }

        attempts += 1;
        let met = match condition().await {
            Ok(met) => met,
            Err(err) => {
                let metrics = PollMetrics {
                    attempts,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                    intervals_ms,
                    outcome: PollOutcome::Error,
                };
                tracing::debug!(error = %err, ?metrics, "poll condition errored");
                return Err(err);
            }
        };
        if let Some(on_poll) = &config.on_poll {
            on_poll(attempts, started.elapsed().as_millis() as u64);
        }
        if met {
            return Ok(PollResult {
                condition_met: true,
                metrics: PollMetrics {
                    attempts,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                    intervals_ms,
                    outcome: PollOutcome::Success,
                },
            });
        }

        let interval = match &config.backoff {
            Some(policy) => calculate_backoff_interval(policy, attempts),
            None => base_interval,
        };

        if started.elapsed() + Duration::from_millis(interval) > timeout {
            // the next attempt would land past the deadline
            return Ok(PollResult {
                condition_met: false,
                metrics: PollMetrics {
                    attempts,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                    intervals_ms,
                    outcome: PollOutcome::Timeout,
                },
            });
        }

        intervals_ms.push(interval);
        if !interruptible_sleep(Duration::from_millis(interval), cancel).await {
            return Ok(PollResult {
                condition_met: false,
                metrics: PollMetrics {
                    attempts,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                    intervals_ms,
                    outcome: PollOutcome::Cancelled,
                },
            });
        }
    }
}

/// Sleep in cancellation-sized chunks. Returns false when cancelled.
pub async fn interruptible_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    let chunk = Duration::from_millis(CANCEL_CHECK_INTERVAL_MS);
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let remaining = deadline - now;
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(remaining.min(chunk)) => {}
        }
    }
}
