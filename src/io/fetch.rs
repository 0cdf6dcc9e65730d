//! Bounded retry for synchronous catalog pulls.
//!
//! The pipeline suspends wherever a scalar or structural result must be
//! pulled synchronously from the external engine. Engine latency is
//! unbounded and quota-limited, so every such pull runs under a retry
//! policy with exponential backoff and an overall deadline; an exhausted
//! policy surfaces as a single tagged `Engine` error.

use std::time::{Duration, Instant};

use crate::types::{ChError, ChResult};

/// Retry policy for synchronous engine fetches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles each retry.
    pub initial_backoff: Duration,
    /// Cap on a single backoff interval.
    pub max_backoff: Duration,
    /// Overall deadline across all attempts.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            deadline: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy that fails immediately after one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            deadline: Duration::from_secs(60),
        }
    }
}

/// Run a synchronous fetch under the policy. `stage` names the pipeline
/// stage for the tagged error and the log lines.
pub fn fetch_with_retry<T, F>(stage: &str, policy: &RetryPolicy, mut fetch: F) -> ChResult<T>
where
    F: FnMut() -> ChResult<T>,
{
    let started = Instant::now();
    let mut backoff = policy.initial_backoff;
    let mut last_message = String::new();

    for attempt in 1..=policy.max_attempts.max(1) {
        match fetch() {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("{stage}: fetch succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(e) => {
                last_message = e.to_string();
                log::warn!(
                    "{stage}: fetch attempt {attempt}/{} failed: {last_message}",
                    policy.max_attempts
                );
            }
        }

        if attempt == policy.max_attempts {
            break;
        }
        if started.elapsed() + backoff > policy.deadline {
            log::warn!("{stage}: retry deadline exceeded, giving up");
            break;
        }
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(policy.max_backoff);
    }

    Err(ChError::Engine {
        stage: stage.to_string(),
        message: last_message,
    })
}
