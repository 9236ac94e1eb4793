use std::{future::Future, time::Duration};

use tracing::{debug, warn};

use crate::{
    error::{ConfigError, QueryFailure},
    time::SharedTimeSource,
    types::AttemptIndex,
};

/// Delay schedule consulted between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPlan {
    /// `min(base * 2^attempt, max)`.
    Exponential { base: Duration, max: Duration },
    /// Explicit per-attempt delays. The last entry repeats for later attempts.
    Sequence(Vec<Duration>),
}

impl BackoffPlan {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential { base, max }
    }

    pub fn sequence(delays: impl IntoIterator<Item = Duration>) -> Result<Self, ConfigError> {
        let delays: Vec<Duration> = delays.into_iter().collect();
        if delays.is_empty() {
            return Err(ConfigError::invalid(
                "backoff_plan",
                "[]",
                "sequence must contain at least one delay",
            ));
        }
        Ok(Self::Sequence(delays))
    }

    /// Retry immediately without waiting.
    pub fn immediate() -> Self {
        Self::Sequence(vec![Duration::ZERO])
    }

    pub fn delay_for_attempt(&self, attempt: AttemptIndex) -> Duration {
        match self {
            Self::Exponential { base, max } => {
                let shift = attempt.min(20);
                base.saturating_mul(1_u32 << shift).min(*max)
            }
            Self::Sequence(delays) => {
                let index = (attempt as usize).min(delays.len().saturating_sub(1));
                delays.get(index).copied().unwrap_or_default()
            }
        }
    }
}

impl Default for BackoffPlan {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Attempt limit plus the backoff plan applied between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffPlan,
}

impl RetryPolicy {
    /// `max_attempts` bounds total invocations, so `1` disables retrying.
    pub fn new(max_attempts: u32, backoff: BackoffPlan) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_attempts",
                max_attempts,
                "must be at least 1",
            ));
        }
        Ok(Self {
            max_attempts,
            backoff,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &BackoffPlan {
        &self.backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPlan::default(),
        }
    }
}

/// Re-invokes a failing operation with backoff waits in between.
///
/// Only [`QueryFailure::ExecutionError`] is retried; other failures are
/// returned as-is from the attempt that produced them. Dropping the future
/// returned by [`run`](Self::run) abandons the current attempt or backoff
/// wait and schedules nothing further.
#[derive(Debug, Clone)]
pub struct RetryWithBackoff {
    policy: RetryPolicy,
    time: SharedTimeSource,
}

impl RetryWithBackoff {
    pub fn new(policy: RetryPolicy, time: SharedTimeSource) -> Self {
        Self { policy, time }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, QueryFailure>
    where
        F: FnMut(AttemptIndex) -> Fut,
        Fut: Future<Output = Result<T, QueryFailure>>,
    {
        self.run_with_callback(operation, |_, _, _| {}).await
    }

    /// Like [`run`](Self::run), calling `on_retry(attempt, failure, delay)`
    /// before each backoff wait.
    pub async fn run_with_callback<T, F, Fut, C>(
        &self,
        mut operation: F,
        mut on_retry: C,
    ) -> Result<T, QueryFailure>
    where
        F: FnMut(AttemptIndex) -> Fut,
        Fut: Future<Output = Result<T, QueryFailure>>,
        C: FnMut(AttemptIndex, &QueryFailure, Duration),
    {
        let mut attempt: AttemptIndex = 0;
        loop {
            let failure = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(failure) if !failure.is_retryable() => return Err(failure),
                Err(failure) => failure,
            };

            let attempts_made = attempt.saturating_add(1);
            if attempts_made >= self.policy.max_attempts {
                warn!(attempts = attempts_made, error = %failure, "retries exhausted");
                return Err(failure);
            }

            let delay = self.policy.backoff.delay_for_attempt(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "attempt failed; backing off"
            );
            on_retry(attempt, &failure, delay);
            self.time.sleep(delay).await;
            attempt = attempts_made;
        }
    }
}
