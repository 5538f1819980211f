//! Retry and asynchronous-completion helpers
//!
//! Provider operations are often accepted immediately and completed later.
//! [`wait_until`] polls freshly fetched state until it settles; [`retry`]
//! re-invokes an operation for a named set of transient failures only.
//! Both stop sleeping at the run deadline carried by the [`Context`].

use crate::context::Context;
use crate::error::{EngineError, Result, TransientKind};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff. A multiplier of `1.0` gives a fixed interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Delay before the retry following attempt `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Bounded retry for named transient failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retry_on: Vec<TransientKind>,
}

impl RetryPolicy {
    /// Retry only the given kinds, with default attempts and backoff
    pub fn only(kinds: impl IntoIterator<Item = TransientKind>) -> Self {
        Self {
            retry_on: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn should_retry(&self, err: &EngineError) -> bool {
        err.transient_kind()
            .is_some_and(|kind| self.retry_on.contains(&kind))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            retry_on: vec![
                TransientKind::Throttled,
                TransientKind::NotYetVisible,
                TransientKind::DependencyViolation,
            ],
        }
    }
}

/// Polling configuration for [`wait_until`]
#[derive(Debug, Clone, PartialEq)]
pub struct WaitConfig {
    pub backoff: Backoff,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(15),
                multiplier: 1.5,
            },
            timeout: Duration::from_secs(600),
        }
    }
}

/// Result of one poll of an asynchronous operation
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    /// Not settled yet
    Pending,
    /// Reached the desired terminal state
    Ready(T),
    /// Reached a terminal state that will never become the desired one
    Failed(String),
}

async fn sleep_within(ctx: &Context, delay: Duration, what: &str) -> Result<()> {
    match ctx.deadline() {
        Some(deadline) if Instant::now().checked_add(delay).is_none_or(|end| end >= deadline) => {
            tokio::time::sleep_until(deadline).await;
            Err(EngineError::transient(
                TransientKind::Timeout,
                format!("run deadline reached while waiting for {}", what),
            ))
        }
        _ => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// Poll `check` until it reports ready or failed, or the wait times out.
///
/// Timeouts (including the run deadline) fail as retryable
/// `Transient(Timeout)`; a `Failed` outcome fails as a validation error.
pub async fn wait_until<T, F, Fut>(
    ctx: &Context,
    config: &WaitConfig,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<WaitOutcome<T>>>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        match check().await? {
            WaitOutcome::Ready(value) => {
                tracing::debug!("{} ready after {} polls", what, attempt + 1);
                return Ok(value);
            }
            WaitOutcome::Failed(message) => {
                return Err(EngineError::Validation(format!("{}: {}", what, message)));
            }
            WaitOutcome::Pending => {}
        }

        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            return Err(EngineError::transient(
                TransientKind::Timeout,
                format!("timed out waiting for {} after {:?}", what, elapsed),
            ));
        }
        let delay = config
            .backoff
            .delay_for_attempt(attempt)
            .min(config.timeout - elapsed);
        sleep_within(ctx, delay, what).await?;
        attempt += 1;
    }
}

/// Run `op`, re-invoking it for transient errors named in `policy`.
pub async fn retry<T, F, Fut>(ctx: &Context, policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !policy.should_retry(&err) || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.backoff.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    "{} failed ({}), retrying in {:?} (attempt {}/{})",
                    what,
                    err,
                    delay,
                    attempt,
                    policy.max_attempts
                );
                sleep_within(ctx, delay, what).await?;
            }
        }
    }
}
