use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::warn;

use crate::error::{AppError, AppResult};

/// Backoff growth between retry attempts. Every computed delay is
/// clamped to `max_backoff_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Exponential,
    ExponentialJitter,
    Linear,
    Fixed,
}

impl BackoffStrategy {
    fn delay_ms(&self, attempt: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> u64 {
        let raw = match self {
            BackoffStrategy::Exponential => {
                initial_backoff_ms.saturating_mul(1u64 << attempt.min(62))
            }
            BackoffStrategy::ExponentialJitter => {
                let base = initial_backoff_ms.saturating_mul(1u64 << attempt.min(62));
                let factor = rand::rng().random_range(0.5..=1.5);
                ((base as f64) * factor) as u64
            }
            BackoffStrategy::Linear => initial_backoff_ms.saturating_mul((attempt + 1) as u64),
            BackoffStrategy::Fixed => initial_backoff_ms,
        };
        raw.min(max_backoff_ms)
    }
}

/// Default retryability predicate: network and resource-class errors are
/// retryable; everything else (protocol, internal, cancelled) is not.
pub fn default_is_retryable(err: &AppError) -> bool {
    err.is_retryable()
}

/// Retry `op` up to `max_attempts` times using `strategy` for backoff,
/// honoring a cooperative cancellation signal at every sleep. Returns the
/// terminal error unchanged on exhaustion, or a `Cancelled` error if the
/// shutdown signal fires while sleeping.
pub async fn execute_with_retry<F, Fut, T>(
    mut op: F,
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    is_retryable: impl Fn(&AppError) -> bool,
    strategy: BackoffStrategy,
    mut cancel: watch::Receiver<bool>,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }

                let delay = strategy.delay_ms(attempt - 1, initial_backoff_ms, max_backoff_ms);
                warn!(attempt, delay_ms = delay, error = %err, "retrying after backoff");

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            return Err(AppError::Cancelled);
                        }
                    }
                }
            }
        }
    }
}

/// Convenience wrapper for callers with no cancellation signal of their
/// own: retries run to completion or exhaustion without early cancel.
pub async fn execute_with_retry_uncancellable<F, Fut, T>(
    op: F,
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    is_retryable: impl Fn(&AppError) -> bool,
    strategy: BackoffStrategy,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let (_tx, rx) = watch::channel(false);
    execute_with_retry(
        op,
        max_attempts,
        initial_backoff_ms,
        max_backoff_ms,
        is_retryable,
        strategy,
        rx,
    )
    .await
}
