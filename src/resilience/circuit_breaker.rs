use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::telemetry::Metrics;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

/// CLOSED/OPEN/HALF_OPEN breaker guarding a flaky operation. State
/// transitions and counters are serialized behind a single internal
/// mutex: the breaker's own call volume is not expected to be hot enough
/// to need finer-grained locking.
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    state: Mutex<State>,
    failure_count: AtomicU32,
    half_open_successes: AtomicU32,
    half_open_in_flight: AtomicU32,
    last_failure_ms: AtomicI64,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            half_open_max_calls,
            state: Mutex::new(State::Closed),
            failure_count: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            last_failure_ms: AtomicI64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Execute `op`, applying breaker gating. Returns a distinct
    /// `BreakerOpen` error so callers can tell a fast-fail from a real
    /// failure of `op` itself; `isFailure` decides which results of `op`
    /// count as failures for the breaker.
    pub async fn execute<F, Fut, T>(
        &self,
        op: F,
        is_failure: impl Fn(&AppError) -> bool,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if !self.admit().await? {
            return Err(AppError::BreakerOpen("circuit breaker is open".to_string()));
        }

        let result = op().await;

        match &result {
            Ok(_) => self.on_success().await,
            Err(e) if is_failure(e) => self.on_failure().await,
            Err(_) => self.on_success().await,
        }

        result
    }

    /// Like `execute`, but falls back to `fallback` instead of surfacing
    /// the breaker-open or operation error.
    pub async fn execute_with_fallback<F, Fut, G, GFut, T>(
        &self,
        op: F,
        is_failure: impl Fn(&AppError) -> bool,
        fallback: G,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = AppResult<T>>,
    {
        match self.execute(op, is_failure).await {
            Ok(v) => Ok(v),
            Err(_) => fallback().await,
        }
    }

    /// Returns `Ok(true)` if the call may proceed, `Ok(false)` if it must
    /// fail fast.
    async fn admit(&self) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        match *state {
            State::Closed => Ok(true),
            State::Open => {
                let elapsed = now_ms() - self.last_failure_ms.load(Ordering::Relaxed);
                if elapsed >= self.reset_timeout.as_millis() as i64 {
                    *state = State::HalfOpen;
                    self.half_open_successes.store(0, Ordering::Relaxed);
                    self.half_open_in_flight.store(0, Ordering::Relaxed);
                    info!("circuit breaker transitioning to half-open");
                    drop(state);
                    self.admit_half_open().await
                } else {
                    Ok(false)
                }
            }
            State::HalfOpen => {
                drop(state);
                self.admit_half_open().await
            }
        }
    }

    async fn admit_half_open(&self) -> AppResult<bool> {
        let in_flight = self.half_open_in_flight.fetch_add(1, Ordering::SeqCst);
        if in_flight >= self.half_open_max_calls {
            self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
            return Ok(false);
        }
        Ok(true)
    }

    async fn on_success(&self) {
        let mut state = self.state.lock().await;
        match *state {
            State::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            State::HalfOpen => {
                self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
                let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.half_open_max_calls {
                    *state = State::Closed;
                    self.failure_count.store(0, Ordering::Relaxed);
                    info!("circuit breaker closed after successful probes");
                }
            }
            State::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.lock().await;
        self.last_failure_ms.store(now_ms(), Ordering::Relaxed);
        match *state {
            State::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    *state = State::Open;
                    warn!("circuit breaker opened after {} failures", failures);
                    if let Some(metrics) = &self.metrics {
                        metrics.breaker_trips.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            State::HalfOpen => {
                self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
                *state = State::Open;
                warn!("circuit breaker probe failed, reopening");
                if let Some(metrics) = &self.metrics {
                    metrics.breaker_trips.fetch_add(1, Ordering::Relaxed);
                }
            }
            State::Open => {}
        }
    }

    pub async fn is_open(&self) -> bool {
        *self.state.lock().await == State::Open
    }
}
