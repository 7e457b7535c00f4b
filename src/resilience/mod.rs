pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::CircuitBreaker;
pub use retry::{default_is_retryable, execute_with_retry, execute_with_retry_uncancellable, BackoffStrategy};
