// =============================================================================
// ApiExecutor: every outbound venue call goes through here
// =============================================================================
//
// Layering, outermost first:
//   circuit breaker  - fail-fast while the venue is misbehaving
//   retry            - up to R attempts with exponential backoff
//
// One breaker verdict is recorded per `exec` call, after retries are
// exhausted. Rate-limit errors are deliberately invisible to the breaker:
// they mean the venue is healthy but we are too loud.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::resilience::circuit_breaker::{BreakerStatus, CircuitBreaker};

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Retry-with-backoff wrapper around the process-wide circuit breaker.
#[derive(Clone)]
pub struct ApiExecutor {
    breaker: Arc<CircuitBreaker>,
    attempts: u32,
    base_delay: Duration,
}

impl ApiExecutor {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            attempts: DEFAULT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    /// Override retry tuning (tests and the close path use tighter values).
    pub fn with_retry(breaker: Arc<CircuitBreaker>, attempts: u32, base_delay: Duration) -> Self {
        Self {
            breaker,
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    /// Run `call` under retry + circuit breaker. `op` names the operation
    /// for logging and error accounting.
    pub async fn exec<T, F, Fut>(&self, op: &str, call: F) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.breaker.try_acquire()?;

        let mut last_err: Option<EngineError> = None;

        for attempt in 1..=self.attempts {
            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    if attempt > 1 {
                        debug!(op, attempt, "venue call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let recoverable = err.is_recoverable();
                    warn!(
                        op,
                        attempt,
                        max_attempts = self.attempts,
                        code = %err.code(),
                        recoverable,
                        "venue call failed"
                    );
                    let retry = recoverable && attempt < self.attempts;
                    last_err = Some(err);
                    if !retry {
                        break;
                    }
                    // base * 2^(attempt-1)
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let err = last_err.unwrap_or_else(|| EngineError::Other(format!("{op}: no attempt ran")));
        if !err.is_rate_limit() {
            self.breaker.record_failure();
        }
        Err(err)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{BreakerConfig, BreakerState};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor() -> ApiExecutor {
        ApiExecutor::new(Arc::new(CircuitBreaker::new(BreakerConfig::default())))
    }

    #[tokio::test(start_paused = true)]
    async fn six_consecutive_failures_open_then_fail_fast() {
        let exec = executor();

        for i in 0..5 {
            let err = exec
                .exec("opX", || async {
                    Err::<(), _>(EngineError::api(500, "INTERNAL", "boom"))
                })
                .await
                .unwrap_err();
            assert_eq!(err.code(), "INTERNAL", "call {i} should surface the venue error");
        }
        assert_eq!(exec.breaker_status().failure_count, 5);
        assert_eq!(exec.breaker_status().state, BreakerState::Open);

        // Sixth call is rejected before the closure runs.
        let calls = AtomicU32::new(0);
        let err = exec
            .exec("opX", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), EngineError>(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::CIRCUIT_BREAKER_OPEN);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_errors_are_retried_up_to_three_attempts() {
        let exec = executor();
        let calls = AtomicU32::new(0);

        let result = exec
            .exec("book", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::api(0, "TIMEOUT", "slow"))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exec.breaker_status().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_recoverable_errors_are_not_retried() {
        let exec = executor();
        let calls = AtomicU32::new(0);

        let err = exec
            .exec("order", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(EngineError::api(401, "INVALID_API_KEY", "denied")) }
            })
            .await
            .unwrap_err();

        assert!(!err.is_recoverable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.breaker_status().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_failures_do_not_touch_the_breaker() {
        let exec = executor();

        let err = exec
            .exec("book", || async {
                Err::<(), _>(EngineError::api(429, "RATE_LIMIT_EXCEEDED", "slow down"))
            })
            .await
            .unwrap_err();

        assert!(err.is_rate_limit());
        assert_eq!(exec.breaker_status().failure_count, 0);
        assert_eq!(exec.breaker_status().state, BreakerState::Closed);
    }
}
