// =============================================================================
// API resilience layer: retry with exponential backoff behind a process-wide
// three-state circuit breaker
// =============================================================================

pub mod circuit_breaker;
pub mod executor;

pub use circuit_breaker::{BreakerConfig, BreakerState, BreakerStatus, CircuitBreaker};
pub use executor::ApiExecutor;
