// =============================================================================
// Circuit Breaker: three-state failure isolator for the venue API
// =============================================================================
//
// States:
//   Closed   - normal operation, failures are counted.
//   Open     - every call is rejected until the open-timeout elapses.
//   HalfOpen - calls are let through as probes; enough consecutive
//              successes close the circuit, any failure reopens it.
//
// One instance guards the whole process. State lives in atomics, the two
// timestamps behind a small mutex that is never held across venue calls.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::EngineError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Thresholds and timers. Defaults match the production tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Failures in Closed before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before the circuit closes.
    pub success_threshold: u32,
    /// Time spent Open before probing again.
    pub open_timeout: Duration,
    /// A success this long after the last failure resets the failure count.
    pub reset_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(120),
            reset_window: Duration::from_secs(600),
        }
    }
}

/// Observable snapshot for diagnostics; appended to critical operator alerts.
#[derive(Debug, Clone, Copy)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_age: Option<Duration>,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "breaker={} failures={} successes={}",
            self.state, self.failure_count, self.success_count
        )?;
        if let Some(age) = self.last_failure_age {
            write!(f, " last_failure={}s ago", age.as_secs())?;
        }
        Ok(())
    }
}

struct Timestamps {
    last_failure: Option<Instant>,
    state_changed: Option<Instant>,
}

/// Process-wide three-state circuit breaker.
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    timestamps: Mutex<Timestamps>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            timestamps: Mutex::new(Timestamps {
                last_failure: None,
                state_changed: None,
            }),
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Gate a call. `Ok(())` means the caller may hit the venue; an `Err`
    /// is the fail-fast rejection while the circuit is open.
    pub fn try_acquire(&self) -> Result<(), EngineError> {
        if self.state() != BreakerState::Open {
            return Ok(());
        }

        let mut ts = self.timestamps.lock();
        // Re-check under the lock so only one caller performs the transition.
        if self.state() != BreakerState::Open {
            return Ok(());
        }

        let elapsed = ts.state_changed.map(|t| t.elapsed()).unwrap_or_default();
        if elapsed >= self.config.open_timeout {
            info!(elapsed_secs = elapsed.as_secs(), "circuit breaker: Open -> HalfOpen");
            self.state.store(BreakerState::HalfOpen.as_u8(), Ordering::SeqCst);
            self.success_count.store(0, Ordering::SeqCst);
            ts.state_changed = Some(Instant::now());
            return Ok(());
        }

        let remaining = self.config.open_timeout - elapsed;
        Err(EngineError::CircuitOpen(format!(
            "retry in {}s",
            remaining.as_secs().max(1)
        )))
    }

    pub fn record_success(&self) {
        match self.state() {
            BreakerState::Closed => {
                let ts = self.timestamps.lock();
                let stale = ts
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.reset_window)
                    .unwrap_or(false);
                if stale && self.failure_count.load(Ordering::SeqCst) > 0 {
                    info!("circuit breaker: stale failure count cleared");
                    self.failure_count.store(0, Ordering::SeqCst);
                }
            }
            BreakerState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    info!(successes, "circuit breaker: HalfOpen -> Closed");
                    let mut ts = self.timestamps.lock();
                    self.state.store(BreakerState::Closed.as_u8(), Ordering::SeqCst);
                    self.failure_count.store(0, Ordering::SeqCst);
                    self.success_count.store(0, Ordering::SeqCst);
                    ts.state_changed = Some(Instant::now());
                }
            }
            BreakerState::Open => {
                warn!("circuit breaker: success recorded while Open (unexpected)");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut ts = self.timestamps.lock();
        ts.last_failure = Some(Instant::now());

        match self.state() {
            BreakerState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    warn!(failures, "circuit breaker: Closed -> Open");
                    self.state.store(BreakerState::Open.as_u8(), Ordering::SeqCst);
                    ts.state_changed = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                warn!("circuit breaker: HalfOpen -> Open (probe failed)");
                self.state.store(BreakerState::Open.as_u8(), Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
                ts.state_changed = Some(Instant::now());
            }
            BreakerState::Open => {
                self.failure_count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Force the breaker back to pristine Closed state.
    pub fn reset(&self) {
        let mut ts = self.timestamps.lock();
        self.state.store(BreakerState::Closed.as_u8(), Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        ts.last_failure = None;
        ts.state_changed = None;
        info!("circuit breaker reset");
    }

    pub fn status(&self) -> BreakerStatus {
        let ts = self.timestamps.lock();
        BreakerStatus {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
            last_failure_age: ts.last_failure.map(|t| t.elapsed()),
        }
    }
}
