// =============================================================================
// Cycle Scheduler: N builder invocations on a fixed cadence
// =============================================================================
//
// Fires the cycle task immediately on session entry, then every `interval`.
// Ticks never overlap: a cycle that runs past its slot is followed by the
// next one immediately, with no queue buildup. The scheduler stands down
// when the session leaves ACTIVE, when the portfolio stop-loss latch trips,
// or on shutdown. Open positions keep being monitored after the last cycle;
// only building stops.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::alerts::SharedAlerts;
use crate::error::EngineError;
use crate::events::{self, EngineEvent};
use crate::risk_engine::RiskLatch;
use crate::session::SessionStateCell;
use crate::shutdown::ShutdownToken;

/// One unit of scheduled work; the butterfly builder in production.
#[async_trait]
pub trait CycleTask: Send + Sync {
    async fn run_cycle(&self, cycle: u32, total: u32) -> Result<(), EngineError>;
}

pub struct CycleScheduler {
    task: Arc<dyn CycleTask>,
    interval: Duration,
    total_cycles: u32,
    session: Arc<SessionStateCell>,
    latch: RiskLatch,
    shutdown: ShutdownToken,
    alerts: SharedAlerts,
    /// Last started cycle index, published for observability.
    current_cycle: AtomicU32,
}

impl CycleScheduler {
    pub fn new(
        task: Arc<dyn CycleTask>,
        interval: Duration,
        total_cycles: u32,
        session: Arc<SessionStateCell>,
        latch: RiskLatch,
        shutdown: ShutdownToken,
        alerts: SharedAlerts,
    ) -> Self {
        Self {
            task,
            interval,
            total_cycles,
            session,
            latch,
            shutdown,
            alerts,
            current_cycle: AtomicU32::new(0),
        }
    }

    pub fn current_cycle(&self) -> u32 {
        self.current_cycle.load(Ordering::SeqCst)
    }

    pub fn total_cycles(&self) -> u32 {
        self.total_cycles
    }

    pub async fn run(&self) {
        info!(
            total = self.total_cycles,
            interval_secs = self.interval.as_secs(),
            "cycle scheduler started"
        );

        let mut next_tick = Instant::now();
        let mut completed = 0u32;

        for cycle in 1..=self.total_cycles {
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {}
                _ = self.shutdown.triggered() => break,
            }

            if self.shutdown.is_triggered() {
                info!(cycle, "scheduler stopping: shutdown in progress");
                break;
            }
            if self.latch.load(Ordering::SeqCst) {
                warn!(cycle, "scheduler stopping: portfolio stop-loss triggered");
                break;
            }
            if !self.session.is_active() {
                info!(cycle, "scheduler stopping: session no longer active");
                break;
            }

            self.current_cycle.store(cycle, Ordering::SeqCst);
            let started = Instant::now();

            match self.task.run_cycle(cycle, self.total_cycles).await {
                Ok(()) => {
                    completed += 1;
                    events::emit(
                        EngineEvent::CycleCompleted,
                        &[
                            ("cycle", cycle.to_string()),
                            ("total", self.total_cycles.to_string()),
                        ],
                    );
                    self.alerts
                        .notify(&format!("CYCLE {cycle}/{} completed", self.total_cycles));
                }
                Err(e) if e.is_recoverable() => {
                    warn!(cycle, error = %e, "cycle failed, continuing with next");
                    self.alerts
                        .alert(&format!("CYCLE {cycle} failed: {}", e.code()));
                }
                Err(e) => {
                    self.alerts.alert(&format!(
                        "CYCLE {cycle} aborted scheduling: non-recoverable {}",
                        e.code()
                    ));
                    break;
                }
            }

            // Fixed cadence from each cycle's start; an overrunning cycle
            // leads straight into the next tick.
            next_tick = started + self.interval;
            let now = Instant::now();
            if next_tick < now {
                next_tick = now;
            }
        }

        if completed == self.total_cycles {
            self.alerts.notify(&format!(
                "CYCLE schedule complete: {completed}/{} cycles; monitoring continues until session end",
                self.total_cycles
            ));
        }
        info!(completed, "cycle scheduler stopped");
    }
}
