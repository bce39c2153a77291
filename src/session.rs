// =============================================================================
// Session Controller: the time-gated lifecycle around one trading session
// =============================================================================
//
// Waits for the configured [start, end) window on the host's wall clock,
// flips the session ACTIVE, launches the monitor, risk engine, and cycle
// scheduler as background workers, and arms the end-of-session timer that
// hands control to the shutdown coordinator. A session whose window has
// already passed is reported and never becomes ACTIVE.
//
// State transitions are one-way and idempotent; every worker observes ENDED
// through the shutdown token and stands down.
// =============================================================================

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alerts::SharedAlerts;
use crate::events::{self, EngineEvent};
use crate::monitor::{PositionMonitor, RiskTick};
use crate::risk_engine::RiskEngine;
use crate::scheduler::CycleScheduler;
use crate::shutdown::{ShutdownCoordinator, ShutdownToken};
use crate::types::SessionPhase;

pub type Clock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

// ---------------------------------------------------------------------------
// Observable session state
// ---------------------------------------------------------------------------

/// Lock-free session phase cell shared with the scheduler.
pub struct SessionStateCell(AtomicU8);

impl SessionStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn phase(&self) -> SessionPhase {
        match self.0.load(Ordering::SeqCst) {
            1 => SessionPhase::Active,
            2 => SessionPhase::Ended,
            _ => SessionPhase::Waiting,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase() == SessionPhase::Active
    }

    /// WAITING -> ACTIVE. False when the session already moved on.
    pub fn activate(&self) -> bool {
        self.0
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Any state -> ENDED. True only for the caller that performed the
    /// transition.
    pub fn end(&self) -> bool {
        self.0.swap(2, Ordering::SeqCst) != 2
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SessionController {
    state: Arc<SessionStateCell>,
    start: NaiveTime,
    end: NaiveTime,
    alerts: SharedAlerts,
    coordinator: Arc<ShutdownCoordinator>,
    shutdown: ShutdownToken,
    monitor: Arc<PositionMonitor>,
    risk: Arc<RiskEngine>,
    scheduler: Arc<CycleScheduler>,
    risk_rx: Mutex<Option<mpsc::Receiver<RiskTick>>>,
    clock: Clock,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<SessionStateCell>,
        window: (NaiveTime, NaiveTime),
        alerts: SharedAlerts,
        coordinator: Arc<ShutdownCoordinator>,
        shutdown: ShutdownToken,
        monitor: Arc<PositionMonitor>,
        risk: Arc<RiskEngine>,
        scheduler: Arc<CycleScheduler>,
        risk_rx: mpsc::Receiver<RiskTick>,
    ) -> Self {
        Self::with_clock(
            state,
            window,
            alerts,
            coordinator,
            shutdown,
            monitor,
            risk,
            scheduler,
            risk_rx,
            Arc::new(|| Local::now().time()),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_clock(
        state: Arc<SessionStateCell>,
        window: (NaiveTime, NaiveTime),
        alerts: SharedAlerts,
        coordinator: Arc<ShutdownCoordinator>,
        shutdown: ShutdownToken,
        monitor: Arc<PositionMonitor>,
        risk: Arc<RiskEngine>,
        scheduler: Arc<CycleScheduler>,
        risk_rx: mpsc::Receiver<RiskTick>,
        clock: Clock,
    ) -> Self {
        Self {
            state,
            start: window.0,
            end: window.1,
            alerts,
            coordinator,
            shutdown,
            monitor,
            risk,
            scheduler,
            risk_rx: Mutex::new(Some(risk_rx)),
            clock,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Run the whole session: wait for the window, work it, tear down.
    /// Returns when the session has ENDED and all workers are joined.
    pub async fn run(&self) {
        let now = (self.clock)();

        // Past the window: nothing to do today.
        if now >= self.end {
            warn!(%now, end = %self.end, "session window already over");
            self.alerts.alert(&format!(
                "SESSION missed: window {}-{} already over at startup",
                self.start, self.end
            ));
            self.state.end();
            return;
        }

        // Before the window: sleep until the opening bell, interruptibly.
        if now < self.start {
            let wait = duration_between(now, self.start);
            info!(start = %self.start, wait_secs = wait.as_secs(), "waiting for session start");
            self.alerts
                .notify(&format!("SESSION waiting for {} start", self.start));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.triggered() => {
                    self.state.end();
                    return;
                }
            }
        }

        if !self.state.activate() {
            warn!("session could not activate (already ended)");
            return;
        }

        events::emit(
            EngineEvent::SessionStarted,
            &[
                ("start", self.start.to_string()),
                ("end", self.end.to_string()),
            ],
        );
        self.alerts.notify(&format!(
            "SESSION started: window {}-{}, {} cycles",
            self.start,
            self.end,
            self.scheduler.total_cycles()
        ));

        // Background workers. All of them observe the shutdown token.
        let monitor = self.monitor.clone();
        let monitor_handle = tokio::spawn(async move { monitor.run().await });

        let risk_handle = self.risk_rx.lock().take().map(|rx| {
            let risk = self.risk.clone();
            tokio::spawn(async move { risk.run(rx).await })
        });

        let scheduler = self.scheduler.clone();
        let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

        // End-of-session timer, armed against the wall clock.
        let remaining = duration_between((self.clock)(), self.end);
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {
                info!("session end reached");
                self.end_session("session end reached").await;
            }
            _ = self.shutdown.triggered() => {
                info!("session interrupted by shutdown");
            }
        }
        self.state.end();

        // Join the workers; a panic at a worker root escalates.
        let mut handles = vec![monitor_handle, scheduler_handle];
        handles.extend(risk_handle);
        for handle in handles {
            if let Err(e) = handle.await {
                events::emit(
                    EngineEvent::UncaughtException,
                    &[("error", e.to_string())],
                );
                self.coordinator.emergency("worker panicked").await;
            }
        }
        info!("session ended");
    }

    /// Idempotent session end: the coordinator runs its sequence once no
    /// matter how many paths land here.
    async fn end_session(&self, reason: &str) {
        if self.state.end() {
            info!(reason, "ending session");
        }
        self.coordinator.graceful(reason).await;
    }
}

fn duration_between(now: NaiveTime, target: NaiveTime) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}
