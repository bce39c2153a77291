// =============================================================================
// Shutdown: broadcast cancellation token and the single-fire coordinator
// =============================================================================
//
// Every worker polls one token; triggering it is idempotent. The
// coordinator runs the teardown sequence exactly once - concurrent callers
// block until that one run completes:
//
//   1. trigger the token (scheduler, session timer, monitor, risk engine
//      all stand down),
//   2. flatten every open position under a deadline,
//   3. emit the shutdown summary.
//
// Emergency shutdown is the same sequence with a shorter close deadline and
// exit code 1. The process exit itself happens in main, after the session
// returns, using the code recorded here.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::alerts::SharedAlerts;
use crate::closer::Closer;
use crate::events::{self, EngineEvent};
use crate::position::PositionBook;
use crate::types::PositionStatus;

const CLOSE_DEADLINE: Duration = Duration::from_secs(15);
const EMERGENCY_CLOSE_DEADLINE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Broadcast cancellation token. Cheap to clone; `is_triggered` is the
/// lock-free fast path for polling loops, `triggered()` the awaitable form.
#[derive(Clone)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(8);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("shutdown token triggered");
            let _ = self.tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token fires (immediately if it already has).
    pub async fn triggered(&self) {
        // Subscribe before the flag check so a trigger in between is not
        // missed.
        let mut rx = self.tx.subscribe();
        if self.is_triggered() {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(()) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => {
                    // Sender dropped without firing; nothing left to wait for.
                    if self.is_triggered() {
                        return;
                    }
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Graceful,
    Emergency,
}

pub struct ShutdownCoordinator {
    token: ShutdownToken,
    closer: Arc<Closer>,
    book: Arc<PositionBook>,
    alerts: SharedAlerts,
    exit_code: AtomicI32,
    sequence: tokio::sync::OnceCell<()>,
    close_deadline: Duration,
    emergency_close_deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        token: ShutdownToken,
        closer: Arc<Closer>,
        book: Arc<PositionBook>,
        alerts: SharedAlerts,
    ) -> Self {
        Self::with_deadlines(
            token,
            closer,
            book,
            alerts,
            CLOSE_DEADLINE,
            EMERGENCY_CLOSE_DEADLINE,
        )
    }

    pub fn with_deadlines(
        token: ShutdownToken,
        closer: Arc<Closer>,
        book: Arc<PositionBook>,
        alerts: SharedAlerts,
        close_deadline: Duration,
        emergency_close_deadline: Duration,
    ) -> Self {
        Self {
            token,
            closer,
            book,
            alerts,
            exit_code: AtomicI32::new(0),
            sequence: tokio::sync::OnceCell::new(),
            close_deadline,
            emergency_close_deadline,
        }
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.token.is_triggered() || self.sequence.initialized()
    }

    /// Orderly teardown. The first caller runs the sequence; everyone else
    /// waits for it to finish.
    pub async fn graceful(&self, reason: &str) {
        self.sequence
            .get_or_init(|| self.run_sequence(reason.to_string(), Mode::Graceful))
            .await;
    }

    /// Minimum-viable teardown with a short close deadline and exit code 1.
    pub async fn emergency(&self, reason: &str) {
        self.exit_code.store(1, Ordering::SeqCst);
        self.sequence
            .get_or_init(|| self.run_sequence(reason.to_string(), Mode::Emergency))
            .await;
    }

    async fn run_sequence(&self, reason: String, mode: Mode) {
        match mode {
            Mode::Graceful => {
                events::emit(
                    EngineEvent::GracefulShutdownStarted,
                    &[("reason", reason.clone())],
                );
                self.alerts.notify(&format!("SHUTDOWN started: {reason}"));
            }
            Mode::Emergency => {
                events::emit(EngineEvent::EmergencyShutdown, &[("reason", reason.clone())]);
                self.alerts.alert(&format!("SHUTDOWN emergency: {reason}"));
            }
        }

        // 1. Stop the scheduler, session timer, monitor, and risk engine.
        self.token.trigger();

        // 2. Flatten everything still open, bounded by the close deadline.
        let deadline = match mode {
            Mode::Graceful => self.close_deadline,
            Mode::Emergency => self.emergency_close_deadline,
        };
        match tokio::time::timeout(deadline, self.closer.close_all(&reason)).await {
            Ok(failures) if failures > 0 => {
                warn!(failures, "close-all finished with failed legs");
                self.exit_code.store(1, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(_) => {
                self.alerts.alert(&format!(
                    "SHUTDOWN close-all exceeded {}s: positions may remain open",
                    deadline.as_secs()
                ));
                self.exit_code.store(1, Ordering::SeqCst);
            }
        }

        // 3. Summary. Sink failures are swallowed by the sink itself, so
        // every step above always runs.
        let positions = self.book.all_positions();
        let count = |status: PositionStatus| {
            positions.iter().filter(|p| p.status == status).count()
        };
        let realized: rust_decimal::Decimal =
            positions.iter().map(|p| p.realized_pnl()).sum();
        self.alerts.notify(&format!(
            "SHUTDOWN summary: positions={} open={} profit={} loss={} risk={} realized_pnl={}",
            positions.len(),
            count(PositionStatus::Open),
            count(PositionStatus::ClosedProfit),
            count(PositionStatus::ClosedLoss),
            count(PositionStatus::ClosedRisk),
            realized
        ));

        if mode == Mode::Graceful {
            events::emit(
                EngineEvent::GracefulShutdownCompleted,
                &[("reason", reason)],
            );
        }
        info!("shutdown sequence complete");
    }
}
