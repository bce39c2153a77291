// =============================================================================
// Risk Engine: per-position stop-loss / profit-target and the portfolio
// stop-loss latch
// =============================================================================
//
// Consumes the monitor's per-tick snapshots from a channel; it never touches
// the monitor itself. Per-position checks only apply while the position has
// net premium received; stop-loss wins over profit-target within one tick.
//
// The portfolio check compares aggregate mark-to-market against a fraction
// of aggregate worst-case loss from the same snapshot. Tripping it latches
// once, flattens everything, and requests emergency shutdown; subsequent
// ticks short-circuit on the latch.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::alerts::SharedAlerts;
use crate::closer::Closer;
use crate::error::{EngineError, RiskKind};
use crate::events::{self, EngineEvent};
use crate::monitor::{PositionRisk, RiskTick};
use crate::resilience::ApiExecutor;
use crate::shutdown::{ShutdownCoordinator, ShutdownToken};
use crate::types::PositionStatus;

/// Shared flag the scheduler polls to stop opening new butterflies.
pub type RiskLatch = Arc<AtomicBool>;

pub struct RiskEngine {
    closer: Arc<Closer>,
    alerts: SharedAlerts,
    executor: ApiExecutor,
    latch: RiskLatch,
    coordinator: Arc<ShutdownCoordinator>,
    shutdown: ShutdownToken,
    stop_loss_pct: Decimal,
    profit_target_pct: Decimal,
    portfolio_risk_pct: Decimal,
}

impl RiskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        closer: Arc<Closer>,
        alerts: SharedAlerts,
        executor: ApiExecutor,
        latch: RiskLatch,
        coordinator: Arc<ShutdownCoordinator>,
        shutdown: ShutdownToken,
        stop_loss_pct: Decimal,
        profit_target_pct: Decimal,
        portfolio_risk_pct: Decimal,
    ) -> Self {
        Self {
            closer,
            alerts,
            executor,
            latch,
            coordinator,
            shutdown,
            stop_loss_pct,
            profit_target_pct,
            portfolio_risk_pct,
        }
    }

    /// Consume risk ticks until the channel closes or shutdown fires.
    pub async fn run(&self, mut ticks: mpsc::Receiver<RiskTick>) {
        info!(
            stop_loss_pct = %self.stop_loss_pct,
            profit_target_pct = %self.profit_target_pct,
            portfolio_risk_pct = %self.portfolio_risk_pct,
            "risk engine started"
        );
        loop {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Some(tick) => self.process_tick(tick).await,
                    None => break,
                },
                _ = self.shutdown.triggered() => break,
            }
        }
        info!("risk engine stopped");
    }

    /// Evaluate one snapshot: per-position thresholds first (deterministic
    /// registration order), then the portfolio budget.
    pub async fn process_tick(&self, tick: RiskTick) {
        if self.latch.load(Ordering::SeqCst) {
            return;
        }

        for position in &tick.positions {
            self.check_position(position).await;
        }

        self.check_portfolio(&tick).await;
    }

    pub fn is_portfolio_stop_triggered(&self) -> bool {
        self.latch.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Per-position thresholds
    // -------------------------------------------------------------------------

    async fn check_position(&self, position: &PositionRisk) {
        // A butterfly that collected no net credit has no meaningful
        // premium-relative thresholds.
        if position.net_premium <= Decimal::ZERO {
            return;
        }

        let stop_level = position.net_premium * self.stop_loss_pct / dec!(100);
        let target_level = position.net_premium * self.profit_target_pct / dec!(100);

        if position.pnl <= -stop_level {
            let reason = format!("Stop-loss: {:.1}%", self.stop_loss_pct);
            let violation = EngineError::Risk {
                kind: RiskKind::PositionStopLoss,
                current: position.pnl,
                threshold: -stop_level,
            };
            warn!(position_id = %position.position_id, %violation, "position stop-loss hit");
            events::emit(
                EngineEvent::RiskEvent,
                &[
                    ("kind", "POSITION_STOP_LOSS".to_string()),
                    ("position_id", position.position_id.clone()),
                    ("pnl", position.pnl.to_string()),
                    ("threshold", (-stop_level).to_string()),
                ],
            );
            let _ = self
                .closer
                .close(&position.position_id, PositionStatus::ClosedLoss, &reason)
                .await;
        } else if position.pnl >= target_level {
            let reason = format!("Profit target: {:.1}%", self.profit_target_pct);
            info!(
                position_id = %position.position_id,
                pnl = %position.pnl,
                threshold = %target_level,
                "position profit target hit"
            );
            let _ = self
                .closer
                .close(&position.position_id, PositionStatus::ClosedProfit, &reason)
                .await;
        }
    }

    // -------------------------------------------------------------------------
    // Portfolio budget
    // -------------------------------------------------------------------------

    async fn check_portfolio(&self, tick: &RiskTick) {
        // An empty or premium-free book can never trip the portfolio stop.
        if tick.total_max_loss <= Decimal::ZERO {
            return;
        }

        let threshold = tick.total_max_loss * self.portfolio_risk_pct / dec!(100);
        if tick.total_mtm > -threshold {
            return;
        }

        if self.latch.swap(true, Ordering::SeqCst) {
            return;
        }

        let violation = EngineError::Risk {
            kind: RiskKind::PortfolioStopLoss,
            current: tick.total_mtm,
            threshold: -threshold,
        };
        warn!(%violation, "portfolio risk budget exhausted");

        let breaker = self.executor.breaker_status();
        self.alerts.alert(&format!(
            "RISK: PORTFOLIO STOP-LOSS TRIGGERED mtm={} max_loss={} threshold={} [{}]",
            tick.total_mtm, tick.total_max_loss, -threshold, breaker
        ));
        events::emit(
            EngineEvent::RiskEvent,
            &[
                ("kind", "PORTFOLIO_STOP_LOSS".to_string()),
                ("mtm", tick.total_mtm.to_string()),
                ("max_loss", tick.total_max_loss.to_string()),
                ("threshold", (-threshold).to_string()),
            ],
        );

        self.closer.close_all("Portfolio stop-loss triggered").await;
        self.coordinator
            .emergency("Portfolio stop-loss triggered")
            .await;
    }
}
