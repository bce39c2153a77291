// =============================================================================
// Closer: flattens butterfly legs with opposite-side limit orders
// =============================================================================
//
// Every leg that filled on open gets an opposite-side order priced from the
// cached top of book (BUY back at the ask, SELL out at the bid), driven by
// the fill driver. When the cache has no quote the leg's last-seen mark is
// used. Leg failures are recorded per leg and never abort the other legs.
//
// A leg's close price is only recorded when the full held quantity was
// flattened; anything less counts as a failure and stays eligible for the
// retry wrapper, which backs off exponentially (capped at 30 s) before
// escalating to a manual-intervention alert.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::alerts::SharedAlerts;
use crate::error::EngineError;
use crate::events::{self, EngineEvent};
use crate::fill::{FillDriver, FillOutcome};
use crate::monitor::PriceCache;
use crate::position::{Leg, PositionBook};
use crate::resilience::ApiExecutor;
use crate::types::{OrderRequest, OrderSide, PositionStatus};
use crate::venue::SharedVenue;

const RETRY_DELAY_CAP: Duration = Duration::from_secs(30);

pub struct Closer {
    venue: SharedVenue,
    executor: ApiExecutor,
    fill: Arc<FillDriver>,
    book: Arc<PositionBook>,
    cache: Arc<PriceCache>,
    alerts: SharedAlerts,
}

impl Closer {
    pub fn new(
        venue: SharedVenue,
        executor: ApiExecutor,
        fill: Arc<FillDriver>,
        book: Arc<PositionBook>,
        cache: Arc<PriceCache>,
        alerts: SharedAlerts,
    ) -> Self {
        Self {
            venue,
            executor,
            fill,
            book,
            cache,
            alerts,
        }
    }

    /// Flatten one position and move it to `status`. Returns an error when
    /// any leg could not be fully closed; the position is transitioned to
    /// the terminal status either way.
    pub async fn close(
        &self,
        position_id: &str,
        status: PositionStatus,
        reason: &str,
    ) -> Result<(), EngineError> {
        let position = match self.book.get(position_id) {
            Some(p) => p,
            None => {
                warn!(position_id, "close requested for unknown position");
                return Ok(());
            }
        };
        if position.status.is_terminal() {
            return Ok(());
        }

        info!(position_id, status = %status, reason, "closing position");

        let failed_legs = self.flatten_legs(position_id).await;

        self.book.set_status(position_id, status, reason);

        let final_pnl = self
            .book
            .get(position_id)
            .map(|p| p.realized_pnl())
            .unwrap_or(Decimal::ZERO);

        events::emit(
            EngineEvent::PositionClosed,
            &[
                ("position_id", position_id.to_string()),
                ("status", status.to_string()),
                ("reason", reason.to_string()),
                ("pnl", final_pnl.to_string()),
                ("failed_legs", failed_legs.to_string()),
            ],
        );
        self.alerts.notify(&format!(
            "POSITION closed {} status={} pnl={} reason={}",
            &position_id[..8.min(position_id.len())],
            status,
            final_pnl,
            reason
        ));

        if failed_legs > 0 {
            self.alerts.alert(&format!(
                "POSITION {position_id} has {failed_legs} leg(s) that failed to close"
            ));
            return Err(EngineError::order(
                "LEG_CLOSE_FAILED",
                format!("{failed_legs} leg(s) not flattened"),
            ));
        }
        Ok(())
    }

    /// Flatten every open position. Returns the number of positions with at
    /// least one failed leg.
    pub async fn close_all(&self, reason: &str) -> usize {
        let open = self.book.open_positions();
        info!(count = open.len(), reason, "closing all open positions");

        let mut failures = 0usize;
        for position in open {
            if self
                .close(&position.id, PositionStatus::ClosedRisk, reason)
                .await
                .is_err()
            {
                failures += 1;
            }
        }
        failures
    }

    /// Retry the whole position close with exponential backoff, escalating
    /// to a manual-intervention alert when every attempt fails. Legs that
    /// closed on an earlier attempt are not re-sent.
    pub async fn close_with_retry(
        &self,
        position_id: &str,
        status: PositionStatus,
        reason: &str,
        max_attempts: u32,
    ) {
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=max_attempts.max(1) {
            // The first attempt transitions the status; later attempts only
            // re-drive the legs that are still unflattened.
            let flattened = if attempt == 1 {
                self.close(position_id, status, reason).await.is_ok()
            } else {
                self.flatten_legs(position_id).await == 0
            };
            if flattened {
                if attempt > 1 {
                    info!(position_id, attempt, "position flattened on retry");
                }
                return;
            }
            warn!(position_id, attempt, "position close attempt left legs open");
            if attempt < max_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_DELAY_CAP);
            }
        }
        self.alerts.alert(&format!(
            "POSITION manual intervention required: {position_id} not flattened after {max_attempts} attempts"
        ));
    }

    // -------------------------------------------------------------------------
    // Legs
    // -------------------------------------------------------------------------

    /// Drive a close order for every held leg that has no close fill yet.
    /// Returns the number of legs that remain unflattened.
    async fn flatten_legs(&self, position_id: &str) -> usize {
        let position = match self.book.get(position_id) {
            Some(p) => p,
            None => return 0,
        };

        let mut failed = 0usize;
        for leg in position.legs() {
            if !leg.is_filled() || leg.close_price.is_some() {
                continue;
            }
            if !self.close_leg(position_id, leg).await {
                failed += 1;
            }
        }
        failed
    }

    async fn close_leg(&self, position_id: &str, leg: &Leg) -> bool {
        // A residual opening order left resting at the fill deadline must go
        // before the opposite-side order, or the two could cross.
        if let Some(order_id) = &leg.open_order_id {
            let symbol = leg.symbol.clone();
            let order_id = order_id.clone();
            if let Err(e) = self
                .executor
                .exec("cancel_order", || {
                    self.venue.cancel_order(&order_id, &symbol)
                })
                .await
            {
                warn!(symbol = %leg.symbol, error = %e, "residual opening order cancel failed");
            }
        }

        let close_side = leg.side.opposite();
        let price = match self.cache.get(&leg.symbol) {
            Some(quote) => match close_side {
                OrderSide::Buy => quote.ask,
                OrderSide::Sell => quote.bid,
            },
            None => match leg.current_price {
                Some(p) => p,
                None => {
                    warn!(symbol = %leg.symbol, "no price available to close leg");
                    return false;
                }
            },
        };

        let req = OrderRequest {
            symbol: leg.symbol.clone(),
            side: close_side,
            qty: leg.filled_qty,
            price,
            tick_size: leg.tick_size,
        };

        let first = self.fill.drive_close(req).await;
        let (closed_qty, close_avg) = self.settle_outcomes(&first, leg.filled_qty).await;

        if closed_qty >= leg.filled_qty && closed_qty > Decimal::ZERO {
            let symbol = leg.symbol.clone();
            self.book.with_position_mut(position_id, |p| {
                for l in p.legs_mut() {
                    if l.symbol == symbol {
                        l.close_price = Some(close_avg);
                        l.open_order_id = None;
                    }
                }
            });
            true
        } else {
            warn!(
                symbol = %leg.symbol,
                closed = %closed_qty,
                held = %leg.filled_qty,
                "leg not fully flattened"
            );
            false
        }
    }

    /// Drive the optional partial-fill completion and fold both outcomes
    /// into (total closed quantity, weighted average close price).
    async fn settle_outcomes(&self, first: &FillOutcome, target_qty: Decimal) -> (Decimal, Decimal) {
        let mut total_qty = first.filled_qty();
        let mut notional = first
            .avg_price()
            .map(|p| p * total_qty)
            .unwrap_or(Decimal::ZERO);

        let needs_followup = !first.is_complete()
            && first
                .snapshot
                .as_ref()
                .map(|s| s.remaining_qty() > Decimal::ZERO)
                .unwrap_or(false);

        if needs_followup && total_qty < target_qty {
            let first_id = first.snapshot.as_ref().map(|s| s.order_id.clone());
            let follow = self.fill.complete_partial(first).await;
            let same_order = follow
                .snapshot
                .as_ref()
                .map(|s| Some(s.order_id.clone()) == first_id)
                .unwrap_or(false);

            if same_order {
                // The residual cancel caught up with the original order.
                total_qty = follow.filled_qty();
                notional = follow
                    .avg_price()
                    .map(|p| p * total_qty)
                    .unwrap_or(Decimal::ZERO);
            } else {
                total_qty += follow.filled_qty();
                notional += follow
                    .avg_price()
                    .map(|p| p * follow.filled_qty())
                    .unwrap_or(Decimal::ZERO);
            }
        }

        if total_qty > Decimal::ZERO {
            (total_qty, notional / total_qty)
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        }
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer").field("book", &self.book).finish()
    }
}
