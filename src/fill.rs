// =============================================================================
// Aggressive-Fill Driver: one limit order from placement to fill
// =============================================================================
//
// Drives a single leg toward a complete fill inside a per-order deadline
// without ever crossing to a market order. Once per poll tick it refreshes
// the order status, reads the top of book, and walks the limit price across
// the spread:
//
//   SELL: best_bid * 0.999, rounded DOWN to the tick
//   BUY:  best_ask * 1.001, rounded UP to the tick
//
// At most one modification is in flight at a time (the loop is sequential).
// Transient venue errors are tolerated; rate limits stretch the next sleep
// up to a cap; an open circuit breaker aborts the loop with the current
// snapshot; a shutdown signal stops the loop without further venue calls.
// The entry price reported downstream is always the venue's average fill
// price, never the requested limit.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::alerts::SharedAlerts;
use crate::error::{EngineError, CIRCUIT_BREAKER_OPEN};
use crate::error_limiter::ErrorCounter;
use crate::events::{self, EngineEvent};
use crate::resilience::ApiExecutor;
use crate::shutdown::ShutdownToken;
use crate::types::{OrderRequest, OrderSide, OrderSnapshot, TopOfBook};
use crate::venue::SharedVenue;

const SELL_FACTOR: Decimal = dec!(0.999);
const BUY_FACTOR: Decimal = dec!(1.001);
/// Longest sleep a run of rate-limit errors can stretch the poll to.
const RATE_LIMIT_SLEEP_CAP: Duration = Duration::from_secs(30);
const BOOK_DEPTH: u32 = 5;

/// Result of driving one leg: the last venue snapshot (None when placement
/// itself failed) and whether the per-order deadline expired.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    pub request: OrderRequest,
    pub snapshot: Option<OrderSnapshot>,
    pub timed_out: bool,
}

impl FillOutcome {
    pub fn filled_qty(&self) -> Decimal {
        self.snapshot
            .as_ref()
            .map(|s| s.filled_qty)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn avg_price(&self) -> Option<Decimal> {
        self.snapshot
            .as_ref()
            .filter(|s| s.filled_qty > Decimal::ZERO)
            .map(|s| s.avg_price)
    }

    pub fn is_complete(&self) -> bool {
        self.snapshot.as_ref().map(|s| s.is_filled()).unwrap_or(false)
    }

    /// Id of an order left resting on the venue (unfilled or partial).
    pub fn resting_order_id(&self) -> Option<String> {
        self.snapshot
            .as_ref()
            .filter(|s| !s.status.is_terminal() && s.remaining_qty() > Decimal::ZERO)
            .map(|s| s.order_id.clone())
    }
}

enum LoopVerdict {
    Continue,
    Abort,
}

/// Drives limit orders for both the builder (open legs) and the closer
/// (flattening legs). Close drives ignore the shutdown token so an exiting
/// engine can still flatten.
pub struct FillDriver {
    venue: SharedVenue,
    executor: ApiExecutor,
    alerts: SharedAlerts,
    limiter: Arc<ErrorCounter>,
    shutdown: ShutdownToken,
    order_timeout: Duration,
    poll_interval: Duration,
}

impl FillDriver {
    pub fn new(
        venue: SharedVenue,
        executor: ApiExecutor,
        alerts: SharedAlerts,
        limiter: Arc<ErrorCounter>,
        shutdown: ShutdownToken,
        order_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            venue,
            executor,
            alerts,
            limiter,
            shutdown,
            order_timeout,
            poll_interval,
        }
    }

    /// Drive an opening leg. Aborts promptly on shutdown.
    pub async fn drive(&self, req: OrderRequest) -> FillOutcome {
        self.run(req, true).await
    }

    /// Drive a closing leg. Runs to fill or deadline even during shutdown.
    pub async fn drive_close(&self, req: OrderRequest) -> FillOutcome {
        self.run(req, false).await
    }

    /// Optional follow-up for a partial fill: cancel the residual order,
    /// reprice from the current book, and drive the remaining quantity once
    /// more.
    pub async fn complete_partial(&self, prior: &FillOutcome) -> FillOutcome {
        let snap = match &prior.snapshot {
            Some(s) if s.remaining_qty() > Decimal::ZERO && !s.is_filled() => s.clone(),
            _ => return prior.clone(),
        };

        // Cancel the residual; fills that raced the cancel show up in the
        // returned snapshot.
        let order_id = snap.order_id.clone();
        let symbol = prior.request.symbol.clone();
        let after_cancel = match self
            .executor
            .exec("cancel_order", || {
                self.venue.cancel_order(&order_id, &symbol)
            })
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(order_id = %snap.order_id, error = %e, "residual cancel failed");
                snap.clone()
            }
        };

        let remaining = after_cancel.remaining_qty();
        if remaining <= Decimal::ZERO {
            return FillOutcome {
                request: prior.request.clone(),
                snapshot: Some(after_cancel),
                timed_out: false,
            };
        }

        let price = match self
            .executor
            .exec("get_book", || self.venue.book(&prior.request.symbol, BOOK_DEPTH))
            .await
        {
            Ok(book) => match prior.request.side {
                OrderSide::Sell => book.bid,
                OrderSide::Buy => book.ask,
            },
            Err(_) => prior.request.price,
        };

        let req = OrderRequest {
            qty: remaining,
            price,
            ..prior.request.clone()
        };
        self.run(req, false).await
    }

    // -------------------------------------------------------------------------
    // Core loop
    // -------------------------------------------------------------------------

    async fn run(&self, req: OrderRequest, respect_shutdown: bool) -> FillOutcome {
        if respect_shutdown && self.shutdown.is_triggered() {
            return FillOutcome {
                request: req,
                snapshot: None,
                timed_out: false,
            };
        }

        // --- Placed ---------------------------------------------------------
        let placed = self
            .executor
            .exec("place_order", || self.venue.place_order(&req))
            .await;

        let mut snapshot = match placed {
            Ok(s) => s,
            Err(e) => {
                self.report_error(&e, "place_order");
                return FillOutcome {
                    request: req,
                    snapshot: None,
                    timed_out: false,
                };
            }
        };

        events::emit(
            EngineEvent::OrderPlaced,
            &[
                ("order_id", snapshot.order_id.clone()),
                ("symbol", req.symbol.clone()),
                ("side", req.side.to_string()),
                ("qty", req.qty.to_string()),
                ("price", req.price.to_string()),
            ],
        );

        if snapshot.is_filled() {
            self.emit_filled(&req, &snapshot);
            return FillOutcome {
                request: req,
                snapshot: Some(snapshot),
                timed_out: false,
            };
        }

        // --- Monitoring -----------------------------------------------------
        let deadline = Instant::now() + self.order_timeout;
        let mut sleep_for = self.poll_interval;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.finalize_timeout(req, snapshot).await;
            }

            let nap = sleep_for.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = self.shutdown.triggered(), if respect_shutdown => {
                    debug!(order_id = %snapshot.order_id, "fill driver stopped by shutdown");
                    return FillOutcome { request: req, snapshot: Some(snapshot), timed_out: false };
                }
            }
            sleep_for = self.poll_interval;

            // The deadline wins over any scheduled poll.
            if Instant::now() >= deadline {
                return self.finalize_timeout(req, snapshot).await;
            }
            if respect_shutdown && self.shutdown.is_triggered() {
                return FillOutcome {
                    request: req,
                    snapshot: Some(snapshot),
                    timed_out: false,
                };
            }

            // 1. Order status.
            let order_id = snapshot.order_id.clone();
            match self
                .executor
                .exec("get_order", || self.venue.get_order(&order_id, &req.symbol))
                .await
            {
                Ok(s) => {
                    snapshot = s;
                    if snapshot.is_filled() {
                        self.emit_filled(&req, &snapshot);
                        return FillOutcome {
                            request: req,
                            snapshot: Some(snapshot),
                            timed_out: false,
                        };
                    }
                    if snapshot.status.is_terminal() {
                        // Cancelled or rejected from outside: nothing to drive.
                        warn!(order_id = %snapshot.order_id, status = %snapshot.status, "order terminal before fill");
                        return FillOutcome {
                            request: req,
                            snapshot: Some(snapshot),
                            timed_out: false,
                        };
                    }
                }
                Err(e) => {
                    match self.note_loop_error(&e, "get_order", &mut sleep_for) {
                        LoopVerdict::Abort => {
                            return FillOutcome {
                                request: req,
                                snapshot: Some(snapshot),
                                timed_out: false,
                            }
                        }
                        LoopVerdict::Continue => continue,
                    }
                }
            }

            // 2. Top of book.
            let book = match self
                .executor
                .exec("get_book", || self.venue.book(&req.symbol, BOOK_DEPTH))
                .await
            {
                Ok(b) => b,
                Err(e) => match self.note_loop_error(&e, "get_book", &mut sleep_for) {
                    LoopVerdict::Abort => {
                        return FillOutcome {
                            request: req,
                            snapshot: Some(snapshot),
                            timed_out: false,
                        }
                    }
                    LoopVerdict::Continue => continue,
                },
            };

            // 3. Reprice across the spread when it moves a full tick.
            let target = aggressive_price(req.side, &book, req.tick_size);
            if target <= Decimal::ZERO || (target - snapshot.price).abs() < req.tick_size {
                continue;
            }

            let order_id = snapshot.order_id.clone();
            let total_qty = snapshot.original_qty;
            match self
                .executor
                .exec("modify_order", || {
                    self.venue.modify_order(&order_id, &req.symbol, total_qty, target)
                })
                .await
            {
                Ok(s) => {
                    snapshot = s;
                    events::emit(
                        EngineEvent::OrderModified,
                        &[
                            ("order_id", snapshot.order_id.clone()),
                            ("symbol", req.symbol.clone()),
                            ("price", target.to_string()),
                        ],
                    );
                    // Modification can race the fill.
                    if snapshot.is_filled() {
                        self.emit_filled(&req, &snapshot);
                        return FillOutcome {
                            request: req,
                            snapshot: Some(snapshot),
                            timed_out: false,
                        };
                    }
                }
                Err(e) => {
                    if let LoopVerdict::Abort = self.note_loop_error(&e, "modify_order", &mut sleep_for)
                    {
                        return FillOutcome {
                            request: req,
                            snapshot: Some(snapshot),
                            timed_out: false,
                        };
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Deadline and error handling
    // -------------------------------------------------------------------------

    async fn finalize_timeout(&self, req: OrderRequest, last: OrderSnapshot) -> FillOutcome {
        // One last status read; no new orders or modifications past this
        // point.
        let order_id = last.order_id.clone();
        let snapshot = match self
            .executor
            .exec("get_order", || self.venue.get_order(&order_id, &req.symbol))
            .await
        {
            Ok(s) => s,
            Err(_) => last,
        };

        events::emit(
            EngineEvent::OrderTimeout,
            &[
                ("order_id", snapshot.order_id.clone()),
                ("symbol", req.symbol.clone()),
                ("filled_qty", snapshot.filled_qty.to_string()),
                ("status", snapshot.status.to_string()),
            ],
        );
        self.alerts.alert(&format!(
            "ORDER not filled before deadline: {} {} qty={} filled={} last_price={} status={}",
            req.symbol,
            req.side,
            req.qty,
            snapshot.filled_qty,
            snapshot.price,
            snapshot.status
        ));

        FillOutcome {
            request: req,
            snapshot: Some(snapshot),
            timed_out: true,
        }
    }

    fn note_loop_error(
        &self,
        err: &EngineError,
        op: &str,
        sleep_for: &mut Duration,
    ) -> LoopVerdict {
        if err.code() == CIRCUIT_BREAKER_OPEN {
            warn!(op, "circuit breaker open, abandoning fill loop");
            return LoopVerdict::Abort;
        }

        if err.is_rate_limit() {
            *sleep_for = (*sleep_for * 2).min(RATE_LIMIT_SLEEP_CAP);
            debug!(op, next_sleep_secs = sleep_for.as_secs(), "rate limited, stretching poll");
            if self.limiter.allow_rate_limit_alert(op) {
                self.alerts
                    .alert(&format!("ORDER venue rate limit hit during {op}"));
            }
            return LoopVerdict::Continue;
        }

        warn!(op, error = %err, "transient error inside fill loop");
        if self.limiter.record(&err.code(), op) {
            self.alerts
                .alert(&format!("ORDER repeated {} errors during {op}", err.code()));
        }
        LoopVerdict::Continue
    }

    fn report_error(&self, err: &EngineError, op: &str) {
        if err.is_recoverable() {
            warn!(op, error = %err, "order placement failed");
            if self.limiter.record(&err.code(), op) {
                self.alerts
                    .alert(&format!("ORDER repeated {} errors during {op}", err.code()));
            }
        } else {
            self.alerts.alert(&format!(
                "ORDER {op} failed with non-recoverable {}: {err}",
                err.code()
            ));
        }
    }

    fn emit_filled(&self, req: &OrderRequest, snapshot: &OrderSnapshot) {
        events::emit(
            EngineEvent::OrderFilled,
            &[
                ("order_id", snapshot.order_id.clone()),
                ("symbol", req.symbol.clone()),
                ("side", req.side.to_string()),
                ("avg_price", snapshot.avg_price.to_string()),
                ("filled_qty", snapshot.filled_qty.to_string()),
            ],
        );
    }
}

/// The price that crosses the spread by a hair, snapped to the tick grid in
/// the direction that keeps it aggressive.
pub fn aggressive_price(side: OrderSide, book: &TopOfBook, tick: Decimal) -> Decimal {
    match side {
        OrderSide::Sell => round_down_to_tick(book.bid * SELL_FACTOR, tick),
        OrderSide::Buy => round_up_to_tick(book.ask * BUY_FACTOR, tick),
    }
}

fn round_down_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).floor() * tick
}

fn round_up_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).ceil() * tick
}
