// =============================================================================
// Butterfly Builder: one iron butterfly per cycle
// =============================================================================
//
// Each cycle: fetch the reference price, pick strikes on the earliest
// expiry's chain, then fire the four leg orders concurrently through the
// fill driver and materialise whatever came back as a position. Market-data
// or strike-selection failures abort the cycle with no position; individual
// leg failures do not - the position is registered with the legs that
// filled and a partial-butterfly alert goes out.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::alerts::SharedAlerts;
use crate::chain::{self, ButterflySelection};
use crate::error::EngineError;
use crate::events::{self, EngineEvent};
use crate::fill::{FillDriver, FillOutcome};
use crate::position::{Leg, Position, PositionBook};
use crate::resilience::ApiExecutor;
use crate::scheduler::CycleTask;
use crate::types::{OptionContract, OrderRequest, OrderSide, TopOfBook};
use crate::venue::SharedVenue;

const BOOK_DEPTH: u32 = 5;

pub struct ButterflyBuilder {
    venue: SharedVenue,
    executor: ApiExecutor,
    fill: Arc<FillDriver>,
    book: Arc<PositionBook>,
    alerts: SharedAlerts,
    quantity: Decimal,
    strike_distance: u32,
}

impl ButterflyBuilder {
    pub fn new(
        venue: SharedVenue,
        executor: ApiExecutor,
        fill: Arc<FillDriver>,
        book: Arc<PositionBook>,
        alerts: SharedAlerts,
        quantity: Decimal,
        strike_distance: u32,
    ) -> Self {
        Self {
            venue,
            executor,
            fill,
            book,
            alerts,
            quantity,
            strike_distance,
        }
    }

    /// Build and register one butterfly.
    pub async fn build_one(&self) -> Result<(), EngineError> {
        let reference = self
            .executor
            .exec("reference_price", || self.venue.reference_price())
            .await?;

        let expiry = self.earliest_expiry().await?;
        let selection = self.select_with_retry(expiry, reference).await?;

        info!(
            %reference,
            %expiry,
            atm = %selection.atm_call.strike,
            call_wing = %selection.otm_call.strike,
            put_wing = %selection.otm_put.strike,
            "building butterfly"
        );

        // Quotes for all four legs; any miss fails the cycle before orders
        // go out.
        let sell_call_quote = self.quote(&selection.atm_call).await?;
        let sell_put_quote = self.quote(&selection.atm_put).await?;
        let buy_call_quote = self.quote(&selection.otm_call).await?;
        let buy_put_quote = self.quote(&selection.otm_put).await?;

        // Shorts are offered at the bid, longs bid at the ask, so all four
        // start on the marketable side of the spread.
        let orders = [
            self.order(&selection.atm_call, OrderSide::Sell, sell_call_quote.bid),
            self.order(&selection.atm_put, OrderSide::Sell, sell_put_quote.bid),
            self.order(&selection.otm_call, OrderSide::Buy, buy_call_quote.ask),
            self.order(&selection.otm_put, OrderSide::Buy, buy_put_quote.ask),
        ];
        let [sell_call_req, sell_put_req, buy_call_req, buy_put_req] = orders;

        let (sell_call_fill, sell_put_fill, buy_call_fill, buy_put_fill) = tokio::join!(
            self.fill.drive(sell_call_req),
            self.fill.drive(sell_put_req),
            self.fill.drive(buy_call_req),
            self.fill.drive(buy_put_req),
        );

        let sell_call = self.materialise_leg(&selection.atm_call, OrderSide::Sell, &sell_call_fill);
        let sell_put = self.materialise_leg(&selection.atm_put, OrderSide::Sell, &sell_put_fill);
        let buy_call = self.materialise_leg(&selection.otm_call, OrderSide::Buy, &buy_call_fill);
        let buy_put = self.materialise_leg(&selection.otm_put, OrderSide::Buy, &buy_put_fill);

        let mut position = Position::new(expiry, sell_call, sell_put, buy_call, buy_put)?;
        position.max_loss = position.compute_max_loss();

        let filled_legs = position.filled_leg_count();
        let position_id = position.id.clone();

        events::emit(
            EngineEvent::PositionCreated,
            &[
                ("position_id", position_id.clone()),
                ("atm_strike", position.atm_strike().to_string()),
                ("wing_width", position.wing_width().to_string()),
                ("net_premium", position.net_premium().to_string()),
                ("max_loss", position.max_loss.to_string()),
                ("filled_legs", filled_legs.to_string()),
            ],
        );
        self.book.register(position);

        if filled_legs < 4 {
            self.alerts.alert(&format!(
                "POSITION partial butterfly {}: only {filled_legs}/4 legs filled",
                &position_id[..8]
            ));
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    async fn earliest_expiry(&self) -> Result<NaiveDate, EngineError> {
        let today = Local::now().date_naive();
        let expiries = self
            .executor
            .exec("expiries", || self.venue.expiries())
            .await?;
        expiries
            .into_iter()
            .filter(|d| *d >= today)
            .min()
            .ok_or_else(|| EngineError::Other("no listed expiry on or after today".to_string()))
    }

    /// Strike selection gets one retry on a fresh chain; ATM call/put strike
    /// divergence is usually a transient chain update.
    async fn select_with_retry(
        &self,
        expiry: NaiveDate,
        reference: Decimal,
    ) -> Result<ButterflySelection, EngineError> {
        for attempt in 0..2 {
            let contracts = self
                .executor
                .exec("options_chain", || self.venue.options_chain(expiry))
                .await?;
            match chain::select_strikes(&contracts, reference, self.strike_distance) {
                Ok(selection) => return Ok(selection),
                Err(e) if attempt == 0 => {
                    warn!(error = %e, "strike selection failed, refetching chain once");
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("strike selection loop always returns");
    }

    async fn quote(&self, contract: &OptionContract) -> Result<TopOfBook, EngineError> {
        self.executor
            .exec("get_book", || self.venue.book(&contract.symbol, BOOK_DEPTH))
            .await
    }

    // -------------------------------------------------------------------------
    // Legs
    // -------------------------------------------------------------------------

    fn order(&self, contract: &OptionContract, side: OrderSide, price: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: contract.symbol.clone(),
            side,
            qty: self.quantity,
            price,
            tick_size: contract.tick_size,
        }
    }

    fn materialise_leg(
        &self,
        contract: &OptionContract,
        side: OrderSide,
        outcome: &FillOutcome,
    ) -> Leg {
        let mut leg = Leg::new(
            contract.symbol.clone(),
            contract.kind,
            contract.strike,
            self.quantity,
            side,
            contract.tick_size,
        );
        // The venue's average fill price is the entry; a leg with no fill
        // stays unfilled.
        if let Some(avg) = outcome.avg_price() {
            leg.record_entry(avg, outcome.filled_qty());
        }
        leg.open_order_id = outcome.resting_order_id();
        leg
    }
}

#[async_trait]
impl CycleTask for ButterflyBuilder {
    async fn run_cycle(&self, cycle: u32, total: u32) -> Result<(), EngineError> {
        info!(cycle, total, "cycle starting");
        self.build_one().await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_limiter::ErrorCounter;
    use crate::resilience::{BreakerConfig, CircuitBreaker};
    use crate::shutdown::ShutdownToken;
    use crate::testkit::{chain_with_strikes, option_symbol, FillPlan, MockVenue, RecordingAlerts};
    use crate::types::OptionKind;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        venue: Arc<MockVenue>,
        book: Arc<PositionBook>,
        alerts: Arc<RecordingAlerts>,
        builder: ButterflyBuilder,
    }

    fn harness() -> Harness {
        let venue = MockVenue::new();
        let alerts = RecordingAlerts::new();
        let book = Arc::new(PositionBook::new());
        let executor = ApiExecutor::new(Arc::new(CircuitBreaker::new(BreakerConfig::default())));
        let fill = Arc::new(FillDriver::new(
            venue.clone(),
            executor.clone(),
            alerts.clone(),
            Arc::new(ErrorCounter::new()),
            ShutdownToken::new(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        ));
        let builder = ButterflyBuilder::new(
            venue.clone(),
            executor,
            fill,
            book.clone(),
            alerts.clone(),
            dec!(0.1),
            2,
        );
        Harness {
            venue,
            book,
            alerts,
            builder,
        }
    }

    fn seed_market(h: &Harness) {
        h.venue.set_reference(dec!(59900));
        h.venue.set_chain(chain_with_strikes(&[
            dec!(56000),
            dec!(57000),
            dec!(58000),
            dec!(59000),
            dec!(60000),
            dec!(61000),
            dec!(62000),
            dec!(63000),
        ]));
        // Quotes for the four legs the selection will land on.
        h.venue
            .set_book(&option_symbol(dec!(60000), OptionKind::Call), dec!(150), dec!(155));
        h.venue
            .set_book(&option_symbol(dec!(60000), OptionKind::Put), dec!(140), dec!(145));
        h.venue
            .set_book(&option_symbol(dec!(62000), OptionKind::Call), dec!(58), dec!(60));
        h.venue
            .set_book(&option_symbol(dec!(58000), OptionKind::Put), dec!(53), dec!(55));
    }

    fn plan_all_fills(h: &Harness) {
        h.venue.set_plan(
            &option_symbol(dec!(60000), OptionKind::Call),
            FillPlan::Immediate(dec!(150)),
        );
        h.venue.set_plan(
            &option_symbol(dec!(60000), OptionKind::Put),
            FillPlan::Immediate(dec!(140)),
        );
        h.venue.set_plan(
            &option_symbol(dec!(62000), OptionKind::Call),
            FillPlan::Immediate(dec!(60)),
        );
        h.venue.set_plan(
            &option_symbol(dec!(58000), OptionKind::Put),
            FillPlan::Immediate(dec!(55)),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn builds_a_complete_butterfly() {
        let h = harness();
        seed_market(&h);
        plan_all_fills(&h);

        h.builder.build_one().await.unwrap();

        let positions = h.book.all_positions();
        assert_eq!(positions.len(), 1);
        let pos = &positions[0];
        assert_eq!(pos.atm_strike(), dec!(60000));
        assert_eq!(pos.wing_width(), dec!(2000));
        assert_eq!(pos.filled_leg_count(), 4);
        // Entries are the venue fill averages.
        assert_eq!(pos.sell_call.entry_price(), Some(dec!(150)));
        assert_eq!(pos.buy_put.entry_price(), Some(dec!(55)));
        // Credit 29 - debit 11.5 on 0.1 qty = 17.5; max loss 200 - 17.5.
        assert_eq!(pos.net_premium(), dec!(17.5));
        assert_eq!(pos.max_loss, dec!(182.5));

        // Shorts placed at the bid, longs at the ask.
        let call_body = option_symbol(dec!(60000), OptionKind::Call);
        let put_body = option_symbol(dec!(60000), OptionKind::Put);
        let call_wing = option_symbol(dec!(62000), OptionKind::Call);
        let put_wing = option_symbol(dec!(58000), OptionKind::Put);
        assert_eq!(h.venue.op_count(&format!("place {call_body} SELL @150")), 1);
        assert_eq!(h.venue.op_count(&format!("place {put_body} SELL @140")), 1);
        assert_eq!(h.venue.op_count(&format!("place {call_wing} BUY @60")), 1);
        assert_eq!(h.venue.op_count(&format!("place {put_wing} BUY @55")), 1);

        assert_eq!(h.alerts.alert_count_containing("partial butterfly"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_fill_registers_position_and_alerts() {
        let h = harness();
        seed_market(&h);
        plan_all_fills(&h);
        // The put wing never fills inside the 5 s order timeout.
        h.venue.set_plan(
            &option_symbol(dec!(58000), OptionKind::Put),
            FillPlan::Never,
        );

        h.builder.build_one().await.unwrap();

        let positions = h.book.all_positions();
        assert_eq!(positions.len(), 1);
        let pos = &positions[0];
        assert_eq!(pos.filled_leg_count(), 3);
        assert!(!pos.buy_put.is_filled());
        // The resting unfilled order is remembered for later cancellation.
        assert!(pos.buy_put.open_order_id.is_some());
        // Unfilled leg contributes no premium.
        assert_eq!(pos.net_premium(), dec!(23));
        assert_eq!(h.alerts.alert_count_containing("partial butterfly"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reference_price_failure_fails_the_cycle_with_no_position() {
        let h = harness();
        seed_market(&h);
        for _ in 0..3 {
            h.venue.queue_error(
                "reference_price",
                EngineError::api(0, "TIMEOUT", "index feed down"),
            );
        }

        assert!(h.builder.build_one().await.is_err());
        assert!(h.book.all_positions().is_empty());
        assert_eq!(h.venue.op_count("place"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn selection_failure_refetches_the_chain_once() {
        let h = harness();
        h.venue.set_reference(dec!(59900));
        // A chain whose nearest call and put strikes diverge.
        let mut contracts = chain_with_strikes(&[dec!(56000), dec!(64000)]);
        contracts.push(crate::types::OptionContract {
            symbol: option_symbol(dec!(60000), OptionKind::Call),
            kind: OptionKind::Call,
            strike: dec!(60000),
            expiry: crate::testkit::test_expiry(),
            tick_size: dec!(0.1),
            book: None,
        });
        contracts.push(crate::types::OptionContract {
            symbol: option_symbol(dec!(59000), OptionKind::Put),
            kind: OptionKind::Put,
            strike: dec!(59000),
            expiry: crate::testkit::test_expiry(),
            tick_size: dec!(0.1),
            book: None,
        });
        h.venue.set_chain(contracts);

        assert!(h.builder.build_one().await.is_err());
        // Initial fetch plus exactly one retry.
        assert_eq!(h.venue.op_count("options_chain"), 2);
        assert!(h.book.all_positions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_leg_quote_fails_the_cycle_before_any_order() {
        let h = harness();
        h.venue.set_reference(dec!(59900));
        h.venue.set_chain(chain_with_strikes(&[
            dec!(56000),
            dec!(58000),
            dec!(60000),
            dec!(62000),
            dec!(64000),
        ]));
        // Quotes exist for the body only; the wings have no book.
        h.venue
            .set_book(&option_symbol(dec!(60000), OptionKind::Call), dec!(150), dec!(155));
        h.venue
            .set_book(&option_symbol(dec!(60000), OptionKind::Put), dec!(140), dec!(145));

        assert!(h.builder.build_one().await.is_err());
        assert_eq!(h.venue.op_count("place"), 0);
        assert!(h.book.all_positions().is_empty());
    }
}
