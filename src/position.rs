// =============================================================================
// Iron-butterfly position model and the shared open-position book
// =============================================================================
//
// Life-cycle:
//   Open -> ClosedProfit | ClosedLoss | ClosedRisk
//
// Terminal states are final. A leg's entry price is written once, on the
// first fill, and never changes until the position is closed; the current
// mark moves freely. All mutable position state lives behind one
// `parking_lot::Mutex` owned by the book; readers get cloned snapshots.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{OptionKind, OrderSide, PositionStatus, TopOfBook};

// ---------------------------------------------------------------------------
// Leg
// ---------------------------------------------------------------------------

/// One of the four sides of a butterfly.
#[derive(Debug, Clone)]
pub struct Leg {
    pub symbol: String,
    pub kind: OptionKind,
    pub strike: Decimal,
    /// Declared quantity, shared by all four legs.
    pub qty: Decimal,
    pub side: OrderSide,
    /// Price increment of the contract, kept for closing orders.
    pub tick_size: Decimal,
    /// Venue-reported average fill price of the opening order. Absent means
    /// the leg never filled.
    entry_price: Option<Decimal>,
    /// Portion of `qty` actually filled on open.
    pub filled_qty: Decimal,
    /// Most recent observed mark (best bid for shorts, best ask for longs).
    pub current_price: Option<Decimal>,
    /// Venue id of a still-open opening order (residual at deadline).
    pub open_order_id: Option<String>,
    /// Average fill price of the closing order, once the leg is flattened.
    pub close_price: Option<Decimal>,
}

impl Leg {
    pub fn new(
        symbol: impl Into<String>,
        kind: OptionKind,
        strike: Decimal,
        qty: Decimal,
        side: OrderSide,
        tick_size: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            strike,
            qty,
            side,
            tick_size,
            entry_price: None,
            filled_qty: Decimal::ZERO,
            current_price: None,
            open_order_id: None,
            close_price: None,
        }
    }

    pub fn entry_price(&self) -> Option<Decimal> {
        self.entry_price
    }

    /// Record the opening fill. The entry price is write-once: a second call
    /// is ignored and logged, it indicates a driver bug upstream.
    pub fn record_entry(&mut self, avg_price: Decimal, filled_qty: Decimal) {
        if self.entry_price.is_some() {
            warn!(symbol = %self.symbol, "entry price already set, ignoring repeat fill report");
            return;
        }
        if filled_qty <= Decimal::ZERO {
            return;
        }
        self.entry_price = Some(avg_price);
        self.filled_qty = filled_qty;
        self.current_price = Some(avg_price);
    }

    /// A leg counts as filled only when it has an entry price.
    pub fn is_filled(&self) -> bool {
        self.entry_price.is_some()
    }

    pub fn mark(&mut self, price: Decimal) {
        self.current_price = Some(price);
    }

    fn direction(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// (current - entry) x filled qty, sign-flipped for short legs. Legs
    /// without an entry or a mark contribute zero.
    pub fn unrealized_pnl(&self) -> Decimal {
        match (self.entry_price, self.current_price) {
            (Some(entry), Some(current)) => self.direction() * (current - entry) * self.filled_qty,
            _ => Decimal::ZERO,
        }
    }

    /// Premium cashflow at open: positive for credit (short) legs, negative
    /// for debit (long) legs, zero when unfilled.
    pub fn premium_cashflow(&self) -> Decimal {
        match self.entry_price {
            Some(entry) => -self.direction() * entry * self.filled_qty,
            None => Decimal::ZERO,
        }
    }

    /// P&L realized by the closing fill, falling back to the last mark for
    /// legs that never got a close fill.
    pub fn realized_pnl(&self) -> Decimal {
        let entry = match self.entry_price {
            Some(e) => e,
            None => return Decimal::ZERO,
        };
        let exit = self.close_price.or(self.current_price).unwrap_or(entry);
        self.direction() * (exit - entry) * self.filled_qty
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// An iron butterfly: short call + short put at the ATM strike K, long call
/// at K + w, long put at K - w.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expiry: NaiveDate,
    pub status: PositionStatus,
    pub status_reason: Option<String>,
    pub sell_call: Leg,
    pub sell_put: Leg,
    pub buy_call: Leg,
    pub buy_put: Leg,
    /// Worst-case loss at expiry, cached once after the opening fills.
    pub max_loss: Decimal,
}

impl Position {
    /// Assemble a butterfly and check its structural invariants:
    /// strike ordering, shared quantity, correct sides and kinds.
    pub fn new(
        expiry: NaiveDate,
        sell_call: Leg,
        sell_put: Leg,
        buy_call: Leg,
        buy_put: Leg,
    ) -> Result<Self, EngineError> {
        if sell_call.strike != sell_put.strike {
            return Err(EngineError::Other(format!(
                "butterfly body strikes differ: {} vs {}",
                sell_call.strike, sell_put.strike
            )));
        }
        if !(buy_call.strike > sell_call.strike && sell_put.strike > buy_put.strike) {
            return Err(EngineError::Other(format!(
                "butterfly strikes not ordered: {} / {} / {}",
                buy_put.strike, sell_call.strike, buy_call.strike
            )));
        }
        let qty = sell_call.qty;
        if sell_put.qty != qty || buy_call.qty != qty || buy_put.qty != qty {
            return Err(EngineError::Other(
                "butterfly legs must share one declared quantity".to_string(),
            ));
        }
        let sides_ok = sell_call.side == OrderSide::Sell
            && sell_put.side == OrderSide::Sell
            && buy_call.side == OrderSide::Buy
            && buy_put.side == OrderSide::Buy
            && sell_call.kind == OptionKind::Call
            && buy_call.kind == OptionKind::Call
            && sell_put.kind == OptionKind::Put
            && buy_put.kind == OptionKind::Put;
        if !sides_ok {
            return Err(EngineError::Other(
                "butterfly legs have wrong side/kind assignment".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            expiry,
            status: PositionStatus::Open,
            status_reason: None,
            sell_call,
            sell_put,
            buy_call,
            buy_put,
            max_loss: Decimal::ZERO,
        })
    }

    pub fn legs(&self) -> [&Leg; 4] {
        [&self.sell_call, &self.sell_put, &self.buy_call, &self.buy_put]
    }

    pub fn legs_mut(&mut self) -> [&mut Leg; 4] {
        [
            &mut self.sell_call,
            &mut self.sell_put,
            &mut self.buy_call,
            &mut self.buy_put,
        ]
    }

    /// The shared body strike K.
    pub fn atm_strike(&self) -> Decimal {
        self.sell_call.strike
    }

    pub fn wing_width(&self) -> Decimal {
        self.buy_call.strike - self.sell_call.strike
    }

    pub fn filled_leg_count(&self) -> usize {
        self.legs().iter().filter(|l| l.is_filled()).count()
    }

    /// Credit collected on the shorts minus debit paid on the longs.
    /// Unfilled legs contribute zero.
    pub fn net_premium(&self) -> Decimal {
        self.legs().iter().map(|l| l.premium_cashflow()).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.legs().iter().map(|l| l.unrealized_pnl()).sum()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.legs().iter().map(|l| l.realized_pnl()).sum()
    }

    /// Wing width x declared quantity minus net premium received.
    pub fn compute_max_loss(&self) -> Decimal {
        self.wing_width() * self.sell_call.qty - self.net_premium()
    }
}

// ---------------------------------------------------------------------------
// Position book
// ---------------------------------------------------------------------------

/// Owner of every position created this session. The monitor reads marks
/// into it, the closer flips statuses; everyone else gets clones.
pub struct PositionBook {
    positions: Mutex<Vec<Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, position: Position) {
        info!(
            id = %position.id,
            atm = %position.atm_strike(),
            wing = %position.wing_width(),
            filled_legs = position.filled_leg_count(),
            max_loss = %position.max_loss,
            "position registered"
        );
        self.positions.lock().push(position);
    }

    pub fn get(&self, id: &str) -> Option<Position> {
        self.positions.lock().iter().find(|p| p.id == id).cloned()
    }

    /// Snapshot of every position still open.
    pub fn open_positions(&self) -> Vec<Position> {
        self.positions
            .lock()
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect()
    }

    pub fn all_positions(&self) -> Vec<Position> {
        self.positions.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.positions
            .lock()
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .count()
    }

    /// Update the mark of every open leg trading `symbol`. Short legs mark
    /// at the bid (the buy-back price), long legs at the ask.
    pub fn apply_book(&self, symbol: &str, book: &TopOfBook) {
        let mut positions = self.positions.lock();
        for pos in positions
            .iter_mut()
            .filter(|p| p.status == PositionStatus::Open)
        {
            for leg in pos.legs_mut() {
                if leg.symbol == symbol {
                    let mark = match leg.side {
                        OrderSide::Sell => book.bid,
                        OrderSide::Buy => book.ask,
                    };
                    leg.mark(mark);
                }
            }
        }
    }

    /// Run `f` against one open position in place, under the book lock.
    pub fn with_position_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Position) -> R,
    ) -> Option<R> {
        let mut positions = self.positions.lock();
        positions.iter_mut().find(|p| p.id == id).map(f)
    }

    /// Transition a position out of Open. Terminal statuses are final: a
    /// second transition attempt is refused, as is any transition to Open.
    pub fn set_status(&self, id: &str, status: PositionStatus, reason: &str) -> bool {
        if !status.is_terminal() {
            warn!(id, "refusing transition back to OPEN");
            return false;
        }
        let mut positions = self.positions.lock();
        match positions.iter_mut().find(|p| p.id == id) {
            Some(pos) if pos.status == PositionStatus::Open => {
                pos.status = status;
                pos.status_reason = Some(reason.to_string());
                info!(id, status = %status, reason, "position status set");
                true
            }
            Some(pos) => {
                warn!(id, current = %pos.status, "position already terminal, status unchanged");
                false
            }
            None => {
                warn!(id, "unknown position id");
                false
            }
        }
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let positions = self.positions.lock();
        f.debug_struct("PositionBook")
            .field("total", &positions.len())
            .field(
                "open",
                &positions
                    .iter()
                    .filter(|p| p.status == PositionStatus::Open)
                    .count(),
            )
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 7).unwrap()
    }

    fn leg(kind: OptionKind, strike: Decimal, side: OrderSide) -> Leg {
        let suffix = match kind {
            OptionKind::Call => "C",
            OptionKind::Put => "P",
        };
        Leg::new(
            format!("BTC-260807-{strike}-{suffix}"),
            kind,
            strike,
            dec!(0.1),
            side,
            dec!(0.1),
        )
    }

    fn butterfly() -> Position {
        Position::new(
            expiry(),
            leg(OptionKind::Call, dec!(60000), OrderSide::Sell),
            leg(OptionKind::Put, dec!(60000), OrderSide::Sell),
            leg(OptionKind::Call, dec!(62000), OrderSide::Buy),
            leg(OptionKind::Put, dec!(58000), OrderSide::Buy),
        )
        .unwrap()
    }

    #[test]
    fn construction_enforces_strike_ordering() {
        let result = Position::new(
            expiry(),
            leg(OptionKind::Call, dec!(60000), OrderSide::Sell),
            leg(OptionKind::Put, dec!(60000), OrderSide::Sell),
            leg(OptionKind::Call, dec!(59000), OrderSide::Buy),
            leg(OptionKind::Put, dec!(58000), OrderSide::Buy),
        );
        assert!(result.is_err());
    }

    #[test]
    fn construction_enforces_shared_body_strike() {
        let result = Position::new(
            expiry(),
            leg(OptionKind::Call, dec!(60000), OrderSide::Sell),
            leg(OptionKind::Put, dec!(61000), OrderSide::Sell),
            leg(OptionKind::Call, dec!(62000), OrderSide::Buy),
            leg(OptionKind::Put, dec!(58000), OrderSide::Buy),
        );
        assert!(result.is_err());
    }

    #[test]
    fn construction_enforces_shared_quantity() {
        let mut fat = leg(OptionKind::Put, dec!(58000), OrderSide::Buy);
        fat.qty = dec!(0.2);
        let result = Position::new(
            expiry(),
            leg(OptionKind::Call, dec!(60000), OrderSide::Sell),
            leg(OptionKind::Put, dec!(60000), OrderSide::Sell),
            leg(OptionKind::Call, dec!(62000), OrderSide::Buy),
            fat,
        );
        assert!(result.is_err());
    }

    #[test]
    fn entry_price_is_write_once() {
        let mut l = leg(OptionKind::Call, dec!(60000), OrderSide::Sell);
        l.record_entry(dec!(150), dec!(0.1));
        l.record_entry(dec!(999), dec!(0.1));
        assert_eq!(l.entry_price(), Some(dec!(150)));
    }

    #[test]
    fn short_leg_profits_when_price_falls() {
        let mut l = leg(OptionKind::Call, dec!(60000), OrderSide::Sell);
        l.record_entry(dec!(150), dec!(0.1));
        l.mark(dec!(100));
        // Sold at 150, buy-back now 100: profit 50 * 0.1
        assert_eq!(l.unrealized_pnl(), dec!(5.0));

        l.mark(dec!(200));
        assert_eq!(l.unrealized_pnl(), dec!(-5.0));
    }

    #[test]
    fn unfilled_legs_contribute_nothing() {
        let mut pos = butterfly();
        pos.sell_call.record_entry(dec!(150), dec!(0.1));
        pos.sell_call.mark(dec!(150));
        assert_eq!(pos.filled_leg_count(), 1);
        assert_eq!(pos.net_premium(), dec!(15.0));
        assert_eq!(pos.unrealized_pnl(), Decimal::ZERO);
    }

    #[test]
    fn net_premium_and_max_loss() {
        let mut pos = butterfly();
        pos.sell_call.record_entry(dec!(150), dec!(0.1));
        pos.sell_put.record_entry(dec!(140), dec!(0.1));
        pos.buy_call.record_entry(dec!(60), dec!(0.1));
        pos.buy_put.record_entry(dec!(55), dec!(0.1));

        // Credit 29.0 - debit 11.5 = 17.5
        assert_eq!(pos.net_premium(), dec!(17.5));
        // 2000 * 0.1 - 17.5
        assert_eq!(pos.compute_max_loss(), dec!(182.5));
    }

    #[test]
    fn realized_pnl_prefers_close_fills() {
        let mut pos = butterfly();
        pos.sell_call.record_entry(dec!(150), dec!(0.1));
        pos.sell_call.close_price = Some(dec!(120));
        pos.buy_call.record_entry(dec!(60), dec!(0.1));
        pos.buy_call.mark(dec!(70));

        // Short: (150-120)*0.1 = 3.0; long falls back to mark: (70-60)*0.1 = 1.0
        assert_eq!(pos.realized_pnl(), dec!(4.0));
    }

    #[test]
    fn position_ids_are_unique() {
        let a = butterfly();
        let b = butterfly();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn terminal_status_never_reverts() {
        let book = PositionBook::new();
        let pos = butterfly();
        let id = pos.id.clone();
        book.register(pos);

        assert!(book.set_status(&id, PositionStatus::ClosedLoss, "Stop-loss: 30%"));
        assert!(!book.set_status(&id, PositionStatus::ClosedProfit, "nope"));
        assert!(!book.set_status(&id, PositionStatus::Open, "nope"));

        let stored = book.get(&id).unwrap();
        assert_eq!(stored.status, PositionStatus::ClosedLoss);
        assert_eq!(stored.status_reason.as_deref(), Some("Stop-loss: 30%"));
    }

    #[test]
    fn apply_book_marks_shorts_at_bid_and_longs_at_ask() {
        let book = PositionBook::new();
        let pos = butterfly();
        let id = pos.id.clone();
        let short_symbol = pos.sell_call.symbol.clone();
        let long_symbol = pos.buy_call.symbol.clone();
        book.register(pos);

        let quote = TopOfBook {
            bid: dec!(140),
            ask: dec!(145),
            bid_size: dec!(2),
            ask_size: dec!(2),
        };
        book.apply_book(&short_symbol, &quote);
        book.apply_book(&long_symbol, &quote);

        let stored = book.get(&id).unwrap();
        assert_eq!(stored.sell_call.current_price, Some(dec!(140)));
        assert_eq!(stored.buy_call.current_price, Some(dec!(145)));
        assert_eq!(stored.sell_put.current_price, None);
    }

    #[test]
    fn open_positions_excludes_terminal() {
        let book = PositionBook::new();
        let pos = butterfly();
        let id = pos.id.clone();
        book.register(pos);
        book.register(butterfly());

        assert_eq!(book.open_count(), 2);
        book.set_status(&id, PositionStatus::ClosedRisk, "Portfolio stop-loss triggered");
        assert_eq!(book.open_count(), 1);
        assert_eq!(book.all_positions().len(), 2);
    }
}
