// =============================================================================
// Test doubles shared by the unit tests: a scriptable venue and a recording
// alert sink
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::alerts::AlertSink;
use crate::error::EngineError;
use crate::types::{
    OptionContract, OrderRequest, OrderSnapshot, OrderStatus, TopOfBook,
};
use crate::venue::OptionsVenue;

/// How a scripted symbol behaves when an order lands on it.
#[derive(Debug, Clone, Copy)]
pub enum FillPlan {
    /// Accept the order and never fill it.
    Never,
    /// Fill fully at placement, at the given average price.
    Immediate(Decimal),
    /// Fill fully at the given price after N status polls.
    AfterPolls(u32, Decimal),
    /// Fill the given quantity at the given price, then stall.
    Partial(Decimal, Decimal),
}

struct MockOrder {
    snapshot: OrderSnapshot,
    symbol: String,
    plan: FillPlan,
    polls: u32,
}

/// In-memory `OptionsVenue` with scriptable fills, failures, and latency.
pub struct MockVenue {
    reference: Mutex<Decimal>,
    chain: Mutex<Vec<OptionContract>>,
    books: Mutex<HashMap<String, TopOfBook>>,
    plans: Mutex<HashMap<String, FillPlan>>,
    orders: Mutex<HashMap<String, MockOrder>>,
    errors: Mutex<HashMap<&'static str, VecDeque<EngineError>>>,
    latency: Mutex<Duration>,
    ops: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl MockVenue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reference: Mutex::new(Decimal::ZERO),
            chain: Mutex::new(Vec::new()),
            books: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            ops: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    // --- scripting -----------------------------------------------------------

    pub fn set_reference(&self, price: Decimal) {
        *self.reference.lock() = price;
    }

    pub fn set_chain(&self, chain: Vec<OptionContract>) {
        *self.chain.lock() = chain;
    }

    pub fn set_book(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.books.lock().insert(
            symbol.to_string(),
            TopOfBook {
                bid,
                ask,
                bid_size: Decimal::ONE,
                ask_size: Decimal::ONE,
            },
        );
    }

    pub fn set_plan(&self, symbol: &str, plan: FillPlan) {
        self.plans.lock().insert(symbol.to_string(), plan);
    }

    /// Queue an error to be returned by the next call(s) to `op`.
    pub fn queue_error(&self, op: &'static str, err: EngineError) {
        self.errors.lock().entry(op).or_default().push_back(err);
    }

    /// Delay applied at the start of every venue call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    // --- inspection ----------------------------------------------------------

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn op_count(&self, prefix: &str) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| op.starts_with(prefix))
            .count()
    }

    pub fn order_snapshot(&self, order_id: &str) -> Option<OrderSnapshot> {
        self.orders.lock().get(order_id).map(|o| o.snapshot.clone())
    }

    // --- internals -----------------------------------------------------------

    async fn enter(&self, op: &'static str, detail: String) -> Result<(), EngineError> {
        let latency = *self.latency.lock();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        self.ops.lock().push(format!("{op} {detail}"));
        if let Some(err) = self.errors.lock().get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }

    fn plan_for(&self, symbol: &str) -> FillPlan {
        self.plans
            .lock()
            .get(symbol)
            .copied()
            .unwrap_or(FillPlan::Never)
    }
}

#[async_trait]
impl OptionsVenue for MockVenue {
    async fn reference_price(&self) -> Result<Decimal, EngineError> {
        self.enter("reference_price", String::new()).await?;
        Ok(*self.reference.lock())
    }

    async fn expiries(&self) -> Result<Vec<NaiveDate>, EngineError> {
        self.enter("expiries", String::new()).await?;
        let mut dates: Vec<NaiveDate> = self.chain.lock().iter().map(|c| c.expiry).collect();
        dates.sort_unstable();
        dates.dedup();
        Ok(dates)
    }

    async fn options_chain(&self, expiry: NaiveDate) -> Result<Vec<OptionContract>, EngineError> {
        self.enter("options_chain", expiry.to_string()).await?;
        Ok(self
            .chain
            .lock()
            .iter()
            .filter(|c| c.expiry == expiry)
            .cloned()
            .collect())
    }

    async fn book(&self, symbol: &str, _depth: u32) -> Result<TopOfBook, EngineError> {
        self.enter("book", symbol.to_string()).await?;
        self.books
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| EngineError::api(0, "TIMEOUT", format!("no book for {symbol}")))
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderSnapshot, EngineError> {
        self.enter("place", format!("{} {} @{}", req.symbol, req.side, req.price))
            .await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let plan = self.plan_for(&req.symbol);

        let snapshot = match plan {
            FillPlan::Immediate(avg) => OrderSnapshot {
                order_id: id.clone(),
                status: OrderStatus::Filled,
                filled_qty: req.qty,
                avg_price: avg,
                original_qty: req.qty,
                price: req.price,
            },
            FillPlan::Partial(filled, avg) => OrderSnapshot {
                order_id: id.clone(),
                status: OrderStatus::PartiallyFilled,
                filled_qty: filled.min(req.qty),
                avg_price: avg,
                original_qty: req.qty,
                price: req.price,
            },
            FillPlan::Never | FillPlan::AfterPolls(..) => OrderSnapshot {
                order_id: id.clone(),
                status: OrderStatus::New,
                filled_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                original_qty: req.qty,
                price: req.price,
            },
        };

        self.orders.lock().insert(
            id,
            MockOrder {
                snapshot: snapshot.clone(),
                symbol: req.symbol.clone(),
                plan,
                polls: 0,
            },
        );
        Ok(snapshot)
    }

    async fn modify_order(
        &self,
        order_id: &str,
        symbol: &str,
        _qty: Decimal,
        price: Decimal,
    ) -> Result<OrderSnapshot, EngineError> {
        self.enter("modify", format!("{order_id} {symbol} @{price}"))
            .await?;

        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| EngineError::order("UNKNOWN_ORDER", "no such order"))?;
        if !order.snapshot.status.is_terminal() {
            order.snapshot.price = price;
        }
        Ok(order.snapshot.clone())
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderSnapshot, EngineError> {
        self.enter("cancel", format!("{order_id} {symbol}")).await?;

        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| EngineError::order("UNKNOWN_ORDER", "no such order"))?;
        if !order.snapshot.status.is_terminal() {
            order.snapshot.status = OrderStatus::Canceled;
        }
        Ok(order.snapshot.clone())
    }

    async fn get_order(&self, order_id: &str, symbol: &str) -> Result<OrderSnapshot, EngineError> {
        self.enter("get_order", format!("{order_id} {symbol}")).await?;

        let mut orders = self.orders.lock();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| EngineError::order("UNKNOWN_ORDER", "no such order"))?;
        order.polls += 1;

        if let FillPlan::AfterPolls(n, avg) = order.plan {
            if order.polls >= n && !order.snapshot.status.is_terminal() {
                order.snapshot.status = OrderStatus::Filled;
                order.snapshot.filled_qty = order.snapshot.original_qty;
                order.snapshot.avg_price = avg;
            }
        }
        debug_assert_eq!(order.symbol, symbol);
        Ok(order.snapshot.clone())
    }
}

// -----------------------------------------------------------------------------
// Recording alert sink
// -----------------------------------------------------------------------------

/// Captures every alert/notification for assertions.
#[derive(Default)]
pub struct RecordingAlerts {
    pub alerts: Mutex<Vec<String>>,
    pub notifications: Mutex<Vec<String>>,
}

impl RecordingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn alert_count_containing(&self, needle: &str) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.contains(needle))
            .count()
    }

    pub fn notify_count_containing(&self, needle: &str) -> usize {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.contains(needle))
            .count()
    }
}

impl AlertSink for RecordingAlerts {
    fn alert(&self, text: &str) {
        self.alerts.lock().push(text.to_string());
    }

    fn notify(&self, text: &str) {
        self.notifications.lock().push(text.to_string());
    }
}

// -----------------------------------------------------------------------------
// Chain helpers
// -----------------------------------------------------------------------------

/// A near-term expiry that is always in the future relative to the host
/// clock (the builder filters expiries against "today").
pub fn test_expiry() -> NaiveDate {
    chrono::Local::now().date_naive() + chrono::Duration::days(7)
}

pub fn option_symbol(strike: Decimal, kind: crate::types::OptionKind) -> String {
    let suffix = match kind {
        crate::types::OptionKind::Call => "C",
        crate::types::OptionKind::Put => "P",
    };
    format!("BTC-TEST-{strike}-{suffix}")
}

/// A call+put pair at every strike, tick 0.1.
pub fn chain_with_strikes(strikes: &[Decimal]) -> Vec<OptionContract> {
    use crate::types::OptionKind;
    strikes
        .iter()
        .flat_map(|&strike| {
            [OptionKind::Call, OptionKind::Put].map(|kind| OptionContract {
                symbol: option_symbol(strike, kind),
                kind,
                strike,
                expiry: test_expiry(),
                tick_size: Decimal::new(1, 1),
                book: None,
            })
        })
        .collect()
}
