// =============================================================================
// Position Monitor: 1 Hz mark-to-market refresh for every open leg
// =============================================================================
//
// Each tick fetches the top of book once per distinct symbol across all open
// positions, writes the marks into the position book and the shared price
// cache, and publishes a per-tick risk snapshot onto a channel. The risk
// engine consumes that channel; the monitor knows nothing about it and never
// mutates position status.
//
// A failed quote for one symbol is logged and skipped; the rest of the tick
// still runs.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error_limiter::ErrorCounter;
use crate::position::PositionBook;
use crate::resilience::ApiExecutor;
use crate::shutdown::ShutdownToken;
use crate::types::TopOfBook;
use crate::venue::SharedVenue;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const BOOK_DEPTH: u32 = 5;

// ---------------------------------------------------------------------------
// Price cache
// ---------------------------------------------------------------------------

/// Latest top of book per symbol, written by the monitor, read by the risk
/// engine and the closer.
pub struct PriceCache {
    books: RwLock<HashMap<String, TopOfBook>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, symbol: &str, book: TopOfBook) {
        self.books.write().insert(symbol.to_string(), book);
    }

    pub fn get(&self, symbol: &str) -> Option<TopOfBook> {
        self.books.read().get(symbol).copied()
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Risk snapshot
// ---------------------------------------------------------------------------

/// Per-position numbers the risk engine evaluates, computed from one tick's
/// marks. Never stored beyond the tick.
#[derive(Debug, Clone)]
pub struct PositionRisk {
    pub position_id: String,
    pub pnl: Decimal,
    pub net_premium: Decimal,
    pub max_loss: Decimal,
}

/// One tick's portfolio snapshot.
#[derive(Debug, Clone)]
pub struct RiskTick {
    pub positions: Vec<PositionRisk>,
    pub total_max_loss: Decimal,
    pub total_mtm: Decimal,
    pub open_count: usize,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct PositionMonitor {
    venue: SharedVenue,
    executor: ApiExecutor,
    book: Arc<PositionBook>,
    cache: Arc<PriceCache>,
    tick_tx: mpsc::Sender<RiskTick>,
    limiter: Arc<ErrorCounter>,
    shutdown: ShutdownToken,
}

impl PositionMonitor {
    pub fn new(
        venue: SharedVenue,
        executor: ApiExecutor,
        book: Arc<PositionBook>,
        cache: Arc<PriceCache>,
        tick_tx: mpsc::Sender<RiskTick>,
        limiter: Arc<ErrorCounter>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            venue,
            executor,
            book,
            cache,
            tick_tx,
            limiter,
            shutdown,
        }
    }

    /// Tick loop. Exits when the shutdown token fires.
    pub async fn run(&self) {
        info!(interval_secs = TICK_INTERVAL.as_secs(), "position monitor started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.triggered() => break,
            }
            if self.shutdown.is_triggered() {
                break;
            }
            self.run_tick().await;
        }
        info!("position monitor stopped");
    }

    /// One refresh pass. Public so a single tick is drivable in isolation.
    pub async fn run_tick(&self) -> RiskTick {
        let open = self.book.open_positions();

        // Coalesce: one venue call per distinct symbol per tick.
        let mut symbols: Vec<String> = open
            .iter()
            .flat_map(|p| p.legs().map(|l| l.symbol.clone()))
            .collect();
        symbols.sort_unstable();
        symbols.dedup();

        for symbol in &symbols {
            match self
                .executor
                .exec("get_book", || self.venue.book(symbol, BOOK_DEPTH))
                .await
            {
                Ok(quote) => {
                    self.cache.update(symbol, quote);
                    self.book.apply_book(symbol, &quote);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "price refresh failed, skipping symbol");
                    self.limiter.record(&e.code(), "monitor_tick");
                }
            }
        }

        // Snapshot after marking; evaluation order is registration order.
        let marked = self.book.open_positions();
        let positions: Vec<PositionRisk> = marked
            .iter()
            .map(|p| PositionRisk {
                position_id: p.id.clone(),
                pnl: p.unrealized_pnl(),
                net_premium: p.net_premium(),
                max_loss: p.max_loss,
            })
            .collect();

        let tick = RiskTick {
            total_max_loss: positions.iter().map(|p| p.max_loss).sum(),
            total_mtm: positions.iter().map(|p| p.pnl).sum(),
            open_count: positions.len(),
            positions,
        };

        if let Err(e) = self.tick_tx.try_send(tick.clone()) {
            debug!(error = %e, "risk tick dropped (consumer busy)");
        }
        tick
    }
}
