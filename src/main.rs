// =============================================================================
// Ironfly - Iron-Butterfly Options Engine - Main Entry Point
// =============================================================================
//
// One process runs one intraday session against a single BTC-options
// account: the cycle scheduler opens iron butterflies, the monitor marks
// them at 1 Hz, the risk engine enforces per-position and portfolio
// thresholds, and the shutdown coordinator guarantees no position is left
// behind on the way out.
//
// Positions are NOT persisted across restarts. A crash leaves any open
// butterflies on the venue for manual cleanup; operators are alerted on
// every position event so the book can be reconstructed from the chat log.
//
// Exit codes: 0 after a clean session, 1 on fatal configuration errors,
// portfolio stop-loss, or any emergency shutdown.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod builder;
mod chain;
mod closer;
mod config;
mod error;
mod error_limiter;
mod events;
mod fill;
mod monitor;
mod position;
mod resilience;
mod risk_engine;
mod scheduler;
mod session;
mod shutdown;
#[cfg(test)]
mod testkit;
mod types;
mod venue;

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::build_sink;
use crate::builder::ButterflyBuilder;
use crate::closer::Closer;
use crate::config::Config;
use crate::error_limiter::ErrorCounter;
use crate::events::{emit, EngineEvent};
use crate::fill::FillDriver;
use crate::monitor::{PositionMonitor, PriceCache};
use crate::position::PositionBook;
use crate::resilience::{ApiExecutor, BreakerConfig, CircuitBreaker};
use crate::risk_engine::{RiskEngine, RiskLatch};
use crate::scheduler::CycleScheduler;
use crate::session::{SessionController, SessionStateCell};
use crate::shutdown::{ShutdownCoordinator, ShutdownToken};
use crate::venue::{BinanceOptionsClient, HmacSha256Signer, SharedVenue};

const DEFAULT_CONFIG_PATH: &str = "ironfly_config.json";

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Ironfly engine starting");

    // ── 1. Configuration (fatal on any violation) ────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let mut config = Config::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "config file not loaded, using defaults");
        Config::default()
    });
    config.apply_env_overrides();

    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid, refusing to start");
        emit(EngineEvent::UncaughtException, &[("error", e.to_string())]);
        return ExitCode::from(1);
    }
    let window = config
        .session_window()
        .expect("validated config has a parseable window");

    emit(
        EngineEvent::ApplicationStarted,
        &[
            ("version", env!("CARGO_PKG_VERSION").to_string()),
            ("session_start", config.session_start.clone()),
            ("session_end", config.session_end.clone()),
            ("cycles", config.number_of_cycles.to_string()),
            ("underlying", config.underlying.clone()),
        ],
    );

    // ── 2. Build components in dependency order ──────────────────────────
    let token = ShutdownToken::new();
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let executor = ApiExecutor::new(breaker);
    let limiter = Arc::new(ErrorCounter::new());

    let signer = Box::new(HmacSha256Signer::new(&config.api_secret));
    let venue: SharedVenue = Arc::new(BinanceOptionsClient::new(
        &config.venue_base_url,
        &config.underlying,
        &config.api_key,
        signer,
    ));

    let alerts = build_sink(
        config.telegram_bot_token.as_deref(),
        config.telegram_chat_id.as_deref(),
    );

    let book = Arc::new(PositionBook::new());
    let cache = Arc::new(PriceCache::new());

    let fill = Arc::new(FillDriver::new(
        venue.clone(),
        executor.clone(),
        alerts.clone(),
        limiter.clone(),
        token.clone(),
        config.order_timeout(),
        config.order_update_interval(),
    ));

    let closer = Arc::new(Closer::new(
        venue.clone(),
        executor.clone(),
        fill.clone(),
        book.clone(),
        cache.clone(),
        alerts.clone(),
    ));

    let coordinator = Arc::new(ShutdownCoordinator::new(
        token.clone(),
        closer.clone(),
        book.clone(),
        alerts.clone(),
    ));

    let (tick_tx, tick_rx) = mpsc::channel(8);
    let monitor = Arc::new(PositionMonitor::new(
        venue.clone(),
        executor.clone(),
        book.clone(),
        cache.clone(),
        tick_tx,
        limiter.clone(),
        token.clone(),
    ));

    let latch: RiskLatch = Arc::new(AtomicBool::new(false));
    let risk = Arc::new(RiskEngine::new(
        closer.clone(),
        alerts.clone(),
        executor.clone(),
        latch.clone(),
        coordinator.clone(),
        token.clone(),
        config.stop_loss_pct,
        config.profit_target_pct,
        config.portfolio_risk_pct,
    ));

    let builder = Arc::new(ButterflyBuilder::new(
        venue,
        executor,
        fill,
        book,
        alerts.clone(),
        config.position_quantity,
        config.strike_distance,
    ));

    let state = Arc::new(SessionStateCell::new());
    let scheduler = Arc::new(CycleScheduler::new(
        builder,
        config.cycle_interval(),
        config.number_of_cycles,
        state.clone(),
        latch,
        token.clone(),
        alerts.clone(),
    ));

    let controller = SessionController::new(
        state,
        window,
        alerts,
        coordinator.clone(),
        token,
        monitor,
        risk,
        scheduler,
        tick_rx,
    );

    // ── 3. Operator interrupt ────────────────────────────────────────────
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, shutting down gracefully");
                coordinator.graceful("operator interrupt").await;
            }
        });
    }

    // ── 4. Run the session to completion ────────────────────────────────
    controller.run().await;

    let code = coordinator.exit_code();
    info!(exit_code = code, "Ironfly engine stopped");
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}
