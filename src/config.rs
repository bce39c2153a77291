// =============================================================================
// Engine Configuration
// =============================================================================
//
// Loaded once at boot from a JSON file, with API and alert credentials
// overridable from the environment. Every field carries a serde default so
// older config files keep loading after new fields are added.
//
// `validate()` enforces the boot contract: any violation is fatal and the
// process refuses to start. There is no hot reload, the session parameters
// are fixed for the lifetime of the process.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;

const MIN_CREDENTIAL_LEN: usize = 10;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_session_start() -> String {
    "09:30".to_string()
}

fn default_session_end() -> String {
    "15:30".to_string()
}

fn default_cycle_interval_minutes() -> u64 {
    30
}

fn default_number_of_cycles() -> u32 {
    3
}

fn default_position_quantity() -> Decimal {
    dec!(0.1)
}

fn default_strike_distance() -> u32 {
    2
}

fn default_stop_loss_pct() -> Decimal {
    dec!(30)
}

fn default_profit_target_pct() -> Decimal {
    dec!(50)
}

fn default_portfolio_risk_pct() -> Decimal {
    dec!(10)
}

fn default_order_timeout_seconds() -> u64 {
    60
}

fn default_order_update_interval_seconds() -> u64 {
    1
}

fn default_venue_base_url() -> String {
    "https://eapi.binance.com".to_string()
}

fn default_underlying() -> String {
    "BTCUSDT".to_string()
}

// =============================================================================
// Config
// =============================================================================

/// Complete boot configuration for one session run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- Session window (local wall clock, half-open [start, end)) ----------
    #[serde(default = "default_session_start")]
    pub session_start: String,

    #[serde(default = "default_session_end")]
    pub session_end: String,

    // --- Cycle cadence -------------------------------------------------------
    #[serde(default = "default_cycle_interval_minutes")]
    pub cycle_interval_minutes: u64,

    #[serde(default = "default_number_of_cycles")]
    pub number_of_cycles: u32,

    // --- Butterfly geometry --------------------------------------------------
    /// Declared quantity for all four legs of every butterfly.
    #[serde(default = "default_position_quantity")]
    pub position_quantity: Decimal,

    /// Wing distance from the ATM strike, in strike-grid steps.
    #[serde(default = "default_strike_distance")]
    pub strike_distance: u32,

    // --- Risk thresholds (percent of net premium / aggregate max loss) ------
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,

    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: Decimal,

    #[serde(default = "default_portfolio_risk_pct")]
    pub portfolio_risk_pct: Decimal,

    // --- Order driving -------------------------------------------------------
    #[serde(default = "default_order_timeout_seconds")]
    pub order_timeout_seconds: u64,

    #[serde(default = "default_order_update_interval_seconds")]
    pub order_update_interval_seconds: u64,

    // --- Venue ---------------------------------------------------------------
    #[serde(default = "default_venue_base_url")]
    pub venue_base_url: String,

    /// Underlying whose reference price anchors the ATM strike.
    #[serde(default = "default_underlying")]
    pub underlying: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub api_secret: String,

    // --- Alerts (both set or both absent) ------------------------------------
    #[serde(default)]
    pub telegram_bot_token: Option<String>,

    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_start: default_session_start(),
            session_end: default_session_end(),
            cycle_interval_minutes: default_cycle_interval_minutes(),
            number_of_cycles: default_number_of_cycles(),
            position_quantity: default_position_quantity(),
            strike_distance: default_strike_distance(),
            stop_loss_pct: default_stop_loss_pct(),
            profit_target_pct: default_profit_target_pct(),
            portfolio_risk_pct: default_portfolio_risk_pct(),
            order_timeout_seconds: default_order_timeout_seconds(),
            order_update_interval_seconds: default_order_update_interval_seconds(),
            venue_base_url: default_venue_base_url(),
            underlying: default_underlying(),
            api_key: String::new(),
            api_secret: String::new(),
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            session = %format!("{}-{}", config.session_start, config.session_end),
            cycles = config.number_of_cycles,
            "config loaded"
        );

        Ok(config)
    }

    /// Overlay credentials from the environment. Environment always wins so
    /// that secrets never have to live in the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("IRONFLY_API_KEY") {
            self.api_key = key;
        }
        if let Ok(secret) = std::env::var("IRONFLY_API_SECRET") {
            self.api_secret = secret;
        }
        if let Ok(token) = std::env::var("IRONFLY_TELEGRAM_TOKEN") {
            self.telegram_bot_token = Some(token);
        }
        if let Ok(chat) = std::env::var("IRONFLY_TELEGRAM_CHAT_ID") {
            self.telegram_chat_id = Some(chat);
        }
    }

    /// Parse the `[start, end)` session window.
    pub fn session_window(&self) -> Result<(NaiveTime, NaiveTime), EngineError> {
        let start = parse_local_time("session_start", &self.session_start)?;
        let end = parse_local_time("session_end", &self.session_end)?;
        Ok((start, end))
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_minutes * 60)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_seconds)
    }

    pub fn order_update_interval(&self) -> Duration {
        Duration::from_secs(self.order_update_interval_seconds)
    }

    /// Enforce the boot contract. The first violation is returned, the
    /// process must refuse to start on any error.
    pub fn validate(&self) -> Result<(), EngineError> {
        let (start, end) = self.session_window()?;
        if start >= end {
            return Err(EngineError::config(
                "session_end",
                "session window is empty: end must be after start",
            ));
        }

        if self.cycle_interval_minutes == 0 {
            return Err(EngineError::config(
                "cycle_interval_minutes",
                "must be a positive integer",
            ));
        }
        if self.number_of_cycles == 0 {
            return Err(EngineError::config(
                "number_of_cycles",
                "must be a positive integer",
            ));
        }
        if self.position_quantity <= Decimal::ZERO {
            return Err(EngineError::config(
                "position_quantity",
                "must be strictly positive",
            ));
        }
        if self.strike_distance == 0 {
            return Err(EngineError::config(
                "strike_distance",
                "must be a positive integer",
            ));
        }
        if self.stop_loss_pct < Decimal::ZERO || self.stop_loss_pct >= dec!(100) {
            return Err(EngineError::config(
                "stop_loss_pct",
                "must satisfy 0 <= x < 100",
            ));
        }
        if self.profit_target_pct <= Decimal::ZERO {
            return Err(EngineError::config(
                "profit_target_pct",
                "must be strictly positive",
            ));
        }
        if self.portfolio_risk_pct < Decimal::ZERO || self.portfolio_risk_pct >= dec!(100) {
            return Err(EngineError::config(
                "portfolio_risk_pct",
                "must satisfy 0 <= x < 100",
            ));
        }
        if self.order_timeout_seconds == 0 {
            return Err(EngineError::config(
                "order_timeout_seconds",
                "must be a positive integer",
            ));
        }
        if self.order_update_interval_seconds == 0 {
            return Err(EngineError::config(
                "order_update_interval_seconds",
                "must be a positive integer",
            ));
        }
        if self.api_key.len() < MIN_CREDENTIAL_LEN {
            return Err(EngineError::config(
                "api_key",
                "missing or shorter than 10 characters",
            ));
        }
        if self.api_secret.len() < MIN_CREDENTIAL_LEN {
            return Err(EngineError::config(
                "api_secret",
                "missing or shorter than 10 characters",
            ));
        }
        if self.telegram_bot_token.is_some() != self.telegram_chat_id.is_some() {
            return Err(EngineError::config(
                "telegram_chat_id",
                "telegram_bot_token and telegram_chat_id must be set together",
            ));
        }

        Ok(())
    }
}

fn parse_local_time(key: &str, raw: &str) -> Result<NaiveTime, EngineError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| EngineError::config(key, format!("`{raw}` is not a valid HH:MM time")))
}
