// =============================================================================
// Repeat-error rate limiter for operator alerts
// =============================================================================
//
// Recoverable errors stay local: logged, counted here, and only lifted to a
// single operator alert once the same (error code, context) pair repeats
// `ALERT_THRESHOLD` times inside the cooldown window. Rate-limit chatter is
// paced separately at one alert per two cooldown windows.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

const ALERT_THRESHOLD: u32 = 3;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

struct Entry {
    count: u32,
    window_start: Instant,
    last_alert: Option<Instant>,
}

/// Counts repeated errors per (code, context) key and decides when a repeat
/// deserves exactly one operator alert.
pub struct ErrorCounter {
    cooldown: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ErrorCounter {
    pub fn new() -> Self {
        Self::with_cooldown(DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one occurrence. Returns `true` when the caller should raise an
    /// operator alert for this repeat cluster.
    pub fn record(&self, code: &str, context: &str) -> bool {
        self.record_at(code, context, Instant::now())
    }

    fn record_at(&self, code: &str, context: &str, now: Instant) -> bool {
        let key = format!("{code}|{context}");
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert(Entry {
            count: 0,
            window_start: now,
            last_alert: None,
        });

        // Stale window: start counting afresh.
        if now.duration_since(entry.window_start) > self.cooldown {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        let paced_out = entry
            .last_alert
            .map(|t| now.duration_since(t) < self.cooldown)
            .unwrap_or(false);

        if entry.count >= ALERT_THRESHOLD && !paced_out {
            entry.last_alert = Some(now);
            entry.count = 0;
            entry.window_start = now;
            true
        } else {
            debug!(code, context, count = entry.count, "error counted below alert threshold");
            false
        }
    }

    /// Rate-limit alerts are paced on their own: at most one per 2x cooldown
    /// regardless of how often the venue returns 429.
    pub fn allow_rate_limit_alert(&self, context: &str) -> bool {
        self.allow_rate_limit_alert_at(context, Instant::now())
    }

    fn allow_rate_limit_alert_at(&self, context: &str, now: Instant) -> bool {
        let key = format!("RATE_LIMIT_PACER|{context}");
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert(Entry {
            count: 0,
            window_start: now,
            last_alert: None,
        });

        let allowed = entry
            .last_alert
            .map(|t| now.duration_since(t) >= self.cooldown * 2)
            .unwrap_or(true);
        if allowed {
            entry.last_alert = Some(now);
        }
        allowed
    }

    /// Drop all accumulated state.
    pub fn reset(&self) {
        self.entries.lock().clear();
    }
}

impl Default for ErrorCounter {
    fn default() -> Self {
        Self::new()
    }
}
