// =============================================================================
// Operator alert sink
// =============================================================================
//
// Alerts are short human-readable lines tagged CYCLE / POSITION / RISK /
// ORDER / SHUTDOWN. Delivery is fire-and-forget: a sink failure is logged
// locally and never propagates into the engine.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

/// Outbound operator channel. `alert` is for conditions needing attention,
/// `notify` for routine session milestones.
pub trait AlertSink: Send + Sync {
    fn alert(&self, text: &str);
    fn notify(&self, text: &str);
}

pub type SharedAlerts = Arc<dyn AlertSink>;

// -----------------------------------------------------------------------------
// Telegram
// -----------------------------------------------------------------------------

/// Sends alerts to a Telegram chat. The secret token is never logged.
pub struct TelegramAlerts {
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramAlerts {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            token: token.into(),
            chat_id: chat_id.into(),
            client,
        }
    }

    fn send(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let body = json!({ "chat_id": self.chat_id, "text": text });
        let client = self.client.clone();
        let preview: String = text.chars().take(48).collect();

        // Detached task: the caller never waits on the sink.
        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(preview = %preview, "telegram message delivered");
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), "telegram rejected message");
                }
                Err(e) => {
                    warn!(error = %e, "telegram delivery failed");
                }
            }
        });
    }
}

impl AlertSink for TelegramAlerts {
    fn alert(&self, text: &str) {
        warn!(alert = %text, "operator alert");
        self.send(text);
    }

    fn notify(&self, text: &str) {
        info!(notify = %text, "operator notification");
        self.send(text);
    }
}

impl std::fmt::Debug for TelegramAlerts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramAlerts")
            .field("token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Log-only fallback
// -----------------------------------------------------------------------------

/// Used when no alert credentials are configured: everything lands in the
/// structured log instead.
#[derive(Debug, Default)]
pub struct LogAlerts;

impl AlertSink for LogAlerts {
    fn alert(&self, text: &str) {
        warn!(alert = %text, "operator alert (log only)");
    }

    fn notify(&self, text: &str) {
        info!(notify = %text, "operator notification (log only)");
    }
}

/// Build the configured sink: Telegram when both credentials are present,
/// log-only otherwise.
pub fn build_sink(token: Option<&str>, chat_id: Option<&str>) -> SharedAlerts {
    match (token, chat_id) {
        (Some(t), Some(c)) => Arc::new(TelegramAlerts::new(t, c)),
        _ => Arc::new(LogAlerts),
    }
}
