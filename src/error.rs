// =============================================================================
// Error taxonomy for the Ironfly engine
// =============================================================================
//
// A single closed sum type covers every fault the engine can surface. Each
// worker root matches on the variant and routes it through the propagation
// policy: recoverable errors stay local (WARN + repeat-error limiter),
// non-recoverable errors raise an operator alert and, when risk-classed,
// request emergency shutdown.
// =============================================================================

use rust_decimal::Decimal;
use thiserror::Error;

/// Stable error code reported when the circuit breaker rejects a call.
pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";

/// Which risk limit was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskKind {
    PortfolioStopLoss,
    PositionStopLoss,
}

impl std::fmt::Display for RiskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PortfolioStopLoss => write!(f, "PORTFOLIO_STOP_LOSS"),
            Self::PositionStopLoss => write!(f, "POSITION_STOP_LOSS"),
        }
    }
}

/// Every error the engine produces or propagates.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A venue fault, transient or permanent. `status` is the HTTP status
    /// (0 when the request never reached the venue), `code` the venue error
    /// code when one was returned.
    #[error("venue error (HTTP {status}) {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Fail-fast rejection while the circuit breaker is open.
    #[error("circuit breaker is open: {0}")]
    CircuitOpen(String),

    /// Invalid configuration. Always fatal at boot.
    #[error("invalid configuration `{key}`: {message}")]
    Config { key: String, message: String },

    /// A risk limit was breached.
    #[error("risk violation {kind}: current {current}, threshold {threshold}")]
    Risk {
        kind: RiskKind,
        current: Decimal,
        threshold: Decimal,
    },

    /// An order could not be placed, modified, or cancelled.
    #[error("order execution failed ({code}): {message}")]
    OrderExecution { code: String, message: String },

    /// Anything that does not fit the variants above.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn api(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn order(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OrderExecution {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Map a transport-level failure into the API variant. Status 0 marks
    /// errors where no HTTP response was received (connect timeout, DNS).
    pub fn transport(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
        let code = if err.is_timeout() {
            "TIMEOUT"
        } else if err.is_connect() {
            "CONNECT_FAILED"
        } else {
            "TRANSPORT_ERROR"
        };
        Self::Api {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }

    /// Stable machine-readable code for counting and alert deduplication.
    pub fn code(&self) -> String {
        match self {
            Self::Api { code, status, .. } if code.is_empty() => format!("HTTP_{status}"),
            Self::Api { code, .. } => code.clone(),
            Self::CircuitOpen(_) => CIRCUIT_BREAKER_OPEN.to_string(),
            Self::Config { key, .. } => format!("CONFIG_{}", key.to_uppercase()),
            Self::Risk { kind, .. } => kind.to_string(),
            Self::OrderExecution { code, .. } => code.clone(),
            Self::Other(_) => "GENERAL".to_string(),
        }
    }

    /// HTTP 429 or a venue code containing `RATE_LIMIT`.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::Api { status, code, .. } => *status == 429 || code.contains("RATE_LIMIT"),
            _ => false,
        }
    }

    /// HTTP 401/403 or a signature/key venue code. Never recoverable.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Api { status, code, .. } => {
                matches!(status, 401 | 403)
                    || code.contains("INVALID_SIGNATURE")
                    || code.contains("INVALID_API_KEY")
            }
            _ => false,
        }
    }

    /// Classification used by every worker root.
    ///
    /// API errors: rate-limit is recoverable, auth is not, any other >= 400
    /// is not, everything else (timeouts, transport) defaults to recoverable.
    /// Order-execution errors are recoverable except INSUFFICIENT_BALANCE.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Api { status, .. } => {
                if self.is_rate_limit() {
                    true
                } else if self.is_auth() {
                    false
                } else {
                    *status < 400
                }
            }
            Self::CircuitOpen(_) => true,
            Self::Config { .. } => false,
            Self::Risk { .. } => false,
            Self::OrderExecution { code, .. } => code != "INSUFFICIENT_BALANCE",
            Self::Other(_) => true,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_recoverable_and_flagged() {
        let err = EngineError::api(429, "RATE_LIMIT_EXCEEDED", "too many requests");
        assert!(err.is_rate_limit());
        assert!(err.is_recoverable());
        assert!(!err.is_auth());
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn rate_limit_code_without_429_status_still_counts() {
        let err = EngineError::api(418, "RATE_LIMIT_BANNED", "ip banned");
        assert!(err.is_rate_limit());
        assert!(err.is_recoverable());
    }

    #[test]
    fn auth_errors_are_not_recoverable() {
        assert!(!EngineError::api(401, "INVALID_API_KEY", "bad key").is_recoverable());
        assert!(!EngineError::api(403, "", "forbidden").is_recoverable());
        assert!(EngineError::api(200, "INVALID_SIGNATURE", "sig").is_auth());
    }

    #[test]
    fn client_errors_are_not_recoverable() {
        let err = EngineError::api(400, "BAD_SYMBOL", "unknown symbol");
        assert!(!err.is_recoverable());
        assert!(!err.is_rate_limit());
    }

    #[test]
    fn transport_errors_default_to_recoverable() {
        let err = EngineError::api(0, "TIMEOUT", "read timed out");
        assert!(err.is_recoverable());
    }

    #[test]
    fn insufficient_balance_is_terminal() {
        assert!(!EngineError::order("INSUFFICIENT_BALANCE", "no funds").is_recoverable());
        assert!(EngineError::order("UNKNOWN_ORDER", "gone").is_recoverable());
    }

    #[test]
    fn config_and_risk_are_never_recoverable() {
        assert!(!EngineError::config("stop_loss_pct", "out of range").is_recoverable());
        let risk = EngineError::Risk {
            kind: RiskKind::PortfolioStopLoss,
            current: Decimal::new(-160, 0),
            threshold: Decimal::new(-150, 0),
        };
        assert!(!risk.is_recoverable());
        assert_eq!(risk.code(), "PORTFOLIO_STOP_LOSS");
    }

    #[test]
    fn circuit_open_carries_stable_code() {
        let err = EngineError::CircuitOpen("retry in 90s".into());
        assert_eq!(err.code(), CIRCUIT_BREAKER_OPEN);
    }

    #[test]
    fn empty_api_code_falls_back_to_status() {
        let err = EngineError::api(503, "", "service unavailable");
        assert_eq!(err.code(), "HTTP_503");
    }
}
