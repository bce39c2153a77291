// =============================================================================
// Structured engine events
// =============================================================================
//
// A finite taxonomy emitted through `tracing` so every lifecycle transition
// is visible in one place with key/value context. Emission never fails and
// never blocks.
// =============================================================================

use tracing::{info, warn};

/// Everything the engine reports to the structured log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    ApplicationStarted,
    SessionStarted,
    CycleCompleted,
    OrderPlaced,
    OrderFilled,
    OrderModified,
    OrderTimeout,
    PositionCreated,
    PositionClosed,
    RiskEvent,
    UncaughtException,
    GracefulShutdownStarted,
    GracefulShutdownCompleted,
    EmergencyShutdown,
}

impl EngineEvent {
    pub fn name(self) -> &'static str {
        match self {
            Self::ApplicationStarted => "APPLICATION_STARTED",
            Self::SessionStarted => "SESSION_STARTED",
            Self::CycleCompleted => "CYCLE_COMPLETED",
            Self::OrderPlaced => "ORDER_PLACED",
            Self::OrderFilled => "ORDER_FILLED",
            Self::OrderModified => "ORDER_MODIFIED",
            Self::OrderTimeout => "ORDER_TIMEOUT",
            Self::PositionCreated => "POSITION_CREATED",
            Self::PositionClosed => "POSITION_CLOSED",
            Self::RiskEvent => "RISK_EVENT",
            Self::UncaughtException => "UNCAUGHT_EXCEPTION",
            Self::GracefulShutdownStarted => "GRACEFUL_SHUTDOWN_STARTED",
            Self::GracefulShutdownCompleted => "GRACEFUL_SHUTDOWN_COMPLETED",
            Self::EmergencyShutdown => "EMERGENCY_SHUTDOWN",
        }
    }

    fn is_warning(self) -> bool {
        matches!(
            self,
            Self::OrderTimeout
                | Self::RiskEvent
                | Self::UncaughtException
                | Self::EmergencyShutdown
        )
    }
}

/// Emit one event with free-form key/value context.
pub fn emit(event: EngineEvent, context: &[(&str, String)]) {
    let ctx = context
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");

    if event.is_warning() {
        warn!(event = event.name(), context = %ctx, "engine event");
    } else {
        info!(event = event.name(), context = %ctx, "engine event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_names_are_stable() {
        assert_eq!(EngineEvent::ApplicationStarted.name(), "APPLICATION_STARTED");
        assert_eq!(EngineEvent::OrderTimeout.name(), "ORDER_TIMEOUT");
        assert_eq!(
            EngineEvent::GracefulShutdownCompleted.name(),
            "GRACEFUL_SHUTDOWN_COMPLETED"
        );
    }

    #[test]
    fn emit_accepts_empty_context() {
        emit(EngineEvent::CycleCompleted, &[]);
        emit(EngineEvent::RiskEvent, &[("reason", "test".to_string())]);
    }
}
