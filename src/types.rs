// =============================================================================
// Shared types used across the Ironfly engine
// =============================================================================

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of the option chain a contract belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionKind {
    Call,
    Put,
}

impl std::fmt::Display for OptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CALL"),
            Self::Put => write!(f, "PUT"),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that flattens an exposure opened on `self`.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Venue-reported order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderStatus {
    pub fn from_venue(raw: &str) -> Self {
        match raw {
            "NEW" | "ACCEPTED" | "PENDING" => Self::New,
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "FILLED" => Self::Filled,
            "CANCELED" | "CANCELLED" => Self::Canceled,
            "REJECTED" => Self::Rejected,
            "EXPIRED" => Self::Expired,
            _ => Self::Unknown,
        }
    }

    /// Terminal states accept no further fills or modifications.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Best bid/ask with sizes for a single symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TopOfBook {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
}

/// Passive snapshot of one listed option. Fetched on demand, never retained.
#[derive(Debug, Clone)]
pub struct OptionContract {
    pub symbol: String,
    pub kind: OptionKind,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    /// Minimum price increment for limit orders on this contract.
    pub tick_size: Decimal,
    pub book: Option<TopOfBook>,
}

/// A limit order the engine wants driven to fill.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub tick_size: Decimal,
}

/// The venue's view of one order, shared by place/modify/cancel/query.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    /// Venue-reported average fill price. Zero until the first fill.
    pub avg_price: Decimal,
    pub original_qty: Decimal,
    pub price: Decimal,
}

impl OrderSnapshot {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn remaining_qty(&self) -> Decimal {
        (self.original_qty - self.filled_qty).max(Decimal::ZERO)
    }
}

/// Lifecycle of the trading session. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Waiting,
    Active,
    Ended,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "WAITING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Ended => write!(f, "ENDED"),
        }
    }
}

/// Terminal disposition of an iron butterfly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    ClosedProfit,
    ClosedLoss,
    ClosedRisk,
}

impl PositionStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Open
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::ClosedProfit => write!(f, "CLOSED_PROFIT"),
            Self::ClosedLoss => write!(f, "CLOSED_LOSS"),
            Self::ClosedRisk => write!(f, "CLOSED_RISK"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn venue_status_mapping() {
        assert_eq!(OrderStatus::from_venue("FILLED"), OrderStatus::Filled);
        assert_eq!(OrderStatus::from_venue("ACCEPTED"), OrderStatus::New);
        assert_eq!(OrderStatus::from_venue("CANCELLED"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::from_venue("whatever"), OrderStatus::Unknown);
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn snapshot_remaining_qty_never_negative() {
        let snap = OrderSnapshot {
            order_id: "1".into(),
            status: OrderStatus::Filled,
            filled_qty: dec!(0.3),
            avg_price: dec!(120.5),
            original_qty: dec!(0.2),
            price: dec!(120),
        };
        assert_eq!(snap.remaining_qty(), Decimal::ZERO);
    }

    #[test]
    fn position_status_terminality() {
        assert!(!PositionStatus::Open.is_terminal());
        assert!(PositionStatus::ClosedProfit.is_terminal());
        assert!(PositionStatus::ClosedLoss.is_terminal());
        assert!(PositionStatus::ClosedRisk.is_terminal());
    }
}
