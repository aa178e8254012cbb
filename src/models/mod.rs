use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single observed price at a point in time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

impl PriceSample {
    pub fn new(price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, price }
    }
}

/// Engine lifecycle state. Mirrors whether a position is open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Idle,
    InPosition,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "IDLE"),
            EngineState::InPosition => write!(f, "IN_POSITION"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::Manual => write!(f, "MANUAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Fill confirmation returned by a venue for a market order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Fill {
    /// Average fill price
    pub price: Decimal,
    /// Executed base quantity
    pub quantity: Decimal,
}

impl Fill {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Quote value of the fill (price * quantity)
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Completed round trip, written once when a position is closed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub id: Uuid,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

impl TradeRecord {
    /// Fractional return: (exit - entry) / entry
    pub fn pnl_pct(&self) -> Decimal {
        (self.exit_price - self.entry_price) / self.entry_price
    }

    /// Realized P&L in quote currency
    pub fn realized_pnl(&self) -> Decimal {
        (self.exit_price - self.entry_price) * self.quantity
    }

    pub fn is_win(&self) -> bool {
        self.exit_price > self.entry_price
    }
}
