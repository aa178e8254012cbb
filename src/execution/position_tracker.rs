use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrackerError;
use crate::models::{ExitReason, TradeRecord};
use crate::strategy::StrategyConfig;

/// The single open long position
///
/// Exit thresholds are fixed at open time and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_time: DateTime<Utc>,
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
}

impl Position {
    /// Unrealized P&L in quote currency
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        (current_price - self.entry_price) * self.quantity
    }

    pub fn market_value(&self, current_price: Decimal) -> Decimal {
        current_price * self.quantity
    }

    pub fn cost_basis(&self) -> Decimal {
        self.entry_price * self.quantity
    }
}

/// Owns the open position (at most one) and the closed trade history
#[derive(Debug, Default)]
pub struct PositionTracker {
    position: Option<Position>,
    history: Vec<TradeRecord>,
    total_pnl: Decimal,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a position, computing exit thresholds from the config in force right now
    pub fn open(
        &mut self,
        entry_price: Decimal,
        quantity: Decimal,
        entry_time: DateTime<Utc>,
        config: &StrategyConfig,
    ) -> Result<&Position, TrackerError> {
        if self.position.is_some() {
            return Err(TrackerError::AlreadyOpen);
        }

        let overflow = || TrackerError::ThresholdOverflow(entry_price);
        let position = Position {
            id: Uuid::new_v4(),
            entry_price,
            quantity,
            entry_time,
            take_profit_price: config.take_profit_price(entry_price).ok_or_else(overflow)?,
            stop_loss_price: config.stop_loss_price(entry_price).ok_or_else(overflow)?,
        };

        tracing::debug!(
            id = %position.id,
            entry = %entry_price,
            qty = %quantity,
            tp = %position.take_profit_price,
            sl = %position.stop_loss_price,
            "Position opened"
        );

        let position = self.position.insert(position);
        Ok(&*position)
    }

    /// Close the open position and append the resulting trade to history
    pub fn close(
        &mut self,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<TradeRecord, TrackerError> {
        let position = self.position.take().ok_or(TrackerError::NoOpenPosition)?;

        let record = TradeRecord {
            id: position.id,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            entry_time: position.entry_time,
            exit_time,
            exit_reason: reason,
        };

        self.total_pnl += record.realized_pnl();
        self.history.push(record.clone());

        Ok(record)
    }

    /// Fractional P&L of the open position at `current_price`
    pub fn current_pnl_pct(&self, current_price: Decimal) -> Result<Decimal, TrackerError> {
        let position = self.position.as_ref().ok_or(TrackerError::NoOpenPosition)?;
        Ok((current_price - position.entry_price) / position.entry_price)
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.position.is_some()
    }

    /// Closed trades, oldest first
    pub fn history(&self) -> &[TradeRecord] {
        &self.history
    }

    /// The `n` most recent closed trades, oldest first
    pub fn recent_trades(&self, n: usize) -> &[TradeRecord] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// Realized P&L across all closed trades
    pub fn total_pnl(&self) -> Decimal {
        self.total_pnl
    }
}
