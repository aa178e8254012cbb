use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::ExitReason;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Started,
    Stopped,
    Entry {
        price: Decimal,
        quantity: Decimal,
    },
    EntryFailed {
        error: String,
    },
    EntrySkipped {
        reason: String,
    },
    Exit {
        reason: ExitReason,
        price: Decimal,
        pnl_pct: Decimal,
    },
    ExitFailed {
        reason: ExitReason,
        error: String,
    },
    SampleRejected {
        error: String,
    },
    ConfigUpdated,
    ConfigRejected {
        error: String,
    },
    BalanceRefreshed {
        balance: Decimal,
    },
    BalanceRefreshFailed {
        error: String,
    },
}

impl EventKind {
    /// Entry or exit that actually filled
    pub fn is_trade(&self) -> bool {
        matches!(self, EventKind::Entry { .. } | EventKind::Exit { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::EntryFailed { .. }
                | EventKind::ExitFailed { .. }
                | EventKind::SampleRejected { .. }
                | EventKind::ConfigRejected { .. }
                | EventKind::BalanceRefreshFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Append-only record of engine decisions
///
/// Observability only; the position tracker is the source of truth for trading state.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and mirror it to the tracing output
    pub fn append(&mut self, timestamp: DateTime<Utc>, kind: EventKind) -> &Event {
        trace_event(&kind);

        let seq = self.events.len() as u64;
        self.events.push(Event {
            seq,
            timestamp,
            kind,
        });
        &self.events[self.events.len() - 1]
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The last `n` events, oldest first
    pub fn tail(&self, n: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events matching `pred`
    pub fn count(&self, pred: impl Fn(&EventKind) -> bool) -> usize {
        self.events.iter().filter(|e| pred(&e.kind)).count()
    }
}

fn trace_event(kind: &EventKind) {
    match kind {
        EventKind::Started => tracing::info!("Engine started"),
        EventKind::Stopped => tracing::info!("Engine stopped"),
        EventKind::Entry { price, quantity } => {
            tracing::info!(price = %price, qty = %quantity, "BUY filled")
        }
        EventKind::EntryFailed { error } => tracing::error!(%error, "BUY order failed"),
        EventKind::EntrySkipped { reason } => tracing::warn!(%reason, "Entry skipped"),
        EventKind::Exit {
            reason: ExitReason::StopLoss,
            price,
            pnl_pct,
        } => tracing::error!(
            price = %price,
            pnl_pct = %(*pnl_pct * Decimal::ONE_HUNDRED).round_dp(2),
            "Stop-loss SELL filled"
        ),
        EventKind::Exit {
            reason,
            price,
            pnl_pct,
        } => tracing::info!(
            %reason,
            price = %price,
            pnl_pct = %(*pnl_pct * Decimal::ONE_HUNDRED).round_dp(2),
            "SELL filled"
        ),
        EventKind::ExitFailed { reason, error } => {
            tracing::error!(%reason, %error, "SELL order failed, position still open")
        }
        EventKind::SampleRejected { error } => tracing::warn!(%error, "Price sample rejected"),
        EventKind::ConfigUpdated => tracing::info!("Strategy config updated"),
        EventKind::ConfigRejected { error } => tracing::warn!(%error, "Config update rejected"),
        EventKind::BalanceRefreshed { balance } => {
            tracing::info!(balance = %balance, "Balance refreshed")
        }
        EventKind::BalanceRefreshFailed { error } => {
            tracing::warn!(%error, "Balance refresh failed")
        }
    }
}
