use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Rejected price samples
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataError {
    #[error("out-of-order sample at {timestamp} (latest is {latest})")]
    OutOfOrderSample {
        timestamp: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    #[error("invalid price {0}: must be positive")]
    InvalidPrice(Decimal),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WindowError {
    #[error("price window is empty")]
    EmptyWindow,

    #[error(transparent)]
    Data(#[from] DataError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("a position is already open")]
    AlreadyOpen,

    #[error("no open position")]
    NoOpenPosition,

    #[error("exit thresholds cannot be represented at entry price {0}")]
    ThresholdOverflow(Decimal),
}

/// Venue failures. The engine treats both kinds the same way.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("connection error: {0}")]
    ConnectionError(String),
}

impl From<reqwest::Error> for ExecutionError {
    fn from(err: reqwest::Error) -> Self {
        Self::ConnectionError(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: String,
    },

    #[error("lookback window must be positive")]
    EmptyLookback,

    #[error("invalid settings: {0}")]
    Invalid(String),
}

impl From<::config::ConfigError> for ConfigError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Invalid(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("market data request failed: {0}")]
    Request(String),

    #[error("unexpected market data response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

/// Everything the engine can report back to its driver
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("rejected sample: {0}")]
    Data(#[from] DataError),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Position(#[from] TrackerError),
}

impl EngineError {
    /// Only invariant violations indicate a logic defect; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::InvariantViolation(_))
    }
}

/// Failures seen through a `BotHandle`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("bot task has shut down")]
    Closed,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<ConfigError> for DriverError {
    fn from(err: ConfigError) -> Self {
        Self::Engine(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invariant_violations_are_fatal() {
        assert!(EngineError::InvariantViolation("double open".into()).is_fatal());
        assert!(!EngineError::Data(DataError::InvalidPrice(Decimal::ZERO)).is_fatal());
        assert!(!EngineError::Execution(ExecutionError::OrderRejected("x".into())).is_fatal());
        assert!(!EngineError::Position(TrackerError::NoOpenPosition).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = ConfigError::OutOfRange {
            field: "buy_dip_pct",
            range: "(0, 1)",
            value: "1.5".into(),
        };
        assert_eq!(err.to_string(), "buy_dip_pct must be in (0, 1), got 1.5");
        assert_eq!(
            ExecutionError::ConnectionError("timeout".into()).to_string(),
            "connection error: timeout"
        );
    }
}
