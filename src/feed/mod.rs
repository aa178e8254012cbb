// Price sources feeding the engine
pub mod synthetic;

pub use synthetic::{MarketScenario, SyntheticFeed};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::error::FeedError;

const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 32;

/// Anything that can report the current price of the traded pair
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn latest_price(&self) -> Result<Decimal, FeedError>;

    fn source(&self) -> &str;
}

/// Delay before retrying after `attempt` consecutive failures (0-based): 1s, 2s, 4s ... 32s
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = BACKOFF_BASE_SECS
        .checked_shl(attempt)
        .unwrap_or(BACKOFF_CAP_SECS)
        .min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let delays: Vec<u64> = (0..4).map(|i| backoff_delay(i).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(5).as_secs(), 32);
        assert_eq!(backoff_delay(6).as_secs(), 32);
        assert_eq!(backoff_delay(100).as_secs(), 32);
    }
}
