use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Mutex;

use super::MarketData;
use crate::error::FeedError;

/// Market behaviour the synthetic feed imitates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketScenario {
    /// Steady uptrend with noise
    Uptrend,
    /// Steady downtrend with noise
    Downtrend,
    /// Choppy, mean-less noise
    Sideways,
    /// Large swings, frequent dips
    Volatile,
}

impl MarketScenario {
    /// (drift, noise) per step as fractions of price
    fn params(self) -> (f64, f64) {
        match self {
            MarketScenario::Uptrend => (0.0005, 0.002),
            MarketScenario::Downtrend => (-0.0005, 0.002),
            MarketScenario::Sideways => (0.0, 0.002),
            MarketScenario::Volatile => (0.0, 0.008),
        }
    }
}

struct WalkState {
    rng: StdRng,
    price: Decimal,
}

/// Seeded random-walk price source for paper trading
///
/// Every `latest_price` call advances the walk by one step; `current_price` peeks
/// without moving it, which is what the paper gateway fills at.
pub struct SyntheticFeed {
    state: Mutex<WalkState>,
    scenario: MarketScenario,
}

impl SyntheticFeed {
    /// Create a feed with a seed for reproducibility
    pub fn new(seed: u64, start_price: Decimal) -> Self {
        Self {
            state: Mutex::new(WalkState {
                rng: StdRng::seed_from_u64(seed),
                price: start_price,
            }),
            scenario: MarketScenario::Volatile,
        }
    }

    pub fn with_scenario(mut self, scenario: MarketScenario) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn scenario(&self) -> MarketScenario {
        self.scenario
    }

    pub fn current_price(&self) -> Result<Decimal, FeedError> {
        let state = self
            .state
            .lock()
            .map_err(|e| FeedError::Request(e.to_string()))?;
        Ok(state.price)
    }

    fn step(&self) -> Result<Decimal, FeedError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| FeedError::Request(e.to_string()))?;

        let (drift, noise) = self.scenario.params();
        let change = drift + state.rng.gen_range(-noise..noise);
        let factor = Decimal::from_f64(1.0 + change)
            .ok_or_else(|| FeedError::Parse(format!("non-finite step {}", change)))?;

        // Two decimals like a quote-currency tick, never below one cent
        state.price = (state.price * factor).round_dp(2).max(dec!(0.01));
        Ok(state.price)
    }
}

#[async_trait]
impl MarketData for SyntheticFeed {
    async fn latest_price(&self) -> Result<Decimal, FeedError> {
        self.step()
    }

    fn source(&self) -> &str {
        "synthetic"
    }
}
