use crate::error::{DataError, WindowError};
use crate::models::PriceSample;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Time-bounded rolling buffer of price samples
///
/// Keeps every sample within `[latest - lookback, latest]`. Timestamps are strictly increasing.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    samples: VecDeque<PriceSample>,
    lookback: Duration,
}

impl PriceWindow {
    pub fn new(lookback: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            lookback,
        }
    }

    /// Add a sample, then evict everything older than `sample.timestamp - lookback`
    ///
    /// Samples that do not advance the clock or carry a non-positive price are rejected
    /// and leave the window untouched.
    pub fn insert(&mut self, sample: PriceSample) -> Result<(), DataError> {
        if sample.price <= Decimal::ZERO {
            return Err(DataError::InvalidPrice(sample.price));
        }

        if let Some(latest) = self.samples.back() {
            if sample.timestamp <= latest.timestamp {
                return Err(DataError::OutOfOrderSample {
                    timestamp: sample.timestamp,
                    latest: latest.timestamp,
                });
            }
        }

        // Insert before evicting so the window is never empty afterwards
        self.samples.push_back(sample);
        self.evict_before(sample.timestamp - self.lookback);

        Ok(())
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }

    /// Highest retained price
    pub fn high(&self) -> Result<Decimal, WindowError> {
        self.samples
            .iter()
            .map(|s| s.price)
            .max()
            .ok_or(WindowError::EmptyWindow)
    }

    /// Most recent price
    pub fn latest(&self) -> Result<Decimal, WindowError> {
        self.samples
            .back()
            .map(|s| s.price)
            .ok_or(WindowError::EmptyWindow)
    }

    pub fn latest_sample(&self) -> Option<&PriceSample> {
        self.samples.back()
    }

    pub fn oldest_sample(&self) -> Option<&PriceSample> {
        self.samples.front()
    }

    /// Change the lookback span. Takes effect on the next insert.
    pub fn set_lookback(&mut self, lookback: Duration) {
        self.lookback = lookback;
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &PriceSample> {
        self.samples.iter()
    }
}
