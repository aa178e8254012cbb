use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Parameters of the dip-buying strategy
///
/// All percentages are fractions (0.02 = 2%). Take-profit and stop-loss are
/// applied to a position once, when it is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Trailing span over which the running high is computed
    #[serde(with = "duration_secs")]
    pub lookback_window: Duration,
    /// Buy when price is at least this far below the running high
    pub buy_dip_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    /// Fraction of available balance committed per entry
    pub position_size_pct: Decimal,
    /// Smallest order value (quote currency) the venue accepts
    #[serde(default)]
    pub min_order_value: Decimal,
    /// Decimal places order quantities are truncated to
    #[serde(default = "default_quantity_scale")]
    pub quantity_scale: u32,
}

fn default_quantity_scale() -> u32 {
    5
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            lookback_window: Duration::minutes(5),
            buy_dip_pct: dec!(0.02),
            take_profit_pct: dec!(0.03),
            stop_loss_pct: dec!(0.05),
            position_size_pct: dec!(0.1),
            min_order_value: dec!(10),
            quantity_scale: default_quantity_scale(),
        }
    }
}

impl StrategyConfig {
    /// Check every threshold, returning the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_window <= Duration::zero() {
            return Err(ConfigError::EmptyLookback);
        }

        if self.buy_dip_pct <= Decimal::ZERO || self.buy_dip_pct >= Decimal::ONE {
            return Err(out_of_range("buy_dip_pct", "(0, 1)", self.buy_dip_pct));
        }
        if self.take_profit_pct <= Decimal::ZERO
            || Decimal::ONE.checked_add(self.take_profit_pct).is_none()
        {
            return Err(out_of_range("take_profit_pct", "(0, inf)", self.take_profit_pct));
        }
        // A stop at or beyond 100% would put the stop price at or below zero
        if self.stop_loss_pct <= Decimal::ZERO || self.stop_loss_pct >= Decimal::ONE {
            return Err(out_of_range("stop_loss_pct", "(0, 1)", self.stop_loss_pct));
        }
        if self.position_size_pct <= Decimal::ZERO || self.position_size_pct > Decimal::ONE {
            return Err(out_of_range(
                "position_size_pct",
                "(0, 1]",
                self.position_size_pct,
            ));
        }
        if self.min_order_value < Decimal::ZERO {
            return Err(out_of_range(
                "min_order_value",
                "[0, inf)",
                self.min_order_value,
            ));
        }
        if self.quantity_scale > 18 {
            return Err(out_of_range(
                "quantity_scale",
                "[0, 18]",
                Decimal::from(self.quantity_scale),
            ));
        }

        Ok(())
    }

    /// Price at or below which an entry fires for the given running high
    pub fn entry_trigger(&self, running_high: Decimal) -> Option<Decimal> {
        Decimal::ONE
            .checked_sub(self.buy_dip_pct)
            .and_then(|factor| running_high.checked_mul(factor))
    }

    /// `None` when the price does not fit in a `Decimal`
    pub fn take_profit_price(&self, entry_price: Decimal) -> Option<Decimal> {
        Decimal::ONE
            .checked_add(self.take_profit_pct)
            .and_then(|factor| entry_price.checked_mul(factor))
    }

    pub fn stop_loss_price(&self, entry_price: Decimal) -> Option<Decimal> {
        Decimal::ONE
            .checked_sub(self.stop_loss_pct)
            .and_then(|factor| entry_price.checked_mul(factor))
    }
}

fn out_of_range(field: &'static str, range: &'static str, value: Decimal) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        range,
        value: value.to_string(),
    }
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(secs))
    }
}
