use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::api::{Credentials, Symbol};
use crate::error::ConfigError;
use crate::strategy::StrategyConfig;

const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Runtime settings for the bot
///
/// Percent-valued keys (`buy_drop_pct`, `take_profit_pct`, `stop_loss_pct`) are written in
/// percent, so `2.0` means 2%. `trade_fraction` is already a fraction.
#[derive(Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub binance_api_key: Option<String>,
    #[serde(default)]
    pub binance_api_secret: Option<String>,
    pub testnet: bool,
    pub symbol: String,
    pub buy_drop_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub trade_fraction: Decimal,
    pub lookback_minutes: i64,
    pub min_order_value: Decimal,
    pub quantity_scale: u32,
    pub poll_interval_secs: u64,
    pub max_consecutive_errors: u32,
    pub paper_balance: Decimal,
    pub log_level: String,
}

impl Settings {
    /// Defaults, then `config/default.toml`, then `path`, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = with_defaults(Config::builder())?
            .add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(Environment::default())
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overlaid with a TOML document; the environment is not consulted
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = with_defaults(Config::builder())?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        Symbol::parse(&self.symbol)?;

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::OutOfRange {
                field: "poll_interval_secs",
                range: "[1, inf)",
                value: self.poll_interval_secs.to_string(),
            });
        }
        if self.max_consecutive_errors == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_consecutive_errors",
                range: "[1, inf)",
                value: self.max_consecutive_errors.to_string(),
            });
        }
        if self.paper_balance < Decimal::ZERO {
            return Err(ConfigError::OutOfRange {
                field: "paper_balance",
                range: "[0, inf)",
                value: self.paper_balance.to_string(),
            });
        }

        self.strategy_config().map(|_| ())
    }

    /// Strategy parameters as fractions, validated
    pub fn strategy_config(&self) -> Result<StrategyConfig, ConfigError> {
        let config = StrategyConfig {
            lookback_window: chrono::Duration::minutes(self.lookback_minutes),
            buy_dip_pct: self.buy_drop_pct / Decimal::ONE_HUNDRED,
            take_profit_pct: self.take_profit_pct / Decimal::ONE_HUNDRED,
            stop_loss_pct: self.stop_loss_pct / Decimal::ONE_HUNDRED,
            position_size_pct: self.trade_fraction,
            min_order_value: self.min_order_value,
            quantity_scale: self.quantity_scale,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn symbol(&self) -> Result<Symbol, ConfigError> {
        Symbol::parse(&self.symbol)
    }

    /// API credentials when both key and secret are set and non-empty
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.binance_api_key, &self.binance_api_secret) {
            (Some(key), Some(secret)) if !key.trim().is_empty() && !secret.trim().is_empty() => {
                Some(Credentials::new(key.trim(), secret.trim()))
            }
            _ => None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("binance_api_key", &self.binance_api_key.as_ref().map(|_| "***"))
            .field("binance_api_secret", &self.binance_api_secret.as_ref().map(|_| "***"))
            .field("testnet", &self.testnet)
            .field("symbol", &self.symbol)
            .field("buy_drop_pct", &self.buy_drop_pct)
            .field("take_profit_pct", &self.take_profit_pct)
            .field("stop_loss_pct", &self.stop_loss_pct)
            .field("trade_fraction", &self.trade_fraction)
            .field("lookback_minutes", &self.lookback_minutes)
            .field("min_order_value", &self.min_order_value)
            .field("quantity_scale", &self.quantity_scale)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("max_consecutive_errors", &self.max_consecutive_errors)
            .field("paper_balance", &self.paper_balance)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Ok(builder
        .set_default("testnet", true)?
        .set_default("symbol", "BTC/USDT")?
        .set_default("buy_drop_pct", "2.0")?
        .set_default("take_profit_pct", "3.0")?
        .set_default("stop_loss_pct", "5.0")?
        .set_default("trade_fraction", "0.1")?
        .set_default("lookback_minutes", 5)?
        .set_default("min_order_value", "10")?
        .set_default("quantity_scale", 5)?
        .set_default("poll_interval_secs", 5)?
        .set_default("max_consecutive_errors", 10)?
        .set_default("paper_balance", "10000")?
        .set_default("log_level", "info")?)
}
