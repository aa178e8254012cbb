// Core modules
pub mod api;
pub mod bot;
pub mod error;
pub mod events;
pub mod execution;
pub mod feed;
pub mod models;
pub mod settings;
pub mod strategy;

// Re-export commonly used types
pub use bot::{Bot, BotExit, BotHandle, DriverOptions, StopReason};
pub use error::{EngineError, ExecutionError};
pub use execution::{ExecutionGateway, PaperGateway, PriceWindow};
pub use feed::{MarketData, SyntheticFeed};
pub use models::*;
pub use settings::Settings;
pub use strategy::{EngineSnapshot, StrategyConfig, StrategyEngine, TickOutcome};
