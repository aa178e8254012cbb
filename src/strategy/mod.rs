// Dip-buying strategy: parameters, rules and the state machine driving them
pub mod config;
pub mod engine;
pub mod rules;

pub use config::StrategyConfig;
pub use engine::{EngineSnapshot, StrategyEngine, TickOutcome};
