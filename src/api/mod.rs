pub mod binance;

pub use binance::{BinanceClient, Credentials, Symbol};
