#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dipbot::error::{ExecutionError, FeedError};
use dipbot::feed::MarketData;
use dipbot::models::{Fill, TradeSide};
use dipbot::ExecutionGateway;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct SimState {
    price: Decimal,
    fail_buys: u32,
    fail_sells: u32,
    holdings: Decimal,
    balance: Option<Decimal>,
    orders: Vec<(TradeSide, Decimal)>,
}

/// Venue that fills at whatever price was last set, with scriptable failures
#[derive(Clone, Default)]
pub struct SimGateway {
    state: Arc<Mutex<SimState>>,
}

impl SimGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, price: Decimal) {
        self.state.lock().unwrap().price = price;
    }

    pub fn fail_next_buys(&self, n: u32) {
        self.state.lock().unwrap().fail_buys = n;
    }

    pub fn fail_next_sells(&self, n: u32) {
        self.state.lock().unwrap().fail_sells = n;
    }

    /// Quote balance reported to the engine; `None` makes the lookup fail
    pub fn set_balance(&self, balance: Option<Decimal>) {
        self.state.lock().unwrap().balance = balance;
    }

    /// Base quantity bought and not yet sold
    pub fn holdings(&self) -> Decimal {
        self.state.lock().unwrap().holdings
    }

    pub fn orders(&self) -> Vec<(TradeSide, Decimal)> {
        self.state.lock().unwrap().orders.clone()
    }
}

#[async_trait]
impl ExecutionGateway for SimGateway {
    async fn place_market_buy(&self, quantity: Decimal) -> Result<Fill, ExecutionError> {
        let mut state = self.state.lock().unwrap();
        state.orders.push((TradeSide::Buy, quantity));
        if state.fail_buys > 0 {
            state.fail_buys -= 1;
            return Err(ExecutionError::ConnectionError("simulated timeout".into()));
        }
        state.holdings += quantity;
        Ok(Fill::new(state.price, quantity))
    }

    async fn place_market_sell(&self, quantity: Decimal) -> Result<Fill, ExecutionError> {
        let mut state = self.state.lock().unwrap();
        state.orders.push((TradeSide::Sell, quantity));
        if state.fail_sells > 0 {
            state.fail_sells -= 1;
            return Err(ExecutionError::OrderRejected("simulated rejection".into()));
        }
        state.holdings -= quantity;
        Ok(Fill::new(state.price, quantity))
    }

    async fn fetch_balance(&self) -> Result<Decimal, ExecutionError> {
        self.state
            .lock()
            .unwrap()
            .balance
            .ok_or_else(|| ExecutionError::ConnectionError("balance not simulated".into()))
    }

    fn name(&self) -> &str {
        "sim"
    }
}

/// Feed replaying fixed prices and moving the gateway's fill price along with them
pub struct ScriptedFeed {
    prices: Mutex<VecDeque<Decimal>>,
    gateway: SimGateway,
}

impl ScriptedFeed {
    pub fn new(prices: Vec<Decimal>, gateway: SimGateway) -> Arc<Self> {
        Arc::new(Self {
            prices: Mutex::new(prices.into()),
            gateway,
        })
    }
}

#[async_trait]
impl MarketData for ScriptedFeed {
    async fn latest_price(&self) -> Result<Decimal, FeedError> {
        let price = self
            .prices
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| FeedError::Request("script exhausted".into()))?;
        self.gateway.set_price(price);
        Ok(price)
    }

    fn source(&self) -> &str {
        "scripted"
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(n)
}
