use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{rules, StrategyConfig};
use crate::error::{ConfigError, EngineError, ExecutionError, TrackerError};
use crate::events::{Event, EventKind, EventLog};
use crate::execution::{ExecutionGateway, Position, PositionTracker, PriceWindow};
use crate::models::{EngineState, ExitReason, PriceSample, TradeRecord};

pub const SNAPSHOT_RECENT_TRADES: usize = 10;
pub const SNAPSHOT_EVENT_TAIL: usize = 50;

/// What a single tick (or manual command) did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Engine is stopped; the sample was not processed
    Ignored,
    NoAction,
    Entered(Position),
    EntrySkipped(String),
    EntryFailed(ExecutionError),
    Exited(TradeRecord),
    ExitFailed {
        reason: ExitReason,
        error: ExecutionError,
    },
}

/// Read-only copy of engine state for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub running: bool,
    pub gateway: String,
    pub position: Option<Position>,
    pub last_price: Option<Decimal>,
    pub running_high: Option<Decimal>,
    /// Price that would trigger an entry (only while idle)
    pub entry_trigger: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub available_balance: Decimal,
    pub realized_pnl: Decimal,
    pub manual_sell_pending: bool,
    pub config: StrategyConfig,
    pub recent_trades: Vec<TradeRecord>,
    pub events: Vec<Event>,
}

/// Dip-buying state machine for a single trading pair
///
/// Every tick updates the price window and then evaluates either the entry rule (IDLE)
/// or the exit rules (IN_POSITION). Ticks must be fed sequentially; the engine is owned by
/// exactly one driver task.
pub struct StrategyEngine {
    config: StrategyConfig,
    gateway: Box<dyn ExecutionGateway>,
    window: PriceWindow,
    tracker: PositionTracker,
    events: EventLog,
    available_balance: Decimal,
    running: bool,
    manual_sell_pending: bool,
}

impl StrategyEngine {
    /// Create a stopped engine. Call `start` before feeding ticks.
    pub fn new(
        config: StrategyConfig,
        gateway: Box<dyn ExecutionGateway>,
        available_balance: Decimal,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        tracing::info!(
            gateway = gateway.name(),
            lookback_secs = config.lookback_window.num_seconds(),
            buy_dip_pct = %config.buy_dip_pct,
            take_profit_pct = %config.take_profit_pct,
            stop_loss_pct = %config.stop_loss_pct,
            position_size_pct = %config.position_size_pct,
            "Strategy engine created"
        );

        Ok(Self {
            window: PriceWindow::new(config.lookback_window),
            config,
            gateway,
            tracker: PositionTracker::new(),
            events: EventLog::new(),
            available_balance,
            running: false,
            manual_sell_pending: false,
        })
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.events.append(Utc::now(), EventKind::Started);
    }

    /// Stop processing ticks. Never interrupts an order already sent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.events.append(Utc::now(), EventKind::Stopped);
    }

    /// Replace the strategy parameters for future entries
    ///
    /// An open position keeps the thresholds it was opened with. An invalid config is
    /// rejected and the current one stays in force.
    pub fn update_config(&mut self, config: StrategyConfig) -> Result<(), ConfigError> {
        if let Err(e) = config.validate() {
            self.events.append(
                Utc::now(),
                EventKind::ConfigRejected {
                    error: e.to_string(),
                },
            );
            return Err(e);
        }

        self.window.set_lookback(config.lookback_window);
        self.config = config;
        self.events.append(Utc::now(), EventKind::ConfigUpdated);
        Ok(())
    }

    /// Replace the available balance with the venue's figure
    pub async fn refresh_balance(&mut self) -> Result<Decimal, ExecutionError> {
        match self.gateway.fetch_balance().await {
            Ok(balance) => {
                self.available_balance = balance;
                self.events
                    .append(Utc::now(), EventKind::BalanceRefreshed { balance });
                Ok(balance)
            }
            Err(e) => {
                self.events.append(
                    Utc::now(),
                    EventKind::BalanceRefreshFailed {
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Sell the open position right away
    ///
    /// If the sell fails the request stays pending and is retried, ahead of the automatic
    /// rules, on the next tick.
    pub async fn manual_sell_now(&mut self) -> Result<TickOutcome, EngineError> {
        if !self.tracker.is_open() {
            tracing::warn!("Manual sell requested with no open position");
            return Err(TrackerError::NoOpenPosition.into());
        }

        self.manual_sell_pending = true;
        let now = self.exit_time(Utc::now());
        self.execute_exit(ExitReason::Manual, now).await
    }

    // ------------------------------------------------------------------
    // Tick processing
    // ------------------------------------------------------------------

    /// Process one price sample
    ///
    /// Rejected samples come back as `EngineError::Data`; venue failures are reported as
    /// outcomes, not errors. `EngineError::InvariantViolation` means the engine is broken
    /// and the caller should stop feeding it.
    pub async fn on_tick(
        &mut self,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<TickOutcome, EngineError> {
        if !self.running {
            tracing::debug!(price = %price, "Engine stopped, tick ignored");
            return Ok(TickOutcome::Ignored);
        }

        if let Err(e) = self.window.insert(PriceSample::new(price, timestamp)) {
            self.events.append(
                Utc::now(),
                EventKind::SampleRejected {
                    error: e.to_string(),
                },
            );
            return Err(e.into());
        }

        match self.state() {
            EngineState::Idle => self.evaluate_entry(price, timestamp).await,
            EngineState::InPosition => self.evaluate_exit(price, timestamp).await,
        }
    }

    async fn evaluate_entry(
        &mut self,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<TickOutcome, EngineError> {
        let high = self
            .window
            .high()
            .map_err(|e| EngineError::InvariantViolation(format!("after insert: {}", e)))?;

        tracing::debug!(
            price = %price,
            high = %high,
            trigger = ?self.config.entry_trigger(high),
            "Evaluating entry"
        );

        if !rules::is_dip(price, high, &self.config) {
            return Ok(TickOutcome::NoAction);
        }

        let drop_pct = rules::dip_pct(price, high) * Decimal::ONE_HUNDRED;
        tracing::info!(drop_pct = %drop_pct.round_dp(2), high = %high, "Buy signal detected");

        if self.config.take_profit_price(price).is_none()
            || self.config.stop_loss_price(price).is_none()
        {
            return Ok(self.skip_entry(
                timestamp,
                format!("exit thresholds overflow at price {}", price),
            ));
        }

        // Size from the venue's figure; the local one drifts with fees between refreshes
        if let Err(e) = self.refresh_balance().await {
            tracing::warn!(
                error = %e,
                balance = %self.available_balance,
                "Balance refresh failed, sizing from local balance"
            );
        }

        let budget = self.available_balance * self.config.position_size_pct;
        if budget < self.config.min_order_value {
            return Ok(self.skip_entry(
                timestamp,
                format!(
                    "order value {:.2} below minimum {}",
                    budget, self.config.min_order_value
                ),
            ));
        }

        let quantity = rules::order_quantity(budget, price, self.config.quantity_scale);
        if quantity.is_zero() {
            return Ok(self.skip_entry(
                timestamp,
                format!("quantity rounds to zero at price {}", price),
            ));
        }

        tracing::info!(qty = %quantity, gateway = self.gateway.name(), "Placing BUY order");
        let fill = match self.gateway.place_market_buy(quantity).await {
            Ok(fill) if fill.price > Decimal::ZERO && fill.quantity > Decimal::ZERO => fill,
            Ok(fill) => {
                let error = ExecutionError::OrderRejected(format!(
                    "empty fill: {} @ {}",
                    fill.quantity, fill.price
                ));
                return Ok(self.entry_failed(timestamp, error));
            }
            Err(error) => return Ok(self.entry_failed(timestamp, error)),
        };

        let position = self
            .tracker
            .open(fill.price, fill.quantity, timestamp, &self.config)
            .map_err(|e| EngineError::InvariantViolation(format!("entry while {}", e)))?
            .clone();

        self.available_balance = (self.available_balance - fill.notional()).max(Decimal::ZERO);
        self.events.append(
            timestamp,
            EventKind::Entry {
                price: fill.price,
                quantity: fill.quantity,
            },
        );

        Ok(TickOutcome::Entered(position))
    }

    async fn evaluate_exit(
        &mut self,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<TickOutcome, EngineError> {
        let position = self.tracker.position().ok_or_else(|| {
            EngineError::InvariantViolation("IN_POSITION without a position".to_string())
        })?;

        let reason = if self.manual_sell_pending {
            Some(ExitReason::Manual)
        } else {
            rules::exit_reason(price, position)
        };

        match reason {
            Some(reason) => self.execute_exit(reason, timestamp).await,
            None => Ok(TickOutcome::NoAction),
        }
    }

    async fn execute_exit(
        &mut self,
        reason: ExitReason,
        timestamp: DateTime<Utc>,
    ) -> Result<TickOutcome, EngineError> {
        let quantity = self
            .tracker
            .position()
            .map(|p| p.quantity)
            .ok_or_else(|| EngineError::InvariantViolation("exit without a position".into()))?;

        tracing::info!(%reason, qty = %quantity, gateway = self.gateway.name(), "Placing SELL order");
        let result = match self.gateway.place_market_sell(quantity).await {
            Ok(fill) if fill.price <= Decimal::ZERO || fill.quantity <= Decimal::ZERO => Err(
                ExecutionError::OrderRejected(format!(
                    "empty fill: {} @ {}",
                    fill.quantity, fill.price
                )),
            ),
            other => other,
        };
        let fill = match result {
            Ok(fill) => fill,
            Err(error) => {
                self.events.append(
                    timestamp,
                    EventKind::ExitFailed {
                        reason,
                        error: error.to_string(),
                    },
                );
                return Ok(TickOutcome::ExitFailed { reason, error });
            }
        };

        let record = self
            .tracker
            .close(fill.price, timestamp, reason)
            .map_err(|e| EngineError::InvariantViolation(format!("exit while {}", e)))?;

        self.manual_sell_pending = false;
        self.available_balance += fill.notional();
        self.events.append(
            timestamp,
            EventKind::Exit {
                reason,
                price: fill.price,
                pnl_pct: record.pnl_pct(),
            },
        );

        Ok(TickOutcome::Exited(record))
    }

    fn skip_entry(&mut self, timestamp: DateTime<Utc>, reason: String) -> TickOutcome {
        self.events.append(
            timestamp,
            EventKind::EntrySkipped {
                reason: reason.clone(),
            },
        );
        TickOutcome::EntrySkipped(reason)
    }

    fn entry_failed(&mut self, timestamp: DateTime<Utc>, error: ExecutionError) -> TickOutcome {
        self.events.append(
            timestamp,
            EventKind::EntryFailed {
                error: error.to_string(),
            },
        );
        TickOutcome::EntryFailed(error)
    }

    /// Exit timestamp for commands issued outside a tick; never before the last sample
    fn exit_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.window
            .latest_sample()
            .map(|s| s.timestamp.max(now))
            .unwrap_or(now)
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn state(&self) -> EngineState {
        if self.tracker.is_open() {
            EngineState::InPosition
        } else {
            EngineState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn position(&self) -> Option<&Position> {
        self.tracker.position()
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// All closed trades, oldest first
    pub fn trades(&self) -> &[TradeRecord] {
        self.tracker.history()
    }

    pub fn available_balance(&self) -> Decimal {
        self.available_balance
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.window.latest().ok()
    }

    pub fn manual_sell_pending(&self) -> bool {
        self.manual_sell_pending
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    /// Fractional P&L of the open position at the last seen price
    pub fn current_pnl_pct(&self) -> Option<Decimal> {
        let price = self.last_price()?;
        self.tracker.current_pnl_pct(price).ok()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let last_price = self.last_price();
        let running_high = self.window.high().ok();
        let position = self.tracker.position().cloned();

        let entry_trigger = match (self.state(), running_high) {
            (EngineState::Idle, Some(high)) => self.config.entry_trigger(high),
            _ => None,
        };
        let unrealized_pnl = position
            .as_ref()
            .zip(last_price)
            .map(|(p, price)| p.unrealized_pnl(price));

        EngineSnapshot {
            state: self.state(),
            running: self.running,
            gateway: self.gateway.name().to_string(),
            position,
            last_price,
            running_high,
            entry_trigger,
            pnl_pct: self.current_pnl_pct(),
            unrealized_pnl,
            available_balance: self.available_balance,
            realized_pnl: self.tracker.total_pnl(),
            manual_sell_pending: self.manual_sell_pending,
            config: self.config.clone(),
            recent_trades: self.tracker.recent_trades(SNAPSHOT_RECENT_TRADES).to_vec(),
            events: self.events.tail(SNAPSHOT_EVENT_TAIL).to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fill;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Gateway that replays scripted results and records every order
    #[derive(Clone, Default)]
    struct ScriptedGateway {
        buys: Arc<Mutex<VecDeque<Result<Fill, ExecutionError>>>>,
        sells: Arc<Mutex<VecDeque<Result<Fill, ExecutionError>>>>,
        orders: Arc<Mutex<Vec<(&'static str, Decimal)>>>,
        balance: Arc<Mutex<Option<Decimal>>>,
    }

    impl ScriptedGateway {
        fn buy(self, result: Result<Fill, ExecutionError>) -> Self {
            self.buys.lock().unwrap().push_back(result);
            self
        }

        fn sell(self, result: Result<Fill, ExecutionError>) -> Self {
            self.sells.lock().unwrap().push_back(result);
            self
        }

        fn set_balance(&self, balance: Decimal) {
            *self.balance.lock().unwrap() = Some(balance);
        }

        fn orders(&self) -> Vec<(&'static str, Decimal)> {
            self.orders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecutionGateway for ScriptedGateway {
        async fn place_market_buy(&self, quantity: Decimal) -> Result<Fill, ExecutionError> {
            self.orders.lock().unwrap().push(("buy", quantity));
            self.buys
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ExecutionError::ConnectionError("no script".into())))
        }

        async fn place_market_sell(&self, quantity: Decimal) -> Result<Fill, ExecutionError> {
            self.orders.lock().unwrap().push(("sell", quantity));
            self.sells
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ExecutionError::ConnectionError("no script".into())))
        }

        async fn fetch_balance(&self) -> Result<Decimal, ExecutionError> {
            self.balance
                .lock()
                .unwrap()
                .ok_or_else(|| ExecutionError::ConnectionError("no balance".into()))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            lookback_window: Duration::seconds(5),
            buy_dip_pct: dec!(0.02),
            take_profit_pct: dec!(0.03),
            stop_loss_pct: dec!(0.05),
            position_size_pct: dec!(0.1),
            min_order_value: dec!(10),
            quantity_scale: 5,
        }
    }

    fn engine(gateway: ScriptedGateway) -> StrategyEngine {
        let mut engine = StrategyEngine::new(config(), Box::new(gateway), dec!(1000)).unwrap();
        engine.start();
        engine
    }

    #[tokio::test]
    async fn test_new_engine_is_idle_and_stopped() {
        let engine =
            StrategyEngine::new(config(), Box::new(ScriptedGateway::default()), dec!(1000))
                .unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.is_running());
        assert!(engine.events().is_empty());
    }

    #[test]
    fn test_new_engine_rejects_invalid_config() {
        let bad = StrategyConfig {
            stop_loss_pct: dec!(-0.05),
            ..config()
        };
        let result = StrategyEngine::new(bad, Box::new(ScriptedGateway::default()), dec!(1000));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stopped_engine_ignores_ticks() {
        let mut engine = engine(ScriptedGateway::default());
        engine.stop();

        let outcome = engine.on_tick(dec!(100), at(0)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Ignored);
        assert_eq!(engine.last_price(), None);
    }

    #[tokio::test]
    async fn test_dip_triggers_entry() {
        let gateway = ScriptedGateway::default().buy(Ok(Fill::new(dec!(97.95), dec!(1.02145))));
        let mut engine = engine(gateway.clone());

        assert_eq!(
            engine.on_tick(dec!(100), at(0)).await.unwrap(),
            TickOutcome::NoAction
        );
        let outcome = engine.on_tick(dec!(97.9), at(1)).await.unwrap();

        let position = match outcome {
            TickOutcome::Entered(position) => position,
            other => panic!("expected entry, got {:?}", other),
        };
        assert_eq!(position.entry_price, dec!(97.95));
        assert_eq!(position.entry_time, at(1));
        assert_eq!(engine.state(), EngineState::InPosition);

        // 1000 * 0.1 / 97.9, truncated to 5 decimals
        assert_eq!(gateway.orders(), vec![("buy", dec!(1.02145))]);
        assert_eq!(
            engine.available_balance(),
            dec!(1000) - dec!(97.95) * dec!(1.02145)
        );
        assert!(matches!(
            engine.events().last().unwrap().kind,
            EventKind::Entry { .. }
        ));
        // Venue balance unavailable, so the entry was sized from the local 1000
        assert_eq!(
            engine
                .events()
                .count(|k| matches!(k, EventKind::BalanceRefreshFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_entry_sized_from_refreshed_balance() {
        let gateway = ScriptedGateway::default()
            .buy(Ok(Fill::new(dec!(97.9), dec!(2.0429))))
            .sell(Ok(Fill::new(dec!(98), dec!(2.0429))))
            .buy(Ok(Fill::new(dec!(97.9), dec!(0.51072))));
        gateway.set_balance(dec!(2000));
        let mut engine = engine(gateway.clone());

        engine.on_tick(dec!(100), at(0)).await.unwrap();
        let outcome = engine.on_tick(dec!(97.9), at(1)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Entered(_)));
        engine.manual_sell_now().await.unwrap();

        // Fees or outside transfers moved the venue balance
        gateway.set_balance(dec!(500));
        let outcome = engine.on_tick(dec!(97.9), at(2)).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Entered(_)));

        // 2000 * 0.1 / 97.9 and 500 * 0.1 / 97.9, truncated to 5 decimals
        assert_eq!(
            gateway.orders(),
            vec![
                ("buy", dec!(2.0429)),
                ("sell", dec!(2.0429)),
                ("buy", dec!(0.51072))
            ]
        );
        assert_eq!(
            engine.available_balance(),
            dec!(500) - dec!(97.9) * dec!(0.51072)
        );
    }

    #[tokio::test]
    async fn test_unrepresentable_take_profit_skips_entry() {
        let gateway = ScriptedGateway::default().buy(Ok(Fill::new(dec!(97), dec!(1))));
        let config = StrategyConfig {
            take_profit_pct: Decimal::from_scientific("1e27").unwrap(),
            ..config()
        };
        let mut engine = StrategyEngine::new(config, Box::new(gateway.clone()), dec!(1000)).unwrap();
        engine.start();

        engine.on_tick(dec!(100), at(0)).await.unwrap();
        let outcome = engine.on_tick(dec!(97), at(1)).await.unwrap();

        assert!(matches!(outcome, TickOutcome::EntrySkipped(_)));
        assert!(gateway.orders().is_empty());
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.snapshot().entry_trigger.is_some());
    }

    #[tokio::test]
    async fn test_shallow_dip_does_nothing() {
        let gateway = ScriptedGateway::default();
        let mut engine = engine(gateway.clone());

        engine.on_tick(dec!(100), at(0)).await.unwrap();
        let outcome = engine.on_tick(dec!(98.5), at(1)).await.unwrap();

        assert_eq!(outcome, TickOutcome::NoAction);
        assert!(gateway.orders().is_empty());
    }

    #[tokio::test]
    async fn test_failed_buy_stays_idle() {
        let gateway = ScriptedGateway::default()
            .buy(Err(ExecutionError::OrderRejected("insufficient funds".into())));
        let mut engine = engine(gateway);

        engine.on_tick(dec!(100), at(0)).await.unwrap();
        let outcome = engine.on_tick(dec!(97), at(1)).await.unwrap();

        assert!(matches!(outcome, TickOutcome::EntryFailed(_)));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.available_balance(), dec!(1000));
        assert_eq!(
            engine
                .events()
                .count(|k| matches!(k, EventKind::EntryFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_entry_skipped_below_min_order_value() {
        let gateway = ScriptedGateway::default();
        let mut engine =
            StrategyEngine::new(config(), Box::new(gateway.clone()), dec!(50)).unwrap();
        engine.start();

        engine.on_tick(dec!(100), at(0)).await.unwrap();
        let outcome = engine.on_tick(dec!(97), at(1)).await.unwrap();

        assert!(matches!(outcome, TickOutcome::EntrySkipped(_)));
        assert!(gateway.orders().is_empty());
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_take_profit_exit() {
        let gateway = ScriptedGateway::default()
            .buy(Ok(Fill::new(dec!(100), dec!(1))))
            .sell(Ok(Fill::new(dec!(103), dec!(1))));
        let mut engine = engine(gateway);

        engine.on_tick(dec!(102.1), at(0)).await.unwrap();
        engine.on_tick(dec!(100), at(1)).await.unwrap();
        assert_eq!(engine.state(), EngineState::InPosition);

        let outcome = engine.on_tick(dec!(103), at(2)).await.unwrap();
        let record = match outcome {
            TickOutcome::Exited(record) => record,
            other => panic!("expected exit, got {:?}", other),
        };

        assert_eq!(record.exit_reason, ExitReason::TakeProfit);
        assert_eq!(record.pnl_pct(), dec!(0.03));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.trades().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_sell_keeps_position() {
        let gateway = ScriptedGateway::default()
            .buy(Ok(Fill::new(dec!(100), dec!(1))))
            .sell(Err(ExecutionError::ConnectionError("timeout".into())));
        let mut engine = engine(gateway);

        engine.on_tick(dec!(102.1), at(0)).await.unwrap();
        engine.on_tick(dec!(100), at(1)).await.unwrap();

        let outcome = engine.on_tick(dec!(94), at(2)).await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::ExitFailed {
                reason: ExitReason::StopLoss,
                ..
            }
        ));
        assert_eq!(engine.state(), EngineState::InPosition);
        assert_eq!(
            engine
                .events()
                .count(|k| matches!(k, EventKind::ExitFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_empty_sell_fill_is_exit_failure() {
        let gateway = ScriptedGateway::default()
            .buy(Ok(Fill::new(dec!(100), dec!(1))))
            .sell(Ok(Fill::new(Decimal::ZERO, dec!(1))));
        let mut engine = engine(gateway);

        engine.on_tick(dec!(102.1), at(0)).await.unwrap();
        engine.on_tick(dec!(100), at(1)).await.unwrap();

        let outcome = engine.manual_sell_now().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::ExitFailed {
                reason: ExitReason::Manual,
                error: ExecutionError::OrderRejected(_),
            }
        ));
        assert_eq!(engine.state(), EngineState::InPosition);
        assert!(engine.manual_sell_pending());
        assert!(engine.trades().is_empty());
        assert_eq!(
            engine
                .events()
                .count(|k| matches!(k, EventKind::ExitFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_manual_sell_when_idle() {
        let mut engine = engine(ScriptedGateway::default());
        let before = engine.events().len();

        let result = engine.manual_sell_now().await;
        assert_eq!(
            result,
            Err(EngineError::Position(TrackerError::NoOpenPosition))
        );
        assert_eq!(engine.events().len(), before);
    }

    #[tokio::test]
    async fn test_failed_manual_sell_retried_on_next_tick() {
        let gateway = ScriptedGateway::default()
            .buy(Ok(Fill::new(dec!(100), dec!(1))))
            .sell(Err(ExecutionError::ConnectionError("down".into())))
            .sell(Ok(Fill::new(dec!(101), dec!(1))));
        let mut engine = engine(gateway);

        engine.on_tick(dec!(102.1), at(0)).await.unwrap();
        engine.on_tick(dec!(100), at(1)).await.unwrap();

        let outcome = engine.manual_sell_now().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::ExitFailed {
                reason: ExitReason::Manual,
                ..
            }
        ));
        assert!(engine.manual_sell_pending());

        // 101 is inside both thresholds, only the pending manual sell fires
        let outcome = engine.on_tick(dec!(101), at(2)).await.unwrap();
        let record = match outcome {
            TickOutcome::Exited(record) => record,
            other => panic!("expected exit, got {:?}", other),
        };
        assert_eq!(record.exit_reason, ExitReason::Manual);
        assert!(!engine.manual_sell_pending());
    }

    #[tokio::test]
    async fn test_rejected_sample_is_logged() {
        let mut engine = engine(ScriptedGateway::default());
        engine.on_tick(dec!(100), at(5)).await.unwrap();

        let result = engine.on_tick(dec!(90), at(4)).await;
        assert!(matches!(result, Err(EngineError::Data(_))));
        assert_eq!(engine.last_price(), Some(dec!(100)));
        assert!(matches!(
            engine.events().last().unwrap().kind,
            EventKind::SampleRejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid() {
        let mut engine = engine(ScriptedGateway::default());
        let bad = StrategyConfig {
            buy_dip_pct: dec!(1.2),
            ..config()
        };

        assert!(engine.update_config(bad).is_err());
        assert_eq!(engine.config().buy_dip_pct, dec!(0.02));
        assert!(matches!(
            engine.events().last().unwrap().kind,
            EventKind::ConfigRejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_refresh_balance() {
        let gateway = ScriptedGateway::default();
        gateway.set_balance(dec!(5000));
        let mut engine = engine(gateway);
        assert_eq!(engine.refresh_balance().await.unwrap(), dec!(5000));
        assert_eq!(engine.available_balance(), dec!(5000));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let gateway = ScriptedGateway::default().buy(Ok(Fill::new(dec!(98), dec!(1))));
        let mut engine = engine(gateway);

        engine.on_tick(dec!(100), at(0)).await.unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, EngineState::Idle);
        assert_eq!(snapshot.entry_trigger, Some(dec!(98)));
        assert_eq!(snapshot.position, None);
        assert_eq!(snapshot.gateway, "scripted");

        engine.on_tick(dec!(98), at(1)).await.unwrap();
        engine.on_tick(dec!(99), at(2)).await.unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, EngineState::InPosition);
        assert_eq!(snapshot.entry_trigger, None);
        assert_eq!(snapshot.running_high, Some(dec!(100)));
        assert_eq!(snapshot.unrealized_pnl, Some(dec!(1)));
        assert_eq!(snapshot.pnl_pct, Some(dec!(1) / dec!(98)));
        assert!(snapshot.running);
    }
}
