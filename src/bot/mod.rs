// Driver task: owns the engine and feeds it one tick at a time
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::error::{DriverError, EngineError};
use crate::feed::{backoff_delay, MarketData};
use crate::settings::Settings;
use crate::strategy::{EngineSnapshot, StrategyConfig, StrategyEngine, TickOutcome};

const COMMAND_BUFFER: usize = 32;

/// Polling behaviour of the driver loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    pub poll_interval: Duration,
    /// Consecutive feed failures tolerated before the loop gives up
    pub max_consecutive_errors: u32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_consecutive_errors: 10,
        }
    }
}

impl From<&Settings> for DriverOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            max_consecutive_errors: settings.max_consecutive_errors,
        }
    }
}

enum Command {
    Start,
    Stop,
    ManualSell(oneshot::Sender<Result<TickOutcome, EngineError>>),
    UpdateConfig(StrategyConfig, oneshot::Sender<Result<(), EngineError>>),
    Snapshot(oneshot::Sender<EngineSnapshot>),
    Shutdown,
}

/// Why the driver loop returned
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Shutdown,
    /// Every handle was dropped
    HandleDropped,
    TooManyErrors(u32),
    Fatal(EngineError),
}

/// Final state handed back when the loop ends
pub struct BotExit {
    pub engine: StrategyEngine,
    pub reason: StopReason,
}

/// Cloneable control surface for a running `Bot`
///
/// Commands are queued and applied between ticks, so they never observe a half-processed
/// tick.
#[derive(Clone)]
pub struct BotHandle {
    tx: mpsc::Sender<Command>,
}

impl BotHandle {
    pub async fn start(&self) -> Result<(), DriverError> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), DriverError> {
        self.send(Command::Stop).await
    }

    pub async fn manual_sell(&self) -> Result<TickOutcome, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ManualSell(tx)).await?;
        let outcome = rx.await.map_err(|_| DriverError::Closed)??;
        Ok(outcome)
    }

    pub async fn update_config(&self, config: StrategyConfig) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::UpdateConfig(config, tx)).await?;
        rx.await.map_err(|_| DriverError::Closed)??;
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| DriverError::Closed)
    }

    /// Ask the loop to exit once the current tick completes
    pub async fn shutdown(&self) -> Result<(), DriverError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<(), DriverError> {
        self.tx.send(command).await.map_err(|_| DriverError::Closed)
    }
}

/// Single task owning the engine
pub struct Bot {
    engine: StrategyEngine,
    feed: Arc<dyn MarketData>,
    options: DriverOptions,
    commands: mpsc::Receiver<Command>,
    consecutive_errors: u32,
    next_poll: Instant,
    last_tick_at: Option<DateTime<Utc>>,
}

impl Bot {
    pub fn new(
        engine: StrategyEngine,
        feed: Arc<dyn MarketData>,
        options: DriverOptions,
    ) -> (Self, BotHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let bot = Self {
            engine,
            feed,
            options,
            commands: rx,
            consecutive_errors: 0,
            next_poll: Instant::now(),
            last_tick_at: None,
        };
        (bot, BotHandle { tx })
    }

    /// Run until shutdown, a fatal engine error, or too many feed failures
    pub async fn run(mut self) -> BotExit {
        tracing::info!(
            source = self.feed.source(),
            gateway = self.engine.gateway_name(),
            poll_secs = self.options.poll_interval.as_secs_f64(),
            "Bot loop started"
        );

        let reason = loop {
            let polling = self.engine.is_running();

            tokio::select! {
                command = self.commands.recv() => {
                    let stop = match command {
                        None => Some(StopReason::HandleDropped),
                        Some(Command::Shutdown) => Some(StopReason::Shutdown),
                        Some(command) => self.handle_command(command).await,
                    };
                    if let Some(reason) = stop {
                        break reason;
                    }
                }
                _ = sleep_until(self.next_poll), if polling => {
                    if let Some(reason) = self.poll().await {
                        break reason;
                    }
                }
            }
        };

        self.engine.stop();
        match &reason {
            StopReason::Fatal(e) => tracing::error!(error = %e, "Bot loop aborted"),
            StopReason::TooManyErrors(n) => {
                tracing::error!(errors = n, "Bot loop stopped after repeated feed failures")
            }
            _ => tracing::info!(?reason, "Bot loop finished"),
        }

        BotExit {
            engine: self.engine,
            reason,
        }
    }

    async fn handle_command(&mut self, command: Command) -> Option<StopReason> {
        match command {
            Command::Start => {
                if !self.engine.is_running() {
                    self.engine.start();
                    if let Err(e) = self.engine.refresh_balance().await {
                        tracing::warn!(
                            error = %e,
                            balance = %self.engine.available_balance(),
                            "Keeping local balance"
                        );
                    }
                    self.consecutive_errors = 0;
                    self.next_poll = Instant::now();
                }
            }
            Command::Stop => self.engine.stop(),
            Command::ManualSell(reply) => {
                let result = self.engine.manual_sell_now().await;
                let fatal = match &result {
                    Err(e) if e.is_fatal() => Some(e.clone()),
                    _ => None,
                };
                let _ = reply.send(result);
                if let Some(e) = fatal {
                    return Some(StopReason::Fatal(e));
                }
            }
            Command::UpdateConfig(config, reply) => {
                let _ = reply.send(self.engine.update_config(config).map_err(EngineError::from));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.engine.snapshot());
            }
            Command::Shutdown => return Some(StopReason::Shutdown),
        }
        None
    }

    async fn poll(&mut self) -> Option<StopReason> {
        let price = match self.feed.latest_price().await {
            Ok(price) => price,
            Err(e) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= self.options.max_consecutive_errors {
                    return Some(StopReason::TooManyErrors(self.consecutive_errors));
                }

                let delay = backoff_delay(self.consecutive_errors - 1);
                tracing::warn!(
                    error = %e,
                    attempt = self.consecutive_errors,
                    retry_in_secs = delay.as_secs(),
                    "Price fetch failed"
                );
                self.next_poll = Instant::now() + delay;
                return None;
            }
        };

        self.consecutive_errors = 0;
        self.next_poll = Instant::now() + self.options.poll_interval;

        let timestamp = self.tick_timestamp();
        match self.engine.on_tick(price, timestamp).await {
            Ok(outcome) => {
                self.log_status(price, &outcome);
                None
            }
            Err(e) if e.is_fatal() => Some(StopReason::Fatal(e)),
            Err(e) => {
                tracing::warn!(error = %e, price = %price, "Tick not processed");
                None
            }
        }
    }

    /// Wall-clock time, nudged forward so sample timestamps stay strictly increasing
    fn tick_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let timestamp = match self.last_tick_at {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_tick_at = Some(timestamp);
        timestamp
    }

    fn log_status(&self, price: Decimal, outcome: &TickOutcome) {
        let state = self.engine.state();
        let balance = self.engine.available_balance();

        match self.engine.current_pnl_pct() {
            Some(pnl) => tracing::info!(
                price = %price,
                %state,
                pnl_pct = %(pnl * Decimal::ONE_HUNDRED).round_dp(2),
                balance = %balance.round_dp(2),
                "Tick"
            ),
            None => tracing::info!(
                price = %price,
                %state,
                balance = %balance.round_dp(2),
                "Tick"
            ),
        }

        if let TickOutcome::EntrySkipped(reason) = outcome {
            tracing::debug!(%reason, "No order sent");
        }
    }
}
