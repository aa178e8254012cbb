use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use dipbot::api::BinanceClient;
use dipbot::bot::{Bot, BotExit, DriverOptions, StopReason};
use dipbot::execution::PaperGateway;
use dipbot::feed::{MarketData, MarketScenario, SyntheticFeed};
use dipbot::settings::Settings;
use dipbot::strategy::{StrategyConfig, StrategyEngine};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const PAPER_START_PRICE: Decimal = dec!(60000);
const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "bot.log";

#[derive(Parser, Debug)]
#[command(name = "dipbot")]
#[command(about = "Momentum dip-buying bot for a single spot pair", long_about = None)]
struct Args {
    /// Extra settings file layered over config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trade on Binance mainnet (REAL MONEY)
    #[arg(long, conflicts_with = "paper")]
    mainnet: bool,

    /// Paper trading against a synthetic random-walk feed
    #[arg(long)]
    paper: bool,

    /// Poll interval in seconds (overrides settings)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    /// Seed for the synthetic feed
    #[arg(long)]
    seed: Option<u64>,

    /// Market behaviour of the synthetic feed
    #[arg(long, value_enum, default_value_t = ScenarioArg::Volatile)]
    scenario: ScenarioArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScenarioArg {
    Uptrend,
    Downtrend,
    Sideways,
    Volatile,
}

impl From<ScenarioArg> for MarketScenario {
    fn from(arg: ScenarioArg) -> Self {
        match arg {
            ScenarioArg::Uptrend => MarketScenario::Uptrend,
            ScenarioArg::Downtrend => MarketScenario::Downtrend,
            ScenarioArg::Sideways => MarketScenario::Sideways,
            ScenarioArg::Volatile => MarketScenario::Volatile,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    if args.mainnet {
        settings.testnet = false;
    }
    if let Some(interval) = args.interval {
        settings.poll_interval_secs = interval;
    }

    let _log_guard = setup_logging(&settings.log_level)?;

    tracing::info!("🚀 dipbot starting");
    tracing::debug!(?settings, "Loaded settings");

    let strategy = settings
        .strategy_config()
        .context("invalid strategy settings")?;
    log_strategy(&settings, &strategy);

    let (engine, feed) = if args.paper {
        build_paper(&settings, strategy, args.seed, args.scenario.into())?
    } else {
        build_live(&settings, strategy)?
    };

    let (bot, handle) = Bot::new(engine, feed, DriverOptions::from(&settings));
    let mut task = tokio::spawn(bot.run());
    handle.start().await.context("bot task exited before start")?;

    let exit = tokio::select! {
        result = &mut task => result.context("bot task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, finishing current tick");
            // The loop may already be gone; the join below reports why
            let _ = handle.shutdown().await;
            task.await.context("bot task panicked")?
        }
    };

    print_summary(&exit);

    match exit.reason {
        StopReason::Fatal(e) => bail!("engine stopped on a fatal error: {}", e),
        StopReason::TooManyErrors(n) => bail!("market data failed {} times in a row", n),
        StopReason::Shutdown | StopReason::HandleDropped => Ok(()),
    }
}

fn setup_logging(level: &str) -> Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("dipbot={}", level)))
        .context("invalid log level")?;

    let file_appender = tracing_appender::rolling::daily(LOG_DIR, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer().with_target(false);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

fn log_strategy(settings: &Settings, strategy: &StrategyConfig) {
    tracing::info!("📊 Configuration:");
    tracing::info!("  Symbol: {}", settings.symbol);
    tracing::info!("  Lookback: {} min", strategy.lookback_window.num_minutes());
    tracing::info!("  Buy dip: {}%", settings.buy_drop_pct);
    tracing::info!("  Take profit: {}%", settings.take_profit_pct);
    tracing::info!("  Stop loss: {}%", settings.stop_loss_pct);
    tracing::info!("  Trade fraction: {}", settings.trade_fraction);
    tracing::info!("  Poll interval: {}s", settings.poll_interval_secs);
}

fn build_paper(
    settings: &Settings,
    strategy: StrategyConfig,
    seed: Option<u64>,
    scenario: MarketScenario,
) -> Result<(StrategyEngine, Arc<dyn MarketData>)> {
    let seed = seed.unwrap_or_else(rand::random);
    tracing::info!(seed, ?scenario, balance = %settings.paper_balance, "📝 Paper trading mode");

    let feed = Arc::new(SyntheticFeed::new(seed, PAPER_START_PRICE).with_scenario(scenario));
    let gateway = PaperGateway::new(feed.clone(), settings.paper_balance);
    let engine = StrategyEngine::new(strategy, Box::new(gateway), settings.paper_balance)
        .context("failed to create engine")?;

    Ok((engine, feed as Arc<dyn MarketData>))
}

fn build_live(
    settings: &Settings,
    strategy: StrategyConfig,
) -> Result<(StrategyEngine, Arc<dyn MarketData>)> {
    let Some(credentials) = settings.credentials() else {
        bail!("BINANCE_API_KEY and BINANCE_API_SECRET are required outside paper mode");
    };

    if settings.testnet {
        tracing::info!("🧪 Binance testnet");
    } else {
        tracing::warn!("⚠️  Binance MAINNET - REAL MONEY AT RISK");
    }

    let client = BinanceClient::new(&settings.symbol, Some(credentials), settings.testnet)
        .context("failed to create Binance client")?
        .with_quantity_scale(strategy.quantity_scale);

    // Balance is fetched from the exchange when the engine starts
    let engine = StrategyEngine::new(strategy, Box::new(client.clone()), Decimal::ZERO)
        .context("failed to create engine")?;

    Ok((engine, Arc::new(client) as Arc<dyn MarketData>))
}

fn print_summary(exit: &BotExit) {
    let engine = &exit.engine;
    let trades = engine.trades();
    let wins = trades.iter().filter(|t| t.is_win()).count();
    let realized: Decimal = trades.iter().map(|t| t.realized_pnl()).sum();

    tracing::info!("📈 Session summary:");
    tracing::info!("  Trades: {} ({} winning)", trades.len(), wins);
    tracing::info!("  Realized PnL: {}", realized.round_dp(2));
    tracing::info!("  Available balance: {}", engine.available_balance().round_dp(2));

    if let Some(position) = engine.position() {
        tracing::warn!(
            entry = %position.entry_price,
            qty = %position.quantity,
            "Position still open at exit"
        );
    }
}
