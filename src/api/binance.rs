use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::error::{ConfigError, ExecutionError, FeedError};
use crate::execution::ExecutionGateway;
use crate::feed::MarketData;
use crate::models::{Fill, TradeSide};

// Spot REST API
// Docs: https://developers.binance.com/docs/binance-spot-api-docs/rest-api
pub const BINANCE_API_BASE: &str = "https://api.binance.com";
pub const BINANCE_TESTNET_BASE: &str = "https://testnet.binance.vision";

const REQUESTS_PER_MINUTE: NonZeroU32 = match NonZeroU32::new(600) {
    Some(n) => n,
    None => unreachable!(),
};
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
const RECV_WINDOW_MS: u64 = 5000;
const REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_QUANTITY_SCALE: u32 = 5;

type HmacSha256 = Hmac<Sha256>;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// API key pair. Debug output never shows the secret.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Hex HMAC-SHA256 of `payload` keyed with the API secret
    pub fn sign(&self, payload: &str) -> Result<String, ExecutionError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExecutionError::OrderRejected(format!("invalid API secret: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .finish()
    }
}

/// Trading pair such as `BTC/USDT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn parse(symbol: &str) -> Result<Self, ConfigError> {
        let (base, quote) = symbol
            .split_once('/')
            .ok_or_else(|| ConfigError::Invalid(format!("symbol '{}' must look like BTC/USDT", symbol)))?;

        let base = base.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        if base.is_empty() || quote.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "symbol '{}' must look like BTC/USDT",
                symbol
            )));
        }

        Ok(Self { base, quote })
    }

    /// Exchange pair name, e.g. `BTCUSDT`
    pub fn pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    status: String,
    executed_qty: Decimal,
    cummulative_quote_qty: Decimal,
    #[serde(default)]
    fills: Vec<OrderFill>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderFill {
    price: Decimal,
    qty: Decimal,
    #[serde(default)]
    commission: Decimal,
    #[serde(default)]
    commission_asset: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: Decimal,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

impl OrderResponse {
    /// Average fill price and the base quantity the account actually gained or gave up
    ///
    /// Commission charged in `base_asset` is deducted from a BUY, and the net quantity is
    /// truncated to `quantity_scale` so that a later SELL of it never exceeds the free balance.
    fn into_fill(
        self,
        side: TradeSide,
        base_asset: &str,
        quantity_scale: u32,
    ) -> Result<Fill, ExecutionError> {
        match (self.status.as_str(), side) {
            ("FILLED", _) | ("PARTIALLY_FILLED", TradeSide::Buy) => {}
            // Base asset would be left on the venue with no position tracking it
            ("PARTIALLY_FILLED", TradeSide::Sell) => {
                return Err(ExecutionError::OrderRejected(format!(
                    "order {} sold only {}",
                    self.order_id, self.executed_qty
                )));
            }
            (status, _) => {
                return Err(ExecutionError::OrderRejected(format!(
                    "order {} finished with status {}",
                    self.order_id, status
                )));
            }
        }
        if self.executed_qty <= Decimal::ZERO {
            return Err(ExecutionError::OrderRejected(format!(
                "order {} executed nothing",
                self.order_id
            )));
        }

        let price = if self.cummulative_quote_qty > Decimal::ZERO {
            self.cummulative_quote_qty / self.executed_qty
        } else {
            // Older responses only carry per-fill prices
            let (notional, qty) = self
                .fills
                .iter()
                .fold((Decimal::ZERO, Decimal::ZERO), |(n, q), f| {
                    (n + f.price * f.qty, q + f.qty)
                });
            if qty.is_zero() {
                return Err(ExecutionError::OrderRejected(format!(
                    "order {} has no fill price",
                    self.order_id
                )));
            }
            notional / qty
        };

        let quantity = match side {
            TradeSide::Buy => {
                let fee: Decimal = self
                    .fills
                    .iter()
                    .filter(|f| f.commission_asset.eq_ignore_ascii_case(base_asset))
                    .map(|f| f.commission)
                    .sum();
                (self.executed_qty - fee)
                    .round_dp_with_strategy(quantity_scale, RoundingStrategy::ToZero)
            }
            TradeSide::Sell => self.executed_qty,
        };
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::OrderRejected(format!(
                "order {} left nothing after fees",
                self.order_id
            )));
        }

        Ok(Fill::new(price, quantity))
    }
}

// ============== Client ==============

/// Binance spot client: ticker prices, signed market orders and balances
///
/// Market data requests retry with backoff. Orders are sent exactly once.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    symbol: Symbol,
    credentials: Option<Credentials>,
    rate_limiter: Arc<BinanceRateLimiter>,
    quantity_scale: u32,
}

impl BinanceClient {
    pub fn new(
        symbol: &str,
        credentials: Option<Credentials>,
        testnet: bool,
    ) -> Result<Self, ConfigError> {
        let base_url = if testnet {
            BINANCE_TESTNET_BASE
        } else {
            BINANCE_API_BASE
        };
        Self::with_base_url(symbol, credentials, base_url)
    }

    /// Client against an arbitrary REST endpoint
    pub fn with_base_url(
        symbol: &str,
        credentials: Option<Credentials>,
        base_url: &str,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            symbol: Symbol::parse(symbol)?,
            credentials,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(REQUESTS_PER_MINUTE))),
            quantity_scale: DEFAULT_QUANTITY_SCALE,
        })
    }

    /// Decimal places kept on filled base quantities (the pair's lot step)
    pub fn with_quantity_scale(mut self, scale: u32) -> Self {
        self.quantity_scale = scale;
        self
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Last traded price of the configured pair
    pub async fn get_price(&self) -> Result<Decimal, FeedError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url,
            self.symbol.pair()
        );

        let mut last_error = None;
        for attempt in 1..=MAX_RETRIES {
            match self.fetch_price_once(&url).await {
                Ok(price) => return Ok(price),
                Err(RequestFailure::Permanent(e)) => return Err(e),
                Err(RequestFailure::Transient(e)) => {
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1);
                        tracing::warn!(
                            "Price request failed: {}, retrying in {}ms (attempt {}/{})",
                            e,
                            backoff_ms,
                            attempt,
                            MAX_RETRIES
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FeedError::Request("no attempts made".into())))
    }

    async fn fetch_price_once(&self, url: &str) -> Result<Decimal, RequestFailure> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RequestFailure::Transient(e.into()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(RequestFailure::Transient(FeedError::Request(format!(
                "HTTP {}",
                status
            ))));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestFailure::Permanent(FeedError::Request(format!(
                "HTTP {}: {}",
                status, body
            ))));
        }

        let ticker: TickerPrice = response
            .json()
            .await
            .map_err(|e| RequestFailure::Permanent(FeedError::Parse(e.to_string())))?;

        if ticker.price <= Decimal::ZERO {
            return Err(RequestFailure::Permanent(FeedError::Parse(format!(
                "non-positive price {}",
                ticker.price
            ))));
        }

        Ok(ticker.price)
    }

    /// Submit a MARKET order. Never retried.
    pub async fn place_market_order(
        &self,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<Fill, ExecutionError> {
        let side_param = match side {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        };
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&newOrderRespType=FULL",
            self.symbol.pair(),
            side_param,
            quantity.normalize()
        );

        tracing::info!(
            symbol = %self.symbol,
            side = side_param,
            qty = %quantity,
            "Submitting market order"
        );

        let response = self.signed_request(reqwest::Method::POST, "/api/v3/order", &params).await?;
        let order: OrderResponse = response
            .json()
            .await
            .map_err(|e| ExecutionError::ConnectionError(format!("unreadable order response: {}", e)))?;

        let order_id = order.order_id;
        let fill = order.into_fill(side, &self.symbol.base, self.quantity_scale)?;
        tracing::info!(
            order_id,
            side = side_param,
            price = %fill.price,
            qty = %fill.quantity,
            "Market order filled"
        );
        Ok(fill)
    }

    /// Free balance of `asset`
    pub async fn get_free_balance(&self, asset: &str) -> Result<Decimal, ExecutionError> {
        let response = self
            .signed_request(reqwest::Method::GET, "/api/v3/account", "omitZeroBalances=true")
            .await?;
        let account: AccountResponse = response
            .json()
            .await
            .map_err(|e| ExecutionError::ConnectionError(format!("unreadable account response: {}", e)))?;

        Ok(account
            .balances
            .into_iter()
            .find(|b| b.asset.eq_ignore_ascii_case(asset))
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<reqwest::Response, ExecutionError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ExecutionError::OrderRejected("API key and secret are required".to_string())
        })?;

        let query = format!(
            "{}&recvWindow={}&timestamp={}",
            params,
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        );
        let signature = credentials.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", credentials.api_key())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| format!("{} ({})", e.msg, e.code))
                .unwrap_or(body);
            return Err(ExecutionError::OrderRejected(message));
        }

        Err(ExecutionError::ConnectionError(format!(
            "HTTP {}: {}",
            status, body
        )))
    }
}

enum RequestFailure {
    Transient(FeedError),
    Permanent(FeedError),
}

#[async_trait]
impl MarketData for BinanceClient {
    async fn latest_price(&self) -> Result<Decimal, FeedError> {
        self.get_price().await
    }

    fn source(&self) -> &str {
        "binance"
    }
}

#[async_trait]
impl ExecutionGateway for BinanceClient {
    async fn place_market_buy(&self, quantity: Decimal) -> Result<Fill, ExecutionError> {
        self.place_market_order(TradeSide::Buy, quantity).await
    }

    async fn place_market_sell(&self, quantity: Decimal) -> Result<Fill, ExecutionError> {
        self.place_market_order(TradeSide::Sell, quantity).await
    }

    async fn fetch_balance(&self) -> Result<Decimal, ExecutionError> {
        self.get_free_balance(&self.symbol.quote).await
    }

    fn name(&self) -> &str {
        if self.base_url == BINANCE_TESTNET_BASE {
            "binance-testnet"
        } else {
            "binance"
        }
    }
}
