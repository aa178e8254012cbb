use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};

use crate::error::ExecutionError;
use crate::feed::SyntheticFeed;
use crate::models::Fill;

/// Boundary to the venue that executes market orders
///
/// Implementations must not retry orders on their own; a failed call is reported back and
/// the next tick decides what happens.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn place_market_buy(&self, quantity: Decimal) -> Result<Fill, ExecutionError>;

    async fn place_market_sell(&self, quantity: Decimal) -> Result<Fill, ExecutionError>;

    /// Free quote-currency balance available for new entries
    async fn fetch_balance(&self) -> Result<Decimal, ExecutionError>;

    fn name(&self) -> &str;
}

#[derive(Debug)]
struct PaperAccount {
    quote: Decimal,
    base: Decimal,
}

/// Simulated venue for paper trading
///
/// Fills every order at the synthetic feed's current price and keeps a simulated
/// quote/base balance.
#[derive(Clone)]
pub struct PaperGateway {
    feed: Arc<SyntheticFeed>,
    account: Arc<Mutex<PaperAccount>>,
}

impl PaperGateway {
    pub fn new(feed: Arc<SyntheticFeed>, starting_balance: Decimal) -> Self {
        Self {
            feed,
            account: Arc::new(Mutex::new(PaperAccount {
                quote: starting_balance,
                base: Decimal::ZERO,
            })),
        }
    }

    /// Simulated base-asset holdings
    pub fn base_balance(&self) -> Result<Decimal, ExecutionError> {
        Ok(self.account()?.base)
    }

    fn account(&self) -> Result<std::sync::MutexGuard<'_, PaperAccount>, ExecutionError> {
        self.account
            .lock()
            .map_err(|e| ExecutionError::ConnectionError(e.to_string()))
    }

    fn fill_price(&self) -> Result<Decimal, ExecutionError> {
        self.feed
            .current_price()
            .map_err(|e| ExecutionError::ConnectionError(e.to_string()))
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn place_market_buy(&self, quantity: Decimal) -> Result<Fill, ExecutionError> {
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::OrderRejected(format!(
                "invalid quantity {}",
                quantity
            )));
        }

        let price = self.fill_price()?;
        let cost = price * quantity;

        let mut account = self.account()?;
        if cost > account.quote {
            return Err(ExecutionError::OrderRejected(format!(
                "insufficient balance: need {:.2}, have {:.2}",
                cost, account.quote
            )));
        }

        account.quote -= cost;
        account.base += quantity;

        tracing::debug!(price = %price, qty = %quantity, "Paper buy filled");
        Ok(Fill::new(price, quantity))
    }

    async fn place_market_sell(&self, quantity: Decimal) -> Result<Fill, ExecutionError> {
        let price = self.fill_price()?;

        let mut account = self.account()?;
        if quantity <= Decimal::ZERO || quantity > account.base {
            return Err(ExecutionError::OrderRejected(format!(
                "cannot sell {} (holding {})",
                quantity, account.base
            )));
        }

        account.base -= quantity;
        account.quote += price * quantity;

        tracing::debug!(price = %price, qty = %quantity, "Paper sell filled");
        Ok(Fill::new(price, quantity))
    }

    async fn fetch_balance(&self) -> Result<Decimal, ExecutionError> {
        Ok(self.account()?.quote)
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MarketData;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn gateway(balance: Decimal) -> (Arc<SyntheticFeed>, PaperGateway) {
        let feed = Arc::new(SyntheticFeed::new(7, dec!(100)));
        let gateway = PaperGateway::new(feed.clone(), balance);
        (feed, gateway)
    }

    #[tokio::test]
    async fn test_paper_round_trip() {
        let (feed, gateway) = gateway(dec!(1000));

        let buy = assert_ok!(gateway.place_market_buy(dec!(2)).await);
        assert_eq!(buy.price, dec!(100));
        assert_eq!(buy.quantity, dec!(2));
        assert_eq!(gateway.fetch_balance().await.unwrap(), dec!(800));
        assert_eq!(gateway.base_balance().unwrap(), dec!(2));

        let next = feed.latest_price().await.unwrap();
        let sell = assert_ok!(gateway.place_market_sell(dec!(2)).await);
        assert_eq!(sell.price, next);
        assert_eq!(
            gateway.fetch_balance().await.unwrap(),
            dec!(800) + next * dec!(2)
        );
        assert_eq!(gateway.base_balance().unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_paper_rejects_oversized_buy() {
        let (_feed, gateway) = gateway(dec!(50));

        let result = gateway.place_market_buy(dec!(1)).await;
        assert!(matches!(result, Err(ExecutionError::OrderRejected(_))));
        assert_eq!(gateway.fetch_balance().await.unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn test_paper_rejects_sell_without_holdings() {
        let (_feed, gateway) = gateway(dec!(1000));

        let err = assert_err!(gateway.place_market_sell(dec!(1)).await);
        assert!(matches!(err, ExecutionError::OrderRejected(_)));
    }
}
