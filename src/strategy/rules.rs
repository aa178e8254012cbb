use rust_decimal::{Decimal, RoundingStrategy};

use super::StrategyConfig;
use crate::execution::Position;
use crate::models::ExitReason;

/// Fractional drop of `latest` below `high` (negative when above)
pub fn dip_pct(latest: Decimal, high: Decimal) -> Decimal {
    if high.is_zero() {
        return Decimal::ZERO;
    }
    (high - latest) / high
}

/// Entry rule: latest <= high * (1 - buy_dip_pct)
pub fn is_dip(latest: Decimal, high: Decimal, config: &StrategyConfig) -> bool {
    config
        .entry_trigger(high)
        .is_some_and(|trigger| latest <= trigger)
}

/// Automatic exit rule, stop loss checked first
pub fn exit_reason(latest: Decimal, position: &Position) -> Option<ExitReason> {
    if latest <= position.stop_loss_price {
        return Some(ExitReason::StopLoss);
    }
    if latest >= position.take_profit_price {
        return Some(ExitReason::TakeProfit);
    }
    None
}

/// Base quantity purchasable with `budget` at `price`, truncated to `scale` decimals
pub fn order_quantity(budget: Decimal, price: Decimal, scale: u32) -> Decimal {
    budget
        .checked_div(price)
        .map(|qty| qty.round_dp_with_strategy(scale, RoundingStrategy::ToZero))
        .unwrap_or(Decimal::ZERO)
}
