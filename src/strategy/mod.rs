//! Strategy layer: opportunity ranking, capital allocation, position
//! accounting, and rebalancing.
//!
//! Everything in here is pure. Rounds hand in market data, positions and
//! the agreed observation time, and get plain values back, so every
//! participant computes the same payload from the same shared state.

pub mod allocation;
pub mod opportunity;
pub mod positions;
pub mod rebalance;
pub mod risk;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const DAYS_PER_YEAR: Decimal = dec!(365);

/// Spread a one-off cost over the holding period and express it as an
/// annual rate on `capital`.
///
/// Zero when either capital or the holding period is non-positive, `None`
/// when the rate does not fit in a `Decimal`.
pub fn annualized_cost(cost: Decimal, capital: Decimal, holding_period_days: Decimal) -> Option<Decimal> {
    if capital <= Decimal::ZERO || holding_period_days <= Decimal::ZERO {
        return Some(Decimal::ZERO);
    }
    cost.checked_div(capital)?
        .checked_mul(DAYS_PER_YEAR)?
        .checked_div(holding_period_days)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
