//! Position accounting.
//!
//! Opens positions from confirmed entries, accrues interest between
//! tracking passes and recomputes live metrics. All functions are pure:
//! "now" is always the agreed observation time passed in by the caller.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::types::{
    ActivePosition, ArbitrageOpportunity, MarketKey, TxIntent, UnifiedMarketData,
    MAX_HEALTH_FACTOR,
};

const SECONDS_PER_YEAR: i64 = 31_536_000;

/// Deterministic id for a position opened in `cycle_id` on a pair.
pub fn position_id(cycle_id: u64, supply: &MarketKey, borrow: &MarketKey) -> String {
    let digest = Sha256::digest(format!("{cycle_id}|{supply}|{borrow}").as_bytes());
    hex::encode(&digest[..8])
}

pub fn health_factor(supplied: Decimal, borrowed: Decimal, liquidation_threshold: Decimal) -> Decimal {
    if borrowed <= Decimal::ZERO {
        return MAX_HEALTH_FACTOR;
    }
    (supplied * liquidation_threshold / borrowed).min(MAX_HEALTH_FACTOR)
}

pub fn ltv(supplied: Decimal, borrowed: Decimal) -> Decimal {
    if supplied <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    borrowed / supplied
}

/// A new position on `target` carrying the intent's amounts.
pub fn open_position(
    position_id: String,
    intent: &TxIntent,
    target: &ArbitrageOpportunity,
    nonce: Option<u64>,
    now: DateTime<Utc>,
) -> ActivePosition {
    let supplied = intent.supply_amount_usd;
    let borrowed = intent.borrow_amount_usd;
    ActivePosition {
        position_id,
        supply_protocol: target.supply_protocol.clone(),
        supply_market_id: target.supply_market_id.clone(),
        supply_asset: target.supply_asset.clone(),
        supplied_amount: supplied,
        borrow_protocol: target.borrow_protocol.clone(),
        borrow_market_id: target.borrow_market_id.clone(),
        borrow_asset: target.borrow_asset.clone(),
        borrowed_amount: borrowed,
        entry_apy: target.net_estimated_apy,
        current_apy: target.supply_apy - target.borrow_apy,
        health_factor: MAX_HEALTH_FACTOR,
        ltv: ltv(supplied, borrowed),
        pnl_usd: Decimal::ZERO,
        external_tx_nonce: nonce,
        opened_at: now,
        last_updated_at: now,
        below_min_apy_since: None,
    }
}

/// Accrue interest since the last update and refresh the live metrics
/// from this cycle's market data.
pub fn refresh(
    position: &mut ActivePosition,
    supply: &UnifiedMarketData,
    borrow: &UnifiedMarketData,
    now: DateTime<Utc>,
    min_net_apy: Decimal,
) {
    let elapsed = (now - position.last_updated_at).num_seconds().max(0);
    if elapsed > 0 {
        let years = Decimal::from(elapsed) / Decimal::from(SECONDS_PER_YEAR);
        let earned = position.supplied_amount * supply.supply_apy_net * years;
        let owed = position.borrowed_amount * borrow.borrow_apy_net * years;
        position.supplied_amount += earned;
        position.borrowed_amount += owed;
        position.pnl_usd += earned - owed;
    }

    position.current_apy = supply.supply_apy_net - borrow.borrow_apy_net;
    position.ltv = ltv(position.supplied_amount, position.borrowed_amount);
    position.health_factor = health_factor(
        position.supplied_amount,
        position.borrowed_amount,
        supply.liquidation_threshold,
    );
    position.below_min_apy_since = if position.current_apy < min_net_apy {
        position.below_min_apy_since.or(Some(now))
    } else {
        None
    };
    position.last_updated_at = now;
}
