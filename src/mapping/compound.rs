//! Compound v3 via a Portals-style token list.
//!
//! APYs and utilization are percent strings (`"4.2"` = 4.2%), liquidity
//! is USD, collateral parameters are already ratios. Borrowed USD is not
//! reported and is derived from utilization.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use super::{
    array_at, bounded, flex_decimal, required, scaled, MappedMarkets, MappingError, MAX_APY, MAX_RATIO,
    MAX_USD,
};
use crate::tokens;
use crate::types::{RawSourceRecord, UnifiedMarketData};

const PERCENT: Decimal = dec!(100);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalsToken {
    key: String,
    symbol: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    underlying_symbol: Option<String>,
    #[serde(default, deserialize_with = "flex_decimal")]
    liquidity: Option<Decimal>,
    #[serde(default)]
    metrics: Option<Metrics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metrics {
    #[serde(default, deserialize_with = "flex_decimal")]
    apy: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    borrow_apy: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    utilization: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    collateral_factor: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    liquidation_threshold: Option<Decimal>,
}

pub fn normalize(
    record: &RawSourceRecord,
    payload: &serde_json::Value,
) -> Result<MappedMarkets, MappingError> {
    let items = array_at(payload, &["tokens"])?;
    let mut mapped = MappedMarkets::default();

    for item in items {
        let id = item
            .get("key")
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
            .to_string();
        let built = serde_json::from_value::<PortalsToken>(item.clone())
            .map_err(|e| e.to_string())
            .and_then(|t| build_market(record, t));
        mapped.push(&id, built);
    }
    Ok(mapped)
}

fn build_market(record: &RawSourceRecord, t: PortalsToken) -> Result<UnifiedMarketData, String> {
    let metrics = t.metrics.ok_or("missing metrics")?;
    let supply_apy = scaled(required(metrics.apy, "metrics.apy")?, PERCENT, "metrics.apy")?;
    let supply_apy = bounded(supply_apy, "metrics.apy", MAX_APY)?;
    let borrow_apy = scaled(required(metrics.borrow_apy, "metrics.borrowApy")?, PERCENT, "metrics.borrowApy")?;
    let borrow_apy = bounded(borrow_apy, "metrics.borrowApy", MAX_APY)?;
    let collateral_factor = bounded(
        required(metrics.collateral_factor, "metrics.collateralFactor")?,
        "metrics.collateralFactor",
        MAX_RATIO,
    )?;
    // Without a threshold the margin is treated as zero.
    let liquidation_threshold = match metrics.liquidation_threshold {
        Some(lt) => bounded(lt, "metrics.liquidationThreshold", MAX_RATIO)?,
        None => collateral_factor,
    };
    let liquidity_usd = bounded(required(t.liquidity, "liquidity")?, "liquidity", MAX_USD)?;
    let utilization = scaled(
        metrics.utilization.unwrap_or(Decimal::ZERO),
        PERCENT,
        "metrics.utilization",
    )?;
    let utilization = bounded(utilization, "metrics.utilization", MAX_RATIO)?;
    let total_borrowed_usd = liquidity_usd
        .checked_mul(utilization)
        .ok_or_else(|| format!("borrowed USD overflows: {liquidity_usd} * {utilization}"))?;

    let asset_symbol = match t.underlying_symbol {
        Some(s) => tokens::normalize_symbol(&s),
        None => tokens::underlying_asset(&t.symbol)
            .map(str::to_string)
            .ok_or_else(|| format!("cannot resolve underlying of {}", t.symbol))?,
    };
    let asset_address = tokens::token_address(&asset_symbol)
        .map(str::to_string)
        .or(t.address)
        .unwrap_or_default();

    Ok(UnifiedMarketData {
        protocol_name: record.protocol_name.clone(),
        chain_id: record.chain_id,
        market_id: t.key,
        asset_symbol,
        asset_address,
        supply_apy,
        supply_apy_net: supply_apy,
        borrow_apy,
        borrow_apy_net: borrow_apy,
        liquidity_usd,
        total_borrowed_usd,
        collateral_factor,
        liquidation_threshold,
        utilization_rate: Decimal::ZERO,
        last_updated_at: record.collection_time,
        transaction_cost_estimate_usd: Decimal::ZERO,
    })
}
