//! Fluid lending API.
//!
//! Rates and collateral parameters are basis points; the asset is the
//! nested `asset` object, the market id the fToken address.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use super::{
    array_at, bounded, flex_decimal, required, scaled, MappedMarkets, MappingError, MAX_APY, MAX_RATIO,
    MAX_USD,
};
use crate::tokens;
use crate::types::{RawSourceRecord, UnifiedMarketData};

const BPS: Decimal = dec!(10_000);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FluidToken {
    address: String,
    symbol: String,
    #[serde(default)]
    asset: Option<FluidAsset>,
    #[serde(default, deserialize_with = "flex_decimal")]
    supply_rate: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    borrow_rate: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    total_assets_usd: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    total_borrow_usd: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    collateral_factor: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    liquidation_threshold: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct FluidAsset {
    address: String,
    symbol: String,
}

pub fn normalize(
    record: &RawSourceRecord,
    payload: &serde_json::Value,
) -> Result<MappedMarkets, MappingError> {
    let items = array_at(payload, &["data"])?;
    let mut mapped = MappedMarkets::default();

    for item in items {
        let id = item
            .get("address")
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
            .to_string();
        let built = serde_json::from_value::<FluidToken>(item.clone())
            .map_err(|e| e.to_string())
            .and_then(|t| build_market(record, t));
        mapped.push(&id, built);
    }
    Ok(mapped)
}

fn build_market(record: &RawSourceRecord, t: FluidToken) -> Result<UnifiedMarketData, String> {
    let supply_apy = scaled(required(t.supply_rate, "supplyRate")?, BPS, "supplyRate")?;
    let supply_apy = bounded(supply_apy, "supplyRate", MAX_APY)?;
    let borrow_apy = scaled(required(t.borrow_rate, "borrowRate")?, BPS, "borrowRate")?;
    let borrow_apy = bounded(borrow_apy, "borrowRate", MAX_APY)?;
    let collateral_factor = scaled(required(t.collateral_factor, "collateralFactor")?, BPS, "collateralFactor")?;
    let collateral_factor = bounded(collateral_factor, "collateralFactor", MAX_RATIO)?;
    let liquidation_threshold = scaled(
        required(t.liquidation_threshold, "liquidationThreshold")?,
        BPS,
        "liquidationThreshold",
    )?;
    let liquidation_threshold = bounded(liquidation_threshold, "liquidationThreshold", MAX_RATIO)?;
    let liquidity_usd = bounded(required(t.total_assets_usd, "totalAssetsUsd")?, "totalAssetsUsd", MAX_USD)?;
    let total_borrowed_usd = bounded(
        t.total_borrow_usd.unwrap_or(Decimal::ZERO),
        "totalBorrowUsd",
        MAX_USD,
    )?;

    let (asset_symbol, asset_address) = match t.asset {
        Some(a) => (tokens::normalize_symbol(&a.symbol), a.address),
        None => {
            let symbol = tokens::underlying_asset(&t.symbol)
                .ok_or_else(|| format!("cannot resolve underlying of {}", t.symbol))?;
            let address = tokens::token_address(symbol).unwrap_or_default();
            (symbol.to_string(), address.to_string())
        }
    };

    Ok(UnifiedMarketData {
        protocol_name: record.protocol_name.clone(),
        chain_id: record.chain_id,
        market_id: t.address,
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
