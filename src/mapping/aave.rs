//! Aave v3 subgraph reserves.
//!
//! Rates arrive in ray units (1e27), collateral parameters in basis
//! points, and USD totals as decimal strings.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use super::{
    array_at, bounded, flex_decimal, required, scaled, MappedMarkets, MappingError, MAX_APY, MAX_RATIO,
    MAX_USD,
};
use crate::tokens;
use crate::types::{RawSourceRecord, UnifiedMarketData};

const RAY: Decimal = dec!(1_000_000_000_000_000_000_000_000_000);
const BPS: Decimal = dec!(10_000);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reserve {
    id: String,
    symbol: String,
    #[serde(default)]
    underlying_asset: Option<String>,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default, deserialize_with = "flex_decimal")]
    liquidity_rate: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    variable_borrow_rate: Option<Decimal>,
    #[serde(default, rename = "baseLTVasCollateral", deserialize_with = "flex_decimal")]
    base_ltv_as_collateral: Option<Decimal>,
    #[serde(default, deserialize_with = "flex_decimal")]
    reserve_liquidation_threshold: Option<Decimal>,
    #[serde(default, rename = "totalLiquidityUSD", deserialize_with = "flex_decimal")]
    total_liquidity_usd: Option<Decimal>,
    #[serde(default, rename = "totalVariableDebtUSD", deserialize_with = "flex_decimal")]
    total_variable_debt_usd: Option<Decimal>,
}

fn default_active() -> bool {
    true
}

pub fn normalize(
    record: &RawSourceRecord,
    payload: &serde_json::Value,
) -> Result<MappedMarkets, MappingError> {
    let reserves = array_at(payload, &["data", "reserves"])?;
    let mut mapped = MappedMarkets::default();

    for item in reserves {
        let id = item
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
            .to_string();
        let built = serde_json::from_value::<Reserve>(item.clone())
            .map_err(|e| e.to_string())
            .and_then(|r| build_market(record, r));
        mapped.push(&id, built);
    }
    Ok(mapped)
}

fn build_market(record: &RawSourceRecord, r: Reserve) -> Result<UnifiedMarketData, String> {
    if !r.is_active {
        return Err("reserve inactive".to_string());
    }
    let supply_apy = scaled(required(r.liquidity_rate, "liquidityRate")?, RAY, "liquidityRate")?;
    let supply_apy = bounded(supply_apy, "liquidityRate", MAX_APY)?;
    let borrow_apy = scaled(required(r.variable_borrow_rate, "variableBorrowRate")?, RAY, "variableBorrowRate")?;
    let borrow_apy = bounded(borrow_apy, "variableBorrowRate", MAX_APY)?;
    let collateral_factor = scaled(
        required(r.base_ltv_as_collateral, "baseLTVasCollateral")?,
        BPS,
        "baseLTVasCollateral",
    )?;
    let collateral_factor = bounded(collateral_factor, "baseLTVasCollateral", MAX_RATIO)?;
    let liquidation_threshold = scaled(
        required(r.reserve_liquidation_threshold, "reserveLiquidationThreshold")?,
        BPS,
        "reserveLiquidationThreshold",
    )?;
    let liquidation_threshold = bounded(liquidation_threshold, "reserveLiquidationThreshold", MAX_RATIO)?;
    let liquidity_usd = bounded(
        required(r.total_liquidity_usd, "totalLiquidityUSD")?,
        "totalLiquidityUSD",
        MAX_USD,
    )?;
    let total_borrowed_usd = bounded(
        r.total_variable_debt_usd.unwrap_or(Decimal::ZERO),
        "totalVariableDebtUSD",
        MAX_USD,
    )?;

    let asset_symbol = tokens::normalize_symbol(&r.symbol);
    let asset_address = r
        .underlying_asset
        .or_else(|| tokens::token_address(&asset_symbol).map(str::to_string))
        .unwrap_or_default();

    Ok(UnifiedMarketData {
        protocol_name: record.protocol_name.clone(),
        chain_id: record.chain_id,
        market_id: r.id,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{make_record, normalize_record};
    use serde_json::json;

    fn make_reserve(id: &str, symbol: &str) -> serde_json::Value {
        json!({
            "id": id,
            "symbol": symbol,
            "underlyingAsset": "0xaf88d065e77c8cc2239327c5edb3a432268e5831",
            "liquidityRate": "45000000000000000000000000",
            "variableBorrowRate": "30000000000000000000000000",
            "baseLTVasCollateral": "7500",
            "reserveLiquidationThreshold": "8000",
            "totalLiquidityUSD": "1500000.50",
            "totalVariableDebtUSD": "750000"
        })
    }

    #[test]
    fn test_ray_and_bps_conversion() {
        let record = make_record("aavev3", json!({"data": {"reserves": [make_reserve("r1", "USDC")]}}));
        let mapped = normalize_record(&record).unwrap();
        assert_eq!(mapped.markets.len(), 1);
        let m = &mapped.markets[0];
        assert_eq!(m.supply_apy, dec!(0.045));
        assert_eq!(m.borrow_apy, dec!(0.03));
        assert_eq!(m.collateral_factor, dec!(0.75));
        assert_eq!(m.liquidation_threshold, dec!(0.8));
        assert_eq!(m.liquidity_usd, dec!(1500000.50));
        assert_eq!(m.total_borrowed_usd, dec!(750000));
        assert_eq!(m.asset_symbol, "USDC");
        assert_eq!(m.market_id, "r1");
        assert_eq!(m.last_updated_at, record.collection_time);
    }

    #[test]
    fn test_receipt_symbol_normalised() {
        let record = make_record("aavev3", json!({"data": {"reserves": [make_reserve("r1", "aArbUSDCn")]}}));
        let mapped = normalize_record(&record).unwrap();
        assert_eq!(mapped.markets[0].asset_symbol, "USDC");
    }

    #[test]
    fn test_incomplete_reserve_skipped() {
        let mut broken = make_reserve("r2", "WETH");
        broken.as_object_mut().unwrap().remove("variableBorrowRate");
        let record = make_record(
            "aavev3",
            json!({"data": {"reserves": [make_reserve("r1", "USDC"), broken]}}),
        );
        let mapped = normalize_record(&record).unwrap();
        assert_eq!(mapped.markets.len(), 1);
        assert_eq!(mapped.skipped.len(), 1);
        assert_eq!(mapped.skipped[0].0, "r2");
        assert!(mapped.skipped[0].1.contains("variableBorrowRate"));
    }

    #[test]
    fn test_inactive_reserve_skipped() {
        let mut inactive = make_reserve("r1", "USDC");
        inactive["isActive"] = json!(false);
        let record = make_record("aavev3", json!({"data": {"reserves": [inactive]}}));
        let mapped = normalize_record(&record).unwrap();
        assert!(mapped.markets.is_empty());
        assert_eq!(mapped.skipped.len(), 1);
    }

    #[test]
    fn test_negative_rate_skipped() {
        let mut reserve = make_reserve("r3", "USDC");
        reserve["liquidityRate"] = json!("-45000000000000000000000000");
        let record = make_record("aavev3", json!({"data": {"reserves": [reserve]}}));
        let mapped = normalize_record(&record).unwrap();
        assert!(mapped.markets.is_empty());
        assert!(mapped.skipped[0].1.starts_with("negative liquidityRate"));
    }

    #[test]
    fn test_missing_reserves_is_malformed() {
        let record = make_record("aavev3", json!({"errors": [{"message": "indexer down"}]}));
        assert!(matches!(normalize_record(&record), Err(MappingError::Malformed(_))));
    }
}
