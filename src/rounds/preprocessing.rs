//! Preprocessing: validate raw records, normalize them into
//! `UnifiedMarketData`, and enrich with fees and cost estimates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{smallest_digest, RoundContext};
use crate::config::{ConsensusConfig, PreprocessingConfig};
use crate::engine::consensus::{ParticipantId, Reduction};
use crate::engine::{Round, RoundError};
use crate::mapping::{self, MappingError};
use crate::state::{DropReason, DroppedRecord, PreprocessingSlice, PreprocessingStatus, SharedState};
use crate::types::{Event, PipelineError, RawSourceRecord, RoundKind, UnifiedMarketData};

const GWEI: Decimal = dec!(0.000000001);
const BPS: Decimal = dec!(10000);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingPayload {
    pub observed_at: DateTime<Utc>,
    pub gas_price_gwei: Decimal,
}

pub struct PreprocessingRound {
    ctx: Arc<RoundContext>,
}

impl PreprocessingRound {
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        Self { ctx }
    }
}

// ---------------------------------------------------------------------------
// Pure steps
// ---------------------------------------------------------------------------

/// Output of one preprocessing pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preprocessed {
    pub markets: Vec<UnifiedMarketData>,
    pub dropped: Vec<DroppedRecord>,
    pub records_used: usize,
}

/// Validate and normalize every record, then enrich and sort the markets.
pub fn preprocess(
    records: &[RawSourceRecord],
    cfg: &PreprocessingConfig,
    observed_at: DateTime<Utc>,
    gas_price_gwei: Decimal,
) -> Preprocessed {
    let threshold = cfg.stale_data_threshold();
    let mut out = Preprocessed::default();

    for record in records {
        let drop = |reason: DropReason| DroppedRecord {
            protocol_name: record.protocol_name.clone(),
            reason,
        };

        if !record.is_success() {
            debug!(protocol = %record.protocol_name, "Dropping failed source");
            out.dropped.push(drop(DropReason::SourceFailed));
            continue;
        }
        if record.is_stale(observed_at, threshold) {
            let age_secs = record.age_at(observed_at).num_seconds();
            warn!(protocol = %record.protocol_name, age_secs, "Dropping stale record");
            out.dropped.push(drop(DropReason::Stale { age_secs }));
            continue;
        }

        let mapped = match mapping::normalize_record(record) {
            Ok(mapped) => mapped,
            Err(MappingError::UnsupportedProtocol(name)) => {
                let failure = PipelineError::SourceFailure {
                    source_name: name,
                    message: "unsupported protocol".into(),
                };
                warn!("{failure}");
                out.dropped.push(drop(DropReason::UnsupportedProtocol));
                continue;
            }
            Err(e) => {
                warn!(protocol = %record.protocol_name, error = %e, "Dropping malformed record");
                out.dropped.push(drop(DropReason::Malformed(e.to_string())));
                continue;
            }
        };

        for (market_id, reason) in mapped.skipped {
            debug!(protocol = %record.protocol_name, market_id = %market_id, reason = %reason, "Skipping market");
            out.dropped.push(drop(DropReason::MarketSkipped { market_id, reason }));
        }
        out.records_used += 1;
        for market in mapped.markets {
            let market_id = market.market_id.clone();
            match enrich(market, cfg, gas_price_gwei) {
                Ok(market) => out.markets.push(market),
                Err(reason) => {
                    warn!(protocol = %record.protocol_name, market_id = %market_id, reason = %reason, "Dropping market");
                    out.dropped.push(drop(DropReason::MarketSkipped { market_id, reason }));
                }
            }
        }
    }

    out.markets.sort_by(|a, b| {
        (&a.protocol_name, a.chain_id, &a.market_id).cmp(&(&b.protocol_name, b.chain_id, &b.market_id))
    });
    out
}

/// Apply the protocol's fee, utilization, and transaction cost estimate.
/// `Err` names the quantity that overflowed.
pub fn enrich(
    mut market: UnifiedMarketData,
    cfg: &PreprocessingConfig,
    gas_price_gwei: Decimal,
) -> Result<UnifiedMarketData, String> {
    let costs = cfg.costs_for(&market.protocol_name);
    market.supply_apy_net = market
        .supply_apy
        .checked_sub(costs.fee)
        .ok_or("net supply APY overflows")?;
    market.borrow_apy_net = market
        .borrow_apy
        .checked_add(costs.fee)
        .ok_or("net borrow APY overflows")?;
    market.utilization_rate = if market.liquidity_usd > Decimal::ZERO {
        market
            .total_borrowed_usd
            .checked_div(market.liquidity_usd)
            .ok_or("utilization overflows")?
    } else {
        Decimal::ZERO
    };

    let gas_usd = Decimal::from(costs.gas_units)
        .checked_mul(gas_price_gwei)
        .and_then(|v| v.checked_mul(GWEI))
        .and_then(|v| v.checked_mul(cfg.native_price_usd))
        .and_then(|v| v.checked_mul(costs.gas_multiplier))
        .ok_or("gas cost overflows")?;
    let slippage_usd = (costs.slippage_bps / BPS)
        .checked_mul(cfg.reference_trade_usd)
        .ok_or("slippage cost overflows")?;
    market.transaction_cost_estimate_usd = gas_usd
        .checked_add(slippage_usd)
        .ok_or("transaction cost overflows")?;
    Ok(market)
}

/// Summary statistics over net supply APY, logged once per pass.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketStats {
    pub count: usize,
    pub mean_supply_apy: Decimal,
    pub median_supply_apy: Decimal,
    pub min_supply_apy: Decimal,
    pub max_supply_apy: Decimal,
    pub total_liquidity_usd: Decimal,
}

pub fn market_stats(markets: &[UnifiedMarketData]) -> Option<MarketStats> {
    if markets.is_empty() {
        return None;
    }
    let mut apys: Vec<Decimal> = markets.iter().map(|m| m.supply_apy_net).collect();
    apys.sort();
    let n = apys.len();
    let median = if n % 2 == 0 {
        (apys[n / 2 - 1] + apys[n / 2]) / dec!(2)
    } else {
        apys[n / 2]
    };
    Some(MarketStats {
        count: n,
        mean_supply_apy: apys.iter().copied().sum::<Decimal>() / Decimal::from(n),
        median_supply_apy: median,
        min_supply_apy: apys[0],
        max_supply_apy: apys[n - 1],
        total_liquidity_usd: markets.iter().map(|m| m.liquidity_usd).sum(),
    })
}

// ---------------------------------------------------------------------------
// Round
// ---------------------------------------------------------------------------

#[async_trait]
impl Round for PreprocessingRound {
    type Payload = PreprocessingPayload;
    type Slice = PreprocessingSlice;

    const KIND: RoundKind = RoundKind::Preprocessing;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction {
        smallest_digest(consensus)
    }

    async fn propose(
        &self,
        participant: ParticipantId,
        _state: &SharedState,
    ) -> Result<PreprocessingPayload, RoundError> {
        let gas_price_gwei = match self.ctx.gas.gas_quote().await {
            Ok(quote) => quote.gas_price_gwei,
            Err(e) => {
                let fallback = self.ctx.config.preprocessing.static_gas_price_gwei;
                warn!(participant = %participant, error = %e, fallback = %fallback, "Gas oracle failed, using static gas price");
                fallback
            }
        };
        Ok(PreprocessingPayload {
            observed_at: self.ctx.clock.now(),
            gas_price_gwei,
        })
    }

    fn apply(
        &self,
        state: &SharedState,
        payload: &PreprocessingPayload,
    ) -> Result<(PreprocessingSlice, Event), RoundError> {
        let cfg = &self.ctx.config.preprocessing;
        let records = &state.collection().raw_market_data_sources;
        let out = preprocess(records, cfg, payload.observed_at, payload.gas_price_gwei);

        if let Some(stats) = market_stats(&out.markets) {
            info!(
                markets = stats.count,
                mean_apy = %stats.mean_supply_apy.round_dp(6),
                median_apy = %stats.median_supply_apy.round_dp(6),
                min_apy = %stats.min_supply_apy,
                max_apy = %stats.max_supply_apy,
                total_liquidity_usd = %stats.total_liquidity_usd.round_dp(0),
                "Market statistics"
            );
        }

        let sufficient = out.markets.len() >= cfg.min_markets;
        let event = if sufficient {
            Event::Done
        } else {
            let failure = PipelineError::DataQualityFailure {
                markets: out.markets.len(),
                minimum: cfg.min_markets,
            };
            warn!("{failure}");
            Event::PreprocessingFailed
        };

        let status = PreprocessingStatus {
            markets: out.markets.len(),
            records_used: out.records_used,
            records_dropped: out.dropped.len(),
            gas_price_gwei: payload.gas_price_gwei,
            sufficient,
        };
        info!(
            markets = status.markets,
            records_used = status.records_used,
            dropped = status.records_dropped,
            event = %event,
            "Preprocessing complete"
        );

        Ok((
            PreprocessingSlice {
                unified_markets: out.markets,
                preprocessing_cycle_status: Some(status),
                dropped_records: out.dropped,
                last_preprocessing_utc: Some(payload.observed_at),
            },
            event,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolCostConfig;
    use crate::rounds::fixtures::{at, commit, make_config, make_ctx_with, EmptyFetcher};
    use crate::sources::{GasPriceOracle, MockGasPriceOracle};
    use crate::state::CollectionSlice;
    use crate::types::{SourceStatus, SourceType};
    use serde_json::{json, Value};

    fn make_record(protocol: &str, payload: Option<Value>, collected: DateTime<Utc>) -> RawSourceRecord {
        RawSourceRecord {
            protocol_name: protocol.into(),
            chain_id: 42161,
            source_type: SourceType::Api,
            status: if payload.is_some() { SourceStatus::Success } else { SourceStatus::Failure },
            collection_time: collected,
            raw_payload: payload,
            error_message: None,
            attempts: 1,
        }
    }

    fn fluid_payload() -> Value {
        json!({
            "data": [{
                "address": "0xf1",
                "symbol": "fUSDC",
                "asset": { "address": "0xaf88", "symbol": "USDC" },
                "supplyRate": "500",
                "borrowRate": "700",
                "totalAssetsUsd": "2000000",
                "totalBorrowUsd": "500000",
                "collateralFactor": "8000",
                "liquidationThreshold": "8500"
            }]
        })
    }

    fn compound_payload() -> Value {
        json!({
            "tokens": [{
                "key": "cUSDCv3",
                "symbol": "cUSDCv3",
                "address": "0xc1",
                "underlyingSymbol": "USDC",
                "liquidity": 1000000,
                "metrics": {
                    "apy": "4.0",
                    "borrowApy": "6.0",
                    "utilization": "50",
                    "collateralFactor": 0.8
                }
            }]
        })
    }

    #[test]
    fn test_enrich_applies_fee_and_cost() {
        let mut cfg = PreprocessingConfig::default();
        cfg.native_price_usd = dec!(3000);
        cfg.reference_trade_usd = dec!(10000);
        cfg.protocols.insert(
            "fluid".into(),
            ProtocolCostConfig {
                fee: dec!(0.001),
                gas_units: 300_000,
                gas_multiplier: dec!(1.2),
                slippage_bps: dec!(5),
            },
        );
        let market = UnifiedMarketData::sample("fluid", "f1", "USDC");
        let m = enrich(market, &cfg, dec!(0.1)).unwrap();
        assert_eq!(m.supply_apy_net, dec!(0.049));
        assert_eq!(m.borrow_apy_net, dec!(0.031));
        assert_eq!(m.utilization_rate, dec!(0.5));
        // 300k * 0.1 gwei * 1e-9 * 3000 * 1.2 = 0.108; 5bps of 10k = 5
        assert_eq!(m.transaction_cost_estimate_usd, dec!(5.108));
        assert!(m.utilization_consistent());
    }

    #[test]
    fn test_zero_liquidity_zero_utilization() {
        let mut market = UnifiedMarketData::sample("aavev3", "a1", "USDC");
        market.liquidity_usd = Decimal::ZERO;
        let m = enrich(market, &PreprocessingConfig::default(), dec!(0.1)).unwrap();
        assert_eq!(m.utilization_rate, Decimal::ZERO);
    }

    #[test]
    fn test_utilization_overflow_rejected() {
        let mut market = UnifiedMarketData::sample("aavev3", "a1", "USDC");
        market.liquidity_usd = dec!(0.0000000000000000000000000001);
        market.total_borrowed_usd = dec!(1000000000000000);
        assert_eq!(
            enrich(market, &PreprocessingConfig::default(), dec!(0.1)),
            Err("utilization overflows".to_string())
        );
    }

    #[test]
    fn test_extreme_gas_price_drops_markets() {
        let mut cfg = PreprocessingConfig::default();
        cfg.protocols.insert(
            "fluid".into(),
            ProtocolCostConfig {
                gas_units: 300_000,
                ..Default::default()
            },
        );
        let records = vec![make_record("fluid", Some(fluid_payload()), at(0))];
        let out = preprocess(&records, &cfg, at(0), Decimal::MAX);
        assert!(out.markets.is_empty());
        assert_eq!(out.records_used, 1);
        assert!(matches!(
            &out.dropped[0].reason,
            DropReason::MarketSkipped { market_id, reason } if market_id == "0xf1" && reason == "gas cost overflows"
        ));
    }

    #[test]
    fn test_stale_records_excluded() {
        let cfg = PreprocessingConfig::default();
        let records = vec![
            make_record("fluid", Some(fluid_payload()), at(0)),
            make_record("compoundv3", Some(compound_payload()), at(-601)),
        ];
        let out = preprocess(&records, &cfg, at(0), dec!(0.1));
        assert_eq!(out.markets.len(), 1);
        assert_eq!(out.markets[0].protocol_name, "fluid");
        assert_eq!(out.dropped[0].reason, DropReason::Stale { age_secs: 601 });
    }

    #[test]
    fn test_drop_reasons() {
        let cfg = PreprocessingConfig::default();
        let records = vec![
            make_record("fluid", None, at(0)),
            make_record("radiant", Some(json!({})), at(0)),
            make_record("compoundv3", Some(json!({"nope": 1})), at(0)),
        ];
        let out = preprocess(&records, &cfg, at(0), dec!(0.1));
        assert!(out.markets.is_empty());
        let reasons: Vec<_> = out.dropped.iter().map(|d| &d.reason).collect();
        assert_eq!(reasons[0], &DropReason::SourceFailed);
        assert_eq!(reasons[1], &DropReason::UnsupportedProtocol);
        assert!(matches!(reasons[2], DropReason::Malformed(_)));
    }

    #[test]
    fn test_markets_sorted_deterministically() {
        let cfg = PreprocessingConfig::default();
        let records = vec![
            make_record("fluid", Some(fluid_payload()), at(0)),
            make_record("compoundv3", Some(compound_payload()), at(0)),
        ];
        let a = preprocess(&records, &cfg, at(0), dec!(0.1));
        let reversed: Vec<_> = records.iter().rev().cloned().collect();
        let b = preprocess(&reversed, &cfg, at(0), dec!(0.1));
        assert_eq!(a.markets, b.markets);
        assert_eq!(a.markets[0].protocol_name, "compoundv3");
    }

    #[test]
    fn test_market_stats() {
        let mut markets = vec![
            UnifiedMarketData::sample("aavev3", "a", "USDC"),
            UnifiedMarketData::sample("fluid", "b", "USDC"),
            UnifiedMarketData::sample("fluid", "c", "USDC"),
        ];
        markets[0].supply_apy_net = dec!(0.01);
        markets[1].supply_apy_net = dec!(0.02);
        markets[2].supply_apy_net = dec!(0.06);
        let stats = market_stats(&markets).unwrap();
        assert_eq!(stats.mean_supply_apy, dec!(0.03));
        assert_eq!(stats.median_supply_apy, dec!(0.02));
        assert_eq!(stats.min_supply_apy, dec!(0.01));
        assert_eq!(stats.max_supply_apy, dec!(0.06));
        assert_eq!(stats.total_liquidity_usd, dec!(3_000_000));
        assert!(market_stats(&[]).is_none());
    }

    fn make_round(gas: Arc<dyn GasPriceOracle>, min_markets: usize) -> PreprocessingRound {
        let mut config = make_config();
        config.preprocessing.min_markets = min_markets;
        let ctx = make_ctx_with(config, Arc::new(EmptyFetcher));
        let ctx = Arc::new(RoundContext {
            config: ctx.config.clone(),
            fetcher: ctx.fetcher.clone(),
            gas,
            executor: ctx.executor.clone(),
            clock: ctx.clock.clone(),
        });
        PreprocessingRound::new(ctx)
    }

    fn state_with_records(records: Vec<RawSourceRecord>) -> SharedState {
        let mut state = SharedState::new();
        commit(
            &mut state,
            CollectionSlice {
                raw_market_data_sources: records,
                ..Default::default()
            },
        );
        state
    }

    #[tokio::test]
    async fn test_gas_oracle_failure_falls_back() {
        let mut gas = MockGasPriceOracle::new();
        gas.expect_gas_quote()
            .returning(|| Err(anyhow::anyhow!("rpc down")));
        let round = make_round(Arc::new(gas), 1);
        let payload = round.propose(ParticipantId(0), &SharedState::new()).await.unwrap();
        assert_eq!(payload.gas_price_gwei, dec!(0.1));
        assert_eq!(payload.observed_at, at(0));
    }

    #[tokio::test]
    async fn test_round_done() {
        let round = make_round(Arc::new(crate::sources::StaticGasOracle::new(dec!(0.1))), 2);
        let state = state_with_records(vec![
            make_record("fluid", Some(fluid_payload()), at(0)),
            make_record("compoundv3", Some(compound_payload()), at(0)),
        ]);
        let payload = round.propose(ParticipantId(0), &state).await.unwrap();
        let (slice, event) = round.apply(&state, &payload).unwrap();
        assert_eq!(event, Event::Done);
        assert_eq!(slice.unified_markets.len(), 2);
        assert_eq!(slice.last_preprocessing_utc, Some(at(0)));
        assert!(slice.preprocessing_cycle_status.unwrap().sufficient);
    }

    #[tokio::test]
    async fn test_too_few_markets_fails_but_writes_slice() {
        let round = make_round(Arc::new(crate::sources::StaticGasOracle::new(dec!(0.1))), 2);
        let state = state_with_records(vec![make_record("fluid", Some(fluid_payload()), at(0))]);
        let payload = round.propose(ParticipantId(0), &state).await.unwrap();
        let (slice, event) = round.apply(&state, &payload).unwrap();
        assert_eq!(event, Event::PreprocessingFailed);
        assert_eq!(slice.unified_markets.len(), 1);
        assert!(!slice.preprocessing_cycle_status.unwrap().sufficient);
    }
}
