//! Mock market sources for integration testing.
//!
//! Provides a deterministic `MarketDataFetcher` that serves Fluid and
//! AAVE payloads built from plain numbers, with per-protocol failure
//! injection. All state is in-memory and adjustable between cycles.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use yieldarb::clock::FixedClock;
use yieldarb::config::{AppConfig, CollectionConfig, SourceConfig};
use yieldarb::engine::Engine;
use yieldarb::execution::DryRunExecutor;
use yieldarb::health::{HealthReport, WatchHealthReporter};
use yieldarb::rounds::{RoundContext, Rounds};
use yieldarb::sources::{FetchOutcome, MarketDataFetcher, StaticGasOracle};
use yieldarb::state::SharedState;
use yieldarb::types::{RoundKind, SourceType};

const RAY_PER_BPS: u128 = 100_000_000_000_000_000_000_000;

/// Rates of one USDC market, in basis points.
#[derive(Debug, Clone, Copy)]
pub struct MarketRates {
    pub supply_bps: u32,
    pub borrow_bps: u32,
    pub collateral_factor_bps: u32,
    pub liquidation_threshold_bps: u32,
}

/// A mock source set for deterministic testing.
///
/// Fluid serves its lending API format, AAVE its subgraph format. Rates
/// and failures are controllable from test code.
pub struct MockMarkets {
    rates: Mutex<BTreeMap<String, MarketRates>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MockMarkets {
    /// Fluid USDC supplies at 5%, AAVE USDC borrows at 3%.
    pub fn new() -> Self {
        let rates = BTreeMap::from([
            (
                "fluid".to_string(),
                MarketRates {
                    supply_bps: 500,
                    borrow_bps: 700,
                    collateral_factor_bps: 8000,
                    liquidation_threshold_bps: 8500,
                },
            ),
            (
                "aavev3".to_string(),
                MarketRates {
                    supply_bps: 200,
                    borrow_bps: 300,
                    collateral_factor_bps: 7500,
                    liquidation_threshold_bps: 8000,
                },
            ),
        ]);
        Self {
            rates: Mutex::new(rates),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn set_rates(&self, protocol: &str, rates: MarketRates) {
        self.rates.lock().unwrap().insert(protocol.to_string(), rates);
    }

    pub fn rates(&self, protocol: &str) -> MarketRates {
        self.rates.lock().unwrap()[protocol]
    }

    /// Make every fetch of `protocol` fail until restored.
    pub fn fail(&self, protocol: &str) {
        self.failing.lock().unwrap().insert(protocol.to_string());
    }

    pub fn restore(&self, protocol: &str) {
        self.failing.lock().unwrap().remove(protocol);
    }

    fn payload(protocol: &str, r: MarketRates) -> Value {
        match protocol {
            "fluid" => json!({
                "data": [{
                    "address": "0xf1",
                    "symbol": "fUSDC",
                    "asset": {"address": "0xaf88d065e77c8cC2239327C5EDb3A432268e5831", "symbol": "USDC"},
                    "supplyRate": r.supply_bps.to_string(),
                    "borrowRate": r.borrow_bps.to_string(),
                    "totalAssetsUsd": "2000000",
                    "totalBorrowUsd": "1000000",
                    "collateralFactor": r.collateral_factor_bps.to_string(),
                    "liquidationThreshold": r.liquidation_threshold_bps.to_string()
                }]
            }),
            _ => json!({
                "data": {
                    "reserves": [{
                        "id": "0xa1",
                        "symbol": "USDC",
                        "underlyingAsset": "0xaf88d065e77c8cc2239327c5edb3a432268e5831",
                        "liquidityRate": (r.supply_bps as u128 * RAY_PER_BPS).to_string(),
                        "variableBorrowRate": (r.borrow_bps as u128 * RAY_PER_BPS).to_string(),
                        "baseLTVasCollateral": r.collateral_factor_bps.to_string(),
                        "reserveLiquidationThreshold": r.liquidation_threshold_bps.to_string(),
                        "totalLiquidityUSD": "1500000",
                        "totalVariableDebtUSD": "750000"
                    }]
                }
            }),
        }
    }
}

#[async_trait]
impl MarketDataFetcher for MockMarkets {
    async fn fetch(&self, source: &SourceConfig) -> FetchOutcome {
        if self.failing.lock().unwrap().contains(&source.protocol) {
            return FetchOutcome::failure(format!("{} unavailable", source.protocol), false);
        }
        let rates = self.rates.lock().unwrap().get(&source.protocol).copied();
        match rates {
            Some(r) => FetchOutcome::Success(Self::payload(&source.protocol, r)),
            None => FetchOutcome::failure("unknown source", false),
        }
    }
}

fn make_source(protocol: &str, source_type: SourceType) -> SourceConfig {
    SourceConfig {
        protocol: protocol.into(),
        chain_id: 42161,
        source_type,
        url: format!("http://localhost/{protocol}"),
        query: None,
        critical: true,
        api_key_env: None,
    }
}

/// Three participants, both sources critical, no retries.
pub fn make_config() -> AppConfig {
    let mut config = AppConfig {
        agent: Default::default(),
        consensus: Default::default(),
        rounds: Default::default(),
        collection: CollectionConfig {
            attempts: 1,
            base_delay_ms: 1,
            backoff_factor: 2.0,
            request_timeout_secs: 1,
            sources: vec![
                make_source("fluid", SourceType::Api),
                make_source("aavev3", SourceType::Subgraph),
            ],
        },
        preprocessing: Default::default(),
        strategy: Default::default(),
        rebalancing: Default::default(),
        health: Default::default(),
    };
    config.consensus.participants = 3;
    config
}

/// An engine wired to in-memory collaborators, plus handles to steer them.
pub struct Harness {
    pub engine: Engine,
    pub markets: Arc<MockMarkets>,
    pub clock: Arc<FixedClock>,
    pub executor: Arc<DryRunExecutor>,
    pub health: Arc<WatchHealthReporter>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(make_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self::build(config, None)
    }

    /// Resume from a saved state at `next_round`.
    pub fn resume(state: SharedState, next_round: RoundKind) -> Self {
        Self::build(make_config(), Some((state, next_round)))
    }

    fn build(config: AppConfig, saved: Option<(SharedState, RoundKind)>) -> Self {
        let config = Arc::new(config);
        let markets = Arc::new(MockMarkets::new());
        let clock = Arc::new(FixedClock::new(
            chrono::DateTime::<chrono::Utc>::from_timestamp(1_760_000_000, 0).unwrap(),
        ));
        let executor = Arc::new(DryRunExecutor::new());
        let health = Arc::new(WatchHealthReporter::new(HealthReport::starting(
            RoundKind::DataCollection,
            0,
        )));
        let ctx = Arc::new(RoundContext {
            config: config.clone(),
            fetcher: markets.clone(),
            gas: Arc::new(StaticGasOracle::new(config.preprocessing.static_gas_price_gwei)),
            executor: executor.clone(),
            clock: clock.clone(),
        });
        let rounds = Rounds::new(ctx);
        let engine = match saved {
            Some((state, next_round)) => {
                Engine::restore(config, rounds, health.clone(), state, next_round)
            }
            None => Engine::new(config, rounds, health.clone()),
        };
        Self {
            engine,
            markets,
            clock,
            executor,
            health,
        }
    }
}
