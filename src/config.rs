//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`. Every section except
//! `[[collection.sources]]` has defaults, so a minimal file only lists
//! the sources to poll.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use crate::engine::consensus::Quorum;
use crate::tokens::AssetClass;
use crate::types::{RoundKind, SourceType};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub rounds: RoundsConfig,
    pub collection: CollectionConfig,
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub rebalancing: RebalancingConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

// ---------------------------------------------------------------------------
// Agent / consensus / rounds
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub cycle_interval_secs: u64,
    pub chain_id: u64,
    /// Simulate execution instead of broadcasting.
    pub dry_run: bool,
    pub state_file: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "YIELDARB-001".to_string(),
            cycle_interval_secs: 300,
            chain_id: 42161,
            dry_run: true,
            state_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Number of replicas proposing payloads each round.
    pub participants: usize,
    /// Quorum for rounds whose payloads must match exactly.
    pub matching_quorum: Quorum,
    /// Quorum for rounds carrying independently fetched data.
    pub fetch_quorum: Quorum,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            participants: 1,
            matching_quorum: Quorum::All,
            fetch_quorum: Quorum::Majority,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RoundsConfig {
    pub default_timeout_secs: u64,
    /// Per-round overrides keyed by round name (`data_collection`, ...).
    pub timeouts: BTreeMap<String, u64>,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            timeouts: BTreeMap::new(),
        }
    }
}

impl RoundsConfig {
    pub fn timeout_for(&self, round: RoundKind) -> Duration {
        let secs = self
            .timeouts
            .get(&round.to_string())
            .copied()
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs)
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Per-attempt fetch timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub sources: Vec<SourceConfig>,
}

fn default_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl CollectionConfig {
    /// Delay before retry number `attempt` (1-based: the first retry waits
    /// `base_delay_ms`).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.base_delay_ms as f64 * factor) as u64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// One protocol endpoint polled during data collection.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SourceConfig {
    /// Protocol registry name (`aavev3`, `fluid`, `compoundv3`).
    pub protocol: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub source_type: SourceType,
    pub url: String,
    /// GraphQL query body for subgraph sources.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_true")]
    pub critical: bool,
    /// Env var holding a bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_chain_id() -> u64 {
    42161
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub stale_data_threshold_secs: i64,
    /// Fewer markets than this fails the cycle.
    pub min_markets: usize,
    /// Native gas token price used in cost estimates.
    pub native_price_usd: Decimal,
    /// Gas price used when the oracle is unavailable.
    pub static_gas_price_gwei: Decimal,
    /// JSON-RPC endpoint for `eth_gasPrice`; static gas when absent.
    pub gas_rpc_url: Option<String>,
    /// Trade size the slippage term is priced against.
    pub reference_trade_usd: Decimal,
    pub protocols: BTreeMap<String, ProtocolCostConfig>,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            stale_data_threshold_secs: 600,
            min_markets: 2,
            native_price_usd: dec!(3000),
            static_gas_price_gwei: dec!(0.1),
            gas_rpc_url: None,
            reference_trade_usd: dec!(10000),
            protocols: BTreeMap::new(),
        }
    }
}

impl PreprocessingConfig {
    pub fn stale_data_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_data_threshold_secs)
    }

    /// Fee and cost model for a protocol (zero fee when not configured).
    pub fn costs_for(&self, protocol: &str) -> ProtocolCostConfig {
        self.protocols.get(protocol).cloned().unwrap_or_default()
    }
}

/// Fee and gas/slippage model for one protocol.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProtocolCostConfig {
    /// Operational fee subtracted from supply and added to borrow APY.
    pub fee: Decimal,
    pub gas_units: u64,
    pub gas_multiplier: Decimal,
    pub slippage_bps: Decimal,
}

impl Default for ProtocolCostConfig {
    fn default() -> Self {
        Self {
            fee: Decimal::ZERO,
            gas_units: 0,
            gas_multiplier: Decimal::ONE,
            slippage_bps: Decimal::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StrategyConfig {
    pub total_available_capital: Decimal,
    pub max_allocation_per_opportunity: Decimal,
    pub max_allocation_per_protocol: Decimal,
    pub min_net_apy: Decimal,
    pub max_risk_score: Decimal,
    pub min_liquidity_usd: Decimal,
    pub min_position_size: Decimal,
    pub max_positions: usize,
    pub max_opportunities: usize,
    pub diversification: bool,
    pub holding_period_days: Decimal,
    pub allow_same_protocol: bool,
    /// Asset pairs treated as interchangeable (e.g. `["USDC", "USDT"]`).
    pub allowed_swap_pairs: Vec<(String, String)>,
    /// Borrow amount as a fraction of supplied capital.
    pub target_ltv: Decimal,
    pub risk: RiskWeights,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            total_available_capital: dec!(100000),
            max_allocation_per_opportunity: dec!(25000),
            max_allocation_per_protocol: dec!(50000),
            min_net_apy: dec!(0.01),
            max_risk_score: dec!(0.7),
            min_liquidity_usd: dec!(50000),
            min_position_size: dec!(100),
            max_positions: 10,
            max_opportunities: 3,
            diversification: false,
            holding_period_days: dec!(30),
            allow_same_protocol: false,
            allowed_swap_pairs: Vec::new(),
            target_ltv: dec!(0.5),
            risk: RiskWeights::default(),
        }
    }
}

impl StrategyConfig {
    /// Whether two underlying symbols may form a supply/borrow pair.
    pub fn assets_compatible(&self, a: &str, b: &str) -> bool {
        a == b
            || self
                .allowed_swap_pairs
                .iter()
                .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

/// Risk-score weights and constants.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskWeights {
    pub protocol_weight: Decimal,
    pub position_weight: Decimal,
    pub asset_weight: Decimal,
    /// Collateral margin at which position risk reaches zero.
    pub reference_margin: Decimal,
    pub default_protocol_risk: Decimal,
    /// Used for asset classes missing from `asset_class_risk`.
    pub default_asset_class_risk: Decimal,
    pub protocol_risk: BTreeMap<String, Decimal>,
    pub asset_class_risk: BTreeMap<AssetClass, Decimal>,
}

impl Default for RiskWeights {
    fn default() -> Self {
        let protocol_risk = BTreeMap::from([
            ("aavev3".to_string(), dec!(0.2)),
            ("compoundv3".to_string(), dec!(0.4)),
            ("fluid".to_string(), dec!(0.4)),
        ]);
        let asset_class_risk = BTreeMap::from([
            (AssetClass::Stablecoin, dec!(0.2)),
            (AssetClass::EthCorrelated, dec!(0.4)),
            (AssetClass::BtcCorrelated, dec!(0.4)),
            (AssetClass::Other, dec!(0.6)),
        ]);
        Self {
            protocol_weight: dec!(0.4),
            position_weight: dec!(0.4),
            asset_weight: dec!(0.2),
            reference_margin: dec!(0.1),
            default_protocol_risk: dec!(0.6),
            default_asset_class_risk: dec!(0.6),
            protocol_risk,
            asset_class_risk,
        }
    }
}

impl RiskWeights {
    pub fn protocol_risk(&self, protocol: &str) -> Decimal {
        self.protocol_risk
            .get(protocol)
            .copied()
            .unwrap_or(self.default_protocol_risk)
    }

    pub fn asset_class_risk(&self, class: AssetClass) -> Decimal {
        self.asset_class_risk
            .get(&class)
            .copied()
            .unwrap_or(self.default_asset_class_risk)
    }
}

// ---------------------------------------------------------------------------
// Rebalancing / health
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RebalancingConfig {
    pub critical_health_factor: Decimal,
    /// How long a position may stay below `min_net_apy` before exiting.
    pub grace_period_secs: i64,
    /// Extra APY a new pair must offer before migrating.
    pub migration_margin: Decimal,
}

impl Default for RebalancingConfig {
    fn default() -> Self {
        Self {
            critical_health_factor: dec!(1.1),
            grace_period_secs: 86_400,
            migration_margin: dec!(0.005),
        }
    }
}

impl RebalancingConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8716,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file: {path}"))?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Reject values that would make the pipeline meaningless.
    pub fn validate(&self) -> Result<()> {
        let c = &self.consensus;
        if c.participants == 0 {
            anyhow::bail!("consensus.participants must be at least 1");
        }
        for quorum in [&c.matching_quorum, &c.fetch_quorum] {
            if quorum.required(c.participants) > c.participants {
                anyhow::bail!(
                    "quorum {quorum:?} exceeds {} participants",
                    c.participants
                );
            }
        }

        if self.collection.sources.is_empty() {
            anyhow::bail!("collection.sources must list at least one source");
        }
        if self.collection.attempts == 0 {
            anyhow::bail!("collection.attempts must be at least 1");
        }
        if self.collection.backoff_factor < 1.0 {
            anyhow::bail!("collection.backoff_factor must be >= 1.0");
        }

        let s = &self.strategy;
        if s.total_available_capital < Decimal::ZERO {
            anyhow::bail!("strategy.total_available_capital must not be negative");
        }
        if s.holding_period_days <= Decimal::ZERO {
            anyhow::bail!("strategy.holding_period_days must be positive");
        }
        if s.max_risk_score < Decimal::ZERO || s.max_risk_score > Decimal::ONE {
            anyhow::bail!("strategy.max_risk_score must lie in [0, 1]");
        }
        if s.target_ltv < Decimal::ZERO || s.target_ltv >= Decimal::ONE {
            anyhow::bail!("strategy.target_ltv must lie in [0, 1)");
        }
        if s.min_position_size > s.max_allocation_per_opportunity {
            anyhow::bail!("strategy.min_position_size exceeds max_allocation_per_opportunity");
        }
        let w = &s.risk;
        if w.protocol_weight + w.position_weight + w.asset_weight <= Decimal::ZERO {
            anyhow::bail!("strategy.risk weights must sum to a positive value");
        }
        if w.reference_margin <= Decimal::ZERO {
            anyhow::bail!("strategy.risk.reference_margin must be positive");
        }

        if self.rebalancing.critical_health_factor < Decimal::ONE {
            anyhow::bail!("rebalancing.critical_health_factor must be >= 1");
        }
        if self.rebalancing.grace_period_secs < 0 {
            anyhow::bail!("rebalancing.grace_period_secs must not be negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[collection.sources]]
        protocol = "fluid"
        source_type = "API"
        url = "https://api.fluid.instadapp.io/v2/lending/42161/tokens"
    "#;

    #[test]
    fn test_load_config() {
        // Requires config.toml in the working directory.
        let result = AppConfig::load("config.toml");
        if let Ok(cfg) = result {
            assert_eq!(cfg.agent.chain_id, 42161);
            assert!(cfg.consensus.participants >= 1);
            assert!(!cfg.collection.sources.is_empty());
            assert!(cfg.strategy.total_available_capital > Decimal::ZERO);
        }
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = AppConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(cfg.agent.name, "YIELDARB-001");
        assert_eq!(cfg.collection.attempts, 3);
        assert_eq!(cfg.collection.sources[0].chain_id, 42161);
        assert!(cfg.collection.sources[0].critical);
        assert_eq!(cfg.strategy.min_net_apy, dec!(0.01));
        assert_eq!(cfg.consensus.matching_quorum, Quorum::All);
    }

    #[test]
    fn test_float_values_parse_as_decimal() {
        let toml = format!(
            "{MINIMAL}\n[strategy]\nmin_net_apy = 0.015\ntotal_available_capital = 5000\n"
        );
        let cfg = AppConfig::from_toml(&toml).unwrap();
        assert_eq!(cfg.strategy.min_net_apy, dec!(0.015));
        assert_eq!(cfg.strategy.total_available_capital, dec!(5000));
    }

    #[test]
    fn test_quorum_forms() {
        let toml = format!(
            "[consensus]\nparticipants = 4\nmatching_quorum = \"majority\"\nfetch_quorum = 2\n{MINIMAL}"
        );
        let cfg = AppConfig::from_toml(&toml).unwrap();
        assert_eq!(cfg.consensus.matching_quorum, Quorum::Majority);
        assert_eq!(cfg.consensus.fetch_quorum, Quorum::Count(2));
    }

    #[test]
    fn test_rejects_oversized_quorum() {
        let toml = format!("[consensus]\nparticipants = 2\nfetch_quorum = 3\n{MINIMAL}");
        assert!(AppConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_rejects_empty_sources() {
        assert!(AppConfig::from_toml("[collection]\nsources = []\n").is_err());
    }

    #[test]
    fn test_rejects_bad_risk_cap() {
        let toml = format!("{MINIMAL}\n[strategy]\nmax_risk_score = 1.5\n");
        assert!(AppConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_round_timeout_override() {
        let toml = format!(
            "[rounds]\ndefault_timeout_secs = 20\n[rounds.timeouts]\ndata_collection = 90\n{MINIMAL}"
        );
        let cfg = AppConfig::from_toml(&toml).unwrap();
        assert_eq!(
            cfg.rounds.timeout_for(RoundKind::DataCollection),
            Duration::from_secs(90)
        );
        assert_eq!(cfg.rounds.timeout_for(RoundKind::Reset), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_delay_grows() {
        let cfg = AppConfig::from_toml(MINIMAL).unwrap();
        let c = &cfg.collection;
        assert_eq!(c.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(c.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(c.backoff_delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_swap_pairs_are_symmetric() {
        let mut s = StrategyConfig::default();
        s.allowed_swap_pairs = vec![("USDC".into(), "USDT".into())];
        assert!(s.assets_compatible("USDC", "USDC"));
        assert!(s.assets_compatible("USDT", "USDC"));
        assert!(!s.assets_compatible("USDC", "DAI"));
    }

    #[test]
    fn test_protocol_costs_default_to_zero_fee() {
        let p = PreprocessingConfig::default();
        let costs = p.costs_for("fluid");
        assert_eq!(costs.fee, Decimal::ZERO);
        assert_eq!(costs.gas_multiplier, Decimal::ONE);
    }

    #[test]
    fn test_risk_defaults_are_separate() {
        let toml = format!(
            "{MINIMAL}\n[strategy.risk]\ndefault_protocol_risk = 0.9\ndefault_asset_class_risk = 0.3\n[strategy.risk.asset_class_risk]\nstablecoin = 0.1\n"
        );
        let cfg = AppConfig::from_toml(&toml).unwrap();
        let w = &cfg.strategy.risk;
        assert_eq!(w.protocol_risk("radiant"), dec!(0.9));
        assert_eq!(w.asset_class_risk(AssetClass::Stablecoin), dec!(0.1));
        assert_eq!(w.asset_class_risk(AssetClass::Other), dec!(0.3));
    }
}
