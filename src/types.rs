//! Shared types for the YIELDARB agent.
//!
//! These types form the data model used across all modules. Every rate
//! is a decimal ratio (0.045 = 4.5%) and every amount is denominated in
//! USD. Nothing in here performs I/O.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Allowed gap between a reported utilization rate and the one derived
/// from `total_borrowed_usd / liquidity_usd` (liquidity may be estimated).
pub const UTILIZATION_TOLERANCE: Decimal = dec!(0.0001);

/// Health factor reported for positions that carry no debt.
pub const MAX_HEALTH_FACTOR: Decimal = dec!(999);

// ---------------------------------------------------------------------------
// Raw source records
// ---------------------------------------------------------------------------

/// How a source exposes its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Api,
    Subgraph,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Api => write!(f, "API"),
            SourceType::Subgraph => write!(f, "SUBGRAPH"),
        }
    }
}

/// Outcome of fetching a single source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceStatus {
    Success,
    Failure,
}

/// One configured source's fetch result for a cycle. Failures are kept
/// so later rounds can audit source health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceRecord {
    pub protocol_name: String,
    pub chain_id: u64,
    pub source_type: SourceType,
    pub status: SourceStatus,
    pub collection_time: DateTime<Utc>,
    pub raw_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Fetch attempts spent (1 = first try succeeded).
    pub attempts: u32,
}

impl fmt::Display for RawSourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            SourceStatus::Success => "ok",
            SourceStatus::Failure => "FAILED",
        };
        write!(
            f,
            "[{}@{}] {} {} (attempts={})",
            self.protocol_name,
            self.chain_id,
            self.source_type,
            status,
            self.attempts,
        )?;
        if let Some(err) = &self.error_message {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

impl RawSourceRecord {
    pub fn is_success(&self) -> bool {
        self.status == SourceStatus::Success
    }

    /// Age of the record relative to `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.collection_time
    }

    /// Whether the record is older than `threshold` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.age_at(now) > threshold
    }
}

// ---------------------------------------------------------------------------
// Unified market data
// ---------------------------------------------------------------------------

/// Identifies a market across protocols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketKey {
    pub protocol: String,
    pub market_id: String,
}

impl MarketKey {
    pub fn new(protocol: &str, market_id: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            market_id: market_id.to_string(),
        }
    }
}

impl fmt::Display for MarketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.market_id)
    }
}

/// A lending market normalised to the protocol-independent schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMarketData {
    pub protocol_name: String,
    pub chain_id: u64,
    pub market_id: String,
    /// Underlying asset symbol (e.g. "USDC", never "aArbUSDC").
    pub asset_symbol: String,
    pub asset_address: String,
    pub supply_apy: Decimal,
    pub supply_apy_net: Decimal,
    pub borrow_apy: Decimal,
    pub borrow_apy_net: Decimal,
    /// Total supplied liquidity in USD.
    pub liquidity_usd: Decimal,
    pub total_borrowed_usd: Decimal,
    /// Maximum loan-to-value when this asset is collateral.
    pub collateral_factor: Decimal,
    pub liquidation_threshold: Decimal,
    pub utilization_rate: Decimal,
    pub last_updated_at: DateTime<Utc>,
    /// Estimated one-time cost of entering or leaving this market.
    pub transaction_cost_estimate_usd: Decimal,
}

impl fmt::Display for UnifiedMarketData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} supply={:.2}% borrow={:.2}% liq=${:.0} util={:.1}%",
            self.protocol_name,
            self.asset_symbol,
            self.supply_apy_net * dec!(100),
            self.borrow_apy_net * dec!(100),
            self.liquidity_usd,
            self.utilization_rate * dec!(100),
        )
    }
}

impl UnifiedMarketData {
    pub fn key(&self) -> MarketKey {
        MarketKey::new(&self.protocol_name, &self.market_id)
    }

    /// Whether `utilization_rate` agrees with the borrowed/liquidity ratio.
    pub fn utilization_consistent(&self) -> bool {
        if self.utilization_rate < Decimal::ZERO {
            return false;
        }
        if self.liquidity_usd <= Decimal::ZERO {
            return true;
        }
        match self.total_borrowed_usd.checked_div(self.liquidity_usd) {
            Some(derived) => (derived - self.utilization_rate).abs() <= UTILIZATION_TOLERANCE,
            None => false,
        }
    }

    /// Helper to build a test/sample market with sensible defaults.
    #[cfg(test)]
    pub fn sample(protocol: &str, market_id: &str, asset: &str) -> Self {
        UnifiedMarketData {
            protocol_name: protocol.to_string(),
            chain_id: 42161,
            market_id: market_id.to_string(),
            asset_symbol: asset.to_string(),
            asset_address: format!("0x{market_id}"),
            supply_apy: dec!(0.05),
            supply_apy_net: dec!(0.05),
            borrow_apy: dec!(0.03),
            borrow_apy_net: dec!(0.03),
            liquidity_usd: dec!(1_000_000),
            total_borrowed_usd: dec!(500_000),
            collateral_factor: dec!(0.75),
            liquidation_threshold: dec!(0.80),
            utilization_rate: dec!(0.5),
            last_updated_at: DateTime::<Utc>::from_timestamp(1_760_000_000, 0)
                .unwrap_or_default(),
            transaction_cost_estimate_usd: Decimal::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Opportunities and allocations
// ---------------------------------------------------------------------------

/// A supply/borrow pair with its estimated net yield.
///
/// `supply_apy` and `borrow_apy` carry the fee-adjusted (net) leg rates,
/// so `net_estimated_apy = supply_apy - borrow_apy - annualized cost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub supply_protocol: String,
    pub supply_market_id: String,
    pub supply_asset: String,
    pub supply_apy: Decimal,
    pub borrow_protocol: String,
    pub borrow_market_id: String,
    pub borrow_asset: String,
    pub borrow_apy: Decimal,
    pub net_estimated_apy: Decimal,
    pub required_capital_usd: Decimal,
    /// Smaller of the two legs' liquidity.
    pub liquidity_usd: Decimal,
    pub risk_score: Decimal,
    pub transaction_cost_usd: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for ArbitrageOpportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "supply {} on {} ({:.2}%) / borrow {} on {} ({:.2}%) net={:.2}% risk={:.2}",
            self.supply_asset,
            self.supply_protocol,
            self.supply_apy * dec!(100),
            self.borrow_asset,
            self.borrow_protocol,
            self.borrow_apy * dec!(100),
            self.net_estimated_apy * dec!(100),
            self.risk_score,
        )
    }
}

impl ArbitrageOpportunity {
    pub fn supply_key(&self) -> MarketKey {
        MarketKey::new(&self.supply_protocol, &self.supply_market_id)
    }

    pub fn borrow_key(&self) -> MarketKey {
        MarketKey::new(&self.borrow_protocol, &self.borrow_market_id)
    }
}

/// Capital assigned to a ranked opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub opportunity: ArbitrageOpportunity,
    pub allocation_usd: Decimal,
    pub borrow_amount_usd: Decimal,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// An open supply/borrow position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePosition {
    pub position_id: String,
    pub supply_protocol: String,
    pub supply_market_id: String,
    pub supply_asset: String,
    pub supplied_amount: Decimal,
    pub borrow_protocol: String,
    pub borrow_market_id: String,
    pub borrow_asset: String,
    pub borrowed_amount: Decimal,
    pub entry_apy: Decimal,
    pub current_apy: Decimal,
    pub health_factor: Decimal,
    pub ltv: Decimal,
    pub pnl_usd: Decimal,
    pub external_tx_nonce: Option<u64>,
    pub opened_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Set while `current_apy` sits below the configured minimum.
    pub below_min_apy_since: Option<DateTime<Utc>>,
}

impl fmt::Display for ActivePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.pnl_usd >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "[{}] {} on {} / {} on {} supplied=${:.2} borrowed=${:.2} apy={:.2}% hf={:.2} ({sign}{:.2})",
            self.position_id,
            self.supply_asset,
            self.supply_protocol,
            self.borrow_asset,
            self.borrow_protocol,
            self.supplied_amount,
            self.borrowed_amount,
            self.current_apy * dec!(100),
            self.health_factor,
            self.pnl_usd,
        )
    }
}

impl ActivePosition {
    pub fn supply_key(&self) -> MarketKey {
        MarketKey::new(&self.supply_protocol, &self.supply_market_id)
    }

    pub fn borrow_key(&self) -> MarketKey {
        MarketKey::new(&self.borrow_protocol, &self.borrow_market_id)
    }

    /// Whether this position holds exactly the given opportunity's pair.
    pub fn holds(&self, opportunity: &ArbitrageOpportunity) -> bool {
        self.supply_key() == opportunity.supply_key()
            && self.borrow_key() == opportunity.borrow_key()
    }
}

// ---------------------------------------------------------------------------
// Transaction intents
// ---------------------------------------------------------------------------

/// Coarse intent category, part of the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentType {
    Enter,
    Exit,
    Migrate,
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentType::Enter => write!(f, "ENTER"),
            IntentType::Exit => write!(f, "EXIT"),
            IntentType::Migrate => write!(f, "MIGRATE"),
        }
    }
}

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Health factor below the critical threshold.
    HealthFactor,
    /// Yield below the minimum for longer than the grace period.
    LowYield,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::HealthFactor => write!(f, "health-factor"),
            ExitReason::LowYield => write!(f, "low-yield"),
        }
    }
}

/// Retries with the same key must be safe for the executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub position_id: String,
    pub cycle_id: u64,
    pub intent_type: IntentType,
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.position_id, self.cycle_id, self.intent_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntentKind {
    Enter { opportunity: ArbitrageOpportunity },
    Exit { reason: ExitReason },
    Migrate { target: ArbitrageOpportunity },
}

impl IntentKind {
    pub fn intent_type(&self) -> IntentType {
        match self {
            IntentKind::Enter { .. } => IntentType::Enter,
            IntentKind::Exit { .. } => IntentType::Exit,
            IntentKind::Migrate { .. } => IntentType::Migrate,
        }
    }
}

/// Request handed to the transaction executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxIntent {
    pub key: IdempotencyKey,
    pub kind: IntentKind,
    pub supply_protocol: String,
    pub supply_market_id: String,
    pub supply_asset: String,
    pub borrow_protocol: String,
    pub borrow_market_id: String,
    pub borrow_asset: String,
    pub supply_amount_usd: Decimal,
    pub borrow_amount_usd: Decimal,
}

impl fmt::Display for TxIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} supply ${:.2} {} on {} / borrow ${:.2} {} on {} [{}]",
            self.key.intent_type,
            self.supply_amount_usd,
            self.supply_asset,
            self.supply_protocol,
            self.borrow_amount_usd,
            self.borrow_asset,
            self.borrow_protocol,
            self.key,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Success,
    Failure,
}

/// What the executor reported for one intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub status: TxStatus,
    pub tx_hash: Option<String>,
    pub nonce: Option<u64>,
    pub error: Option<String>,
}

impl TxOutcome {
    pub fn success(tx_hash: String, nonce: Option<u64>) -> Self {
        Self {
            status: TxStatus::Success,
            tx_hash: Some(tx_hash),
            nonce,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: TxStatus::Failure,
            tx_hash: None,
            nonce: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }
}

/// An intent paired with its reported outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedIntent {
    pub intent: TxIntent,
    pub outcome: TxOutcome,
}

// ---------------------------------------------------------------------------
// Rounds and events
// ---------------------------------------------------------------------------

/// Every round of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundKind {
    DataCollection,
    Preprocessing,
    OpportunityRanking,
    Allocation,
    TransactionConstruction,
    PositionTracking,
    Rebalancing,
    Reset,
}

impl RoundKind {
    /// All rounds in cycle order.
    pub const ALL: &'static [RoundKind] = &[
        RoundKind::DataCollection,
        RoundKind::Preprocessing,
        RoundKind::OpportunityRanking,
        RoundKind::Allocation,
        RoundKind::TransactionConstruction,
        RoundKind::PositionTracking,
        RoundKind::Rebalancing,
        RoundKind::Reset,
    ];
}

impl fmt::Display for RoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundKind::DataCollection => "data_collection",
            RoundKind::Preprocessing => "preprocessing",
            RoundKind::OpportunityRanking => "opportunity_ranking",
            RoundKind::Allocation => "allocation",
            RoundKind::TransactionConstruction => "transaction_construction",
            RoundKind::PositionTracking => "position_tracking",
            RoundKind::Rebalancing => "rebalancing",
            RoundKind::Reset => "reset",
        };
        write!(f, "{name}")
    }
}

/// Exactly one event ends every round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Done,
    DoneWithWarnings,
    FetchFailed,
    PreprocessingFailed,
    Error,
    Timeout,
}

impl Event {
    /// Whether the event ends the cycle early.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Event::Done | Event::DoneWithWarnings)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Done => "DONE",
            Event::DoneWithWarnings => "DONE_WITH_WARNINGS",
            Event::FetchFailed => "FETCH_FAILED",
            Event::PreprocessingFailed => "PREPROCESSING_FAILED",
            Event::Error => "ERROR",
            Event::Timeout => "TIMEOUT",
        };
        write!(f, "{name}")
    }
}

/// Outcome of a completed cycle, written by the Reset round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: u64,
    /// Last round to run before Reset.
    pub terminal_round: Option<RoundKind>,
    pub terminal_event: Option<Event>,
    pub rounds_run: usize,
    pub warnings: usize,
}

impl CycleSummary {
    pub fn succeeded(&self) -> bool {
        self.terminal_event.map_or(false, |e| !e.is_failure())
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let round = self
            .terminal_round
            .map(|r| r.to_string())
            .unwrap_or_else(|| "none".to_string());
        let event = self
            .terminal_event
            .map(|e| e.to_string())
            .unwrap_or_else(|| "none".to_string());
        write!(
            f,
            "Cycle #{}: {} after {} ({} rounds, {} warnings)",
            self.cycle_id, event, round, self.rounds_run, self.warnings,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failure taxonomy of the pipeline. Only `SourceFailure` is absorbed
/// locally; the rest end the cycle through Reset.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Source failure ({source_name}): {message}")]
    SourceFailure { source_name: String, message: String },

    #[error("Critical sources failed: {}", .sources.join(", "))]
    CriticalFetchFailure { sources: Vec<String> },

    #[error("Dataset too thin: {markets} markets, need {minimum}")]
    DataQualityFailure { markets: usize, minimum: usize },

    #[error("No agreement in {round}: {received} payloads, {required} required")]
    AgreementTimeout {
        round: RoundKind,
        received: usize,
        required: usize,
    },

    #[error("Internal fault: {0}")]
    InternalFault(String),
}

impl PipelineError {
    /// The event this failure surfaces as at round level.
    pub fn event(&self) -> Event {
        match self {
            PipelineError::SourceFailure { .. } => Event::DoneWithWarnings,
            PipelineError::CriticalFetchFailure { .. } => Event::FetchFailed,
            PipelineError::DataQualityFailure { .. } => Event::PreprocessingFailed,
            PipelineError::AgreementTimeout { .. } => Event::Timeout,
            PipelineError::InternalFault(_) => Event::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
