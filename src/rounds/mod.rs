//! The eight rounds of a cycle.
//!
//! Rounds that carry independently fetched data (collection,
//! preprocessing) agree by smallest digest. Every other round is a pure
//! function of the shared state: each participant computes the result in
//! `propose`, the engine agrees on identical payloads, and `apply` turns
//! the agreed payload into the round's slice.

pub mod allocation;
pub mod collection;
pub mod preprocessing;
pub mod ranking;
pub mod rebalancing;
pub mod reset;
pub mod tracking;
pub mod transactions;

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{AppConfig, ConsensusConfig};
use crate::engine::consensus::{Matching, Reduction, SmallestDigest};
use crate::execution::TransactionExecutor;
use crate::sources::{GasPriceOracle, MarketDataFetcher};

pub use allocation::AllocationRound;
pub use collection::DataCollectionRound;
pub use preprocessing::PreprocessingRound;
pub use ranking::OpportunityRankingRound;
pub use rebalancing::RebalancingRound;
pub use reset::ResetRound;
pub use tracking::PositionTrackingRound;
pub use transactions::TransactionConstructionRound;

/// Configuration and collaborators shared by every round.
pub struct RoundContext {
    pub config: Arc<AppConfig>,
    pub fetcher: Arc<dyn MarketDataFetcher>,
    pub gas: Arc<dyn GasPriceOracle>,
    pub executor: Arc<dyn TransactionExecutor>,
    pub clock: Arc<dyn Clock>,
}

/// One instance of every round, in cycle order.
pub struct Rounds {
    pub(crate) collection: DataCollectionRound,
    pub(crate) preprocessing: PreprocessingRound,
    pub(crate) ranking: OpportunityRankingRound,
    pub(crate) allocation: AllocationRound,
    pub(crate) transactions: TransactionConstructionRound,
    pub(crate) tracking: PositionTrackingRound,
    pub(crate) rebalancing: RebalancingRound,
    pub(crate) reset: ResetRound,
}

impl Rounds {
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        Self {
            collection: DataCollectionRound::new(ctx.clone()),
            preprocessing: PreprocessingRound::new(ctx.clone()),
            ranking: OpportunityRankingRound::new(ctx.clone()),
            allocation: AllocationRound::new(ctx.clone()),
            transactions: TransactionConstructionRound::new(ctx.clone()),
            tracking: PositionTrackingRound::new(ctx.clone()),
            rebalancing: RebalancingRound::new(ctx),
            reset: ResetRound,
        }
    }
}

pub(crate) fn matching(consensus: &ConsensusConfig) -> Reduction {
    Reduction::Matching(Matching(consensus.matching_quorum))
}

pub(crate) fn smallest_digest(consensus: &ConsensusConfig) -> Reduction {
    Reduction::SmallestDigest(SmallestDigest(consensus.fetch_quorum))
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
