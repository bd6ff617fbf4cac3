//! Shared synchronized state.
//!
//! `SharedState` is the only channel between rounds. It is split into
//! typed slices; each slice names the one round that owns it and is only
//! replaced through [`SharedState::commit`] with the value that round's
//! `apply` returned. Keys marked *per-cycle* are cleared when Reset
//! commits, *cross-cycle* keys survive.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::types::{
    ActivePosition, Allocation, ArbitrageOpportunity, CycleSummary, Event, ExecutedIntent,
    ExitReason, IntentKind, RawSourceRecord, RoundKind, UnifiedMarketData,
};

// ---------------------------------------------------------------------------
// Slice trait
// ---------------------------------------------------------------------------

pub trait Slice: Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send {
    /// The only round allowed to produce this slice.
    const OWNER: RoundKind;

    #[doc(hidden)]
    fn slot(state: &mut SharedState) -> &mut Self;

    /// Clear per-cycle keys, keep cross-cycle ones.
    fn reset_cycle(&mut self);

    #[doc(hidden)]
    fn store(self, state: &mut SharedState) {
        *Self::slot(state) = self;
    }
}

macro_rules! impl_slice {
    ($ty:ty, $owner:expr, $field:ident, |$s:ident| $reset:block) => {
        impl Slice for $ty {
            const OWNER: RoundKind = $owner;

            fn slot(state: &mut SharedState) -> &mut Self {
                &mut state.$field
            }

            fn reset_cycle(&mut self) {
                let $s = self;
                $reset
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Slices
// ---------------------------------------------------------------------------

/// Cycle bookkeeping. Owned by Reset; every key is cross-cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSlice {
    pub cycle_id: u64,
    pub completed_cycles: u64,
    pub last_cycle: Option<CycleSummary>,
}

impl Default for CycleSlice {
    fn default() -> Self {
        Self {
            cycle_id: 1,
            completed_cycles: 0,
            last_cycle: None,
        }
    }
}

impl Slice for CycleSlice {
    const OWNER: RoundKind = RoundKind::Reset;

    fn slot(state: &mut SharedState) -> &mut Self {
        &mut state.cycle
    }

    fn reset_cycle(&mut self) {}

    /// Committing a new cycle clears every per-cycle key and the journal.
    fn store(self, state: &mut SharedState) {
        state.cycle = self;
        state.collection.reset_cycle();
        state.preprocessing.reset_cycle();
        state.ranking.reset_cycle();
        state.allocation.reset_cycle();
        state.transactions.reset_cycle();
        state.positions.reset_cycle();
        state.rebalancing.reset_cycle();
        state.journal.entries.clear();
    }
}

/// Per-cycle summary of the data collection round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub succeeded: usize,
    pub failed_critical: Vec<String>,
    pub failed_non_critical: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionSlice {
    /// Per-cycle. One record per configured source, in config order.
    pub raw_market_data_sources: Vec<RawSourceRecord>,
    /// Per-cycle.
    pub data_collection_cycle_status: Option<CollectionStatus>,
    /// Cross-cycle.
    pub last_successful_collection_utc: Option<DateTime<Utc>>,
}

impl_slice!(CollectionSlice, RoundKind::DataCollection, collection, |s| {
    s.raw_market_data_sources.clear();
    s.data_collection_cycle_status = None;
});

/// Why a record or market was left out of `unified_markets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DropReason {
    SourceFailed,
    Stale { age_secs: i64 },
    UnsupportedProtocol,
    Malformed(String),
    /// One market inside an otherwise valid record.
    MarketSkipped { market_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedRecord {
    pub protocol_name: String,
    pub reason: DropReason,
}

/// Per-cycle summary of the preprocessing round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingStatus {
    pub markets: usize,
    pub records_used: usize,
    pub records_dropped: usize,
    pub gas_price_gwei: Decimal,
    /// False when the market count fell below the configured minimum.
    pub sufficient: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingSlice {
    /// Per-cycle, sorted by (protocol, chain, market_id).
    pub unified_markets: Vec<UnifiedMarketData>,
    /// Per-cycle.
    pub preprocessing_cycle_status: Option<PreprocessingStatus>,
    /// Per-cycle.
    pub dropped_records: Vec<DroppedRecord>,
    /// Cross-cycle. The agreed observation time of the last pass.
    pub last_preprocessing_utc: Option<DateTime<Utc>>,
}

impl_slice!(PreprocessingSlice, RoundKind::Preprocessing, preprocessing, |s| {
    s.unified_markets.clear();
    s.preprocessing_cycle_status = None;
    s.dropped_records.clear();
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingSlice {
    pub ranked_opportunities: Vec<ArbitrageOpportunity>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl_slice!(RankingSlice, RoundKind::OpportunityRanking, ranking, |s| {
    *s = RankingSlice::default();
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationSlice {
    pub selected_allocations: Vec<Allocation>,
    pub remaining_capital_usd: Decimal,
}

impl_slice!(AllocationSlice, RoundKind::Allocation, allocation, |s| {
    *s = AllocationSlice::default();
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionSlice {
    pub executions: Vec<ExecutedIntent>,
}

impl_slice!(TransactionSlice, RoundKind::TransactionConstruction, transactions, |s| {
    s.executions.clear();
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSlice {
    /// Cross-cycle, keyed by position id.
    pub active_positions: BTreeMap<String, ActivePosition>,
    /// Per-cycle. Ids of positions whose markets vanished this cycle.
    pub stale_positions: Vec<String>,
    /// Cross-cycle.
    pub last_tracking_utc: Option<DateTime<Utc>>,
    /// Cross-cycle. PnL locked in by confirmed exits.
    pub realized_pnl_usd: Decimal,
}

impl_slice!(PositionSlice, RoundKind::PositionTracking, positions, |s| {
    s.stale_positions.clear();
});

impl PositionSlice {
    /// Capital currently supplied across open positions.
    pub fn deployed_capital(&self) -> Decimal {
        self.active_positions
            .values()
            .map(|p| p.supplied_amount)
            .sum()
    }
}

/// A rebalancing intent queued for the next transaction round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingIntent {
    pub position_id: String,
    pub kind: IntentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RebalanceAction {
    Hold,
    Exit {
        reason: ExitReason,
    },
    Migrate {
        target: ArbitrageOpportunity,
        /// Net APY gained over the current position.
        improvement: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceDecision {
    pub position_id: String,
    pub action: RebalanceAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalancingSlice {
    /// Per-cycle.
    pub decisions: Vec<RebalanceDecision>,
    /// Cross-cycle. Overwritten every Rebalancing round and consumed by
    /// the next cycle's transaction round.
    pub pending_intents: Vec<PendingIntent>,
}

impl_slice!(RebalancingSlice, RoundKind::Rebalancing, rebalancing, |s| {
    s.decisions.clear();
});

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub round: RoundKind,
    pub event: Event,
}

/// Rounds completed in the current cycle. Written by the engine only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&JournalEntry> {
        self.entries.last()
    }

    /// First entry whose event ended the cycle early.
    pub fn first_failure(&self) -> Option<&JournalEntry> {
        self.entries.iter().find(|e| e.event.is_failure())
    }

    pub fn warnings(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.event == Event::DoneWithWarnings)
            .count()
    }
}

// ---------------------------------------------------------------------------
// SharedState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    version: u64,
    cycle: CycleSlice,
    collection: CollectionSlice,
    preprocessing: PreprocessingSlice,
    ranking: RankingSlice,
    allocation: AllocationSlice,
    transactions: TransactionSlice,
    positions: PositionSlice,
    rebalancing: RebalancingSlice,
    journal: Journal,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremented once per committed slice.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cycle(&self) -> &CycleSlice {
        &self.cycle
    }

    pub fn collection(&self) -> &CollectionSlice {
        &self.collection
    }

    pub fn preprocessing(&self) -> &PreprocessingSlice {
        &self.preprocessing
    }

    pub fn ranking(&self) -> &RankingSlice {
        &self.ranking
    }

    pub fn allocation(&self) -> &AllocationSlice {
        &self.allocation
    }

    pub fn transactions(&self) -> &TransactionSlice {
        &self.transactions
    }

    pub fn positions(&self) -> &PositionSlice {
        &self.positions
    }

    pub fn rebalancing(&self) -> &RebalancingSlice {
        &self.rebalancing
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Replace a slice with the value its owner round produced.
    pub(crate) fn commit<S: Slice>(&mut self, slice: S) {
        slice.store(self);
        self.version += 1;
    }

    pub(crate) fn record(&mut self, round: RoundKind, event: Event) {
        self.journal.entries.push(JournalEntry { round, event });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
