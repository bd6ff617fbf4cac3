//! Capital allocation over the ranked opportunities.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{matching, RoundContext};
use crate::config::ConsensusConfig;
use crate::engine::consensus::{ParticipantId, Reduction};
use crate::engine::{Round, RoundError};
use crate::state::{AllocationSlice, SharedState};
use crate::strategy::allocation::Allocator;
use crate::types::{Event, RoundKind};

pub struct AllocationRound {
    ctx: Arc<RoundContext>,
}

impl AllocationRound {
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        Self { ctx }
    }

    fn compute(&self, state: &SharedState) -> AllocationSlice {
        let plan = Allocator::new(&self.ctx.config.strategy).allocate(
            &state.ranking().ranked_opportunities,
            &state.preprocessing().unified_markets,
            state.positions(),
            &state.rebalancing().pending_intents,
        );
        for a in &plan.allocations {
            info!(
                supply = %a.opportunity.supply_key(),
                borrow = %a.opportunity.borrow_key(),
                allocation_usd = %a.allocation_usd,
                borrow_usd = %a.borrow_amount_usd,
                "Capital allocated"
            );
        }
        AllocationSlice {
            selected_allocations: plan.allocations,
            remaining_capital_usd: plan.remaining_capital_usd,
        }
    }
}

#[async_trait]
impl Round for AllocationRound {
    type Payload = AllocationSlice;
    type Slice = AllocationSlice;

    const KIND: RoundKind = RoundKind::Allocation;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction {
        matching(consensus)
    }

    async fn propose(&self, _participant: ParticipantId, state: &SharedState) -> Result<AllocationSlice, RoundError> {
        Ok(self.compute(state))
    }

    fn apply(&self, _state: &SharedState, payload: &AllocationSlice) -> Result<(AllocationSlice, Event), RoundError> {
        Ok((payload.clone(), Event::Done))
    }
}
