//! Rebalancing: decide hold / exit / migrate for every open position and
//! queue the resulting intents for the next transaction round.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{matching, RoundContext};
use crate::config::ConsensusConfig;
use crate::engine::consensus::{ParticipantId, Reduction};
use crate::engine::{Round, RoundError};
use crate::state::{RebalancingSlice, SharedState};
use crate::strategy::rebalance::{pending_intents, Rebalancer};
use crate::types::{Event, PipelineError, RoundKind};

pub struct RebalancingRound {
    ctx: Arc<RoundContext>,
}

impl RebalancingRound {
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        Self { ctx }
    }

    fn compute(&self, state: &SharedState) -> Result<RebalancingSlice, RoundError> {
        let now = state.positions().last_tracking_utc.ok_or_else(|| {
            PipelineError::InternalFault("rebalancing before positions were tracked".into())
        })?;
        let config = &self.ctx.config;
        let decisions = Rebalancer::new(&config.rebalancing, &config.strategy).decide(
            state.positions(),
            &state.ranking().ranked_opportunities,
            &state.preprocessing().unified_markets,
            now,
        );
        let pending_intents = pending_intents(&decisions);
        Ok(RebalancingSlice {
            decisions,
            pending_intents,
        })
    }
}

#[async_trait]
impl Round for RebalancingRound {
    type Payload = RebalancingSlice;
    type Slice = RebalancingSlice;

    const KIND: RoundKind = RoundKind::Rebalancing;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction {
        matching(consensus)
    }

    async fn propose(&self, _participant: ParticipantId, state: &SharedState) -> Result<RebalancingSlice, RoundError> {
        self.compute(state)
    }

    fn apply(&self, _state: &SharedState, payload: &RebalancingSlice) -> Result<(RebalancingSlice, Event), RoundError> {
        info!(
            positions = payload.decisions.len(),
            queued = payload.pending_intents.len(),
            "Rebalancing decided"
        );
        Ok((payload.clone(), Event::Done))
    }
}
