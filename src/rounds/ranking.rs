//! Opportunity ranking over the agreed market snapshot.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{matching, RoundContext};
use crate::config::ConsensusConfig;
use crate::engine::consensus::{ParticipantId, Reduction};
use crate::engine::{Round, RoundError};
use crate::state::{RankingSlice, SharedState};
use crate::strategy::opportunity::{pct, OpportunityFinder};
use crate::types::{Event, PipelineError, RoundKind};

pub struct OpportunityRankingRound {
    ctx: Arc<RoundContext>,
}

impl OpportunityRankingRound {
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        Self { ctx }
    }

    fn compute(&self, state: &SharedState) -> Result<RankingSlice, RoundError> {
        let pre = state.preprocessing();
        let evaluated_at = pre.last_preprocessing_utc.ok_or_else(|| {
            PipelineError::InternalFault("ranking before any preprocessing pass".into())
        })?;

        let finder = OpportunityFinder::new(&self.ctx.config.strategy);
        let (ranked, stats) = finder.rank(&pre.unified_markets, evaluated_at);
        info!(
            markets = pre.unified_markets.len(),
            candidates = stats.candidates,
            ranked = ranked.len(),
            below_min_apy = stats.below_min_apy,
            risk_too_high = stats.risk_too_high,
            illiquid = stats.illiquid,
            best = ranked.first().map(|o| pct(o.net_estimated_apy)).unwrap_or_default(),
            "Opportunities ranked"
        );

        Ok(RankingSlice {
            ranked_opportunities: ranked,
            evaluated_at: Some(evaluated_at),
        })
    }
}

#[async_trait]
impl Round for OpportunityRankingRound {
    type Payload = RankingSlice;
    type Slice = RankingSlice;

    const KIND: RoundKind = RoundKind::OpportunityRanking;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction {
        matching(consensus)
    }

    async fn propose(&self, _participant: ParticipantId, state: &SharedState) -> Result<RankingSlice, RoundError> {
        self.compute(state)
    }

    fn apply(&self, _state: &SharedState, payload: &RankingSlice) -> Result<(RankingSlice, Event), RoundError> {
        Ok((payload.clone(), Event::Done))
    }
}
