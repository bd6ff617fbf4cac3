//! Transaction construction: turn this cycle's allocations and the
//! previous cycle's rebalancing intents into `TxIntent`s and submit them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use super::{matching, RoundContext};
use crate::config::ConsensusConfig;
use crate::engine::consensus::{ParticipantId, Reduction};
use crate::engine::{Round, RoundError};
use crate::state::{SharedState, TransactionSlice};
use crate::strategy::positions::position_id;
use crate::types::{
    ActivePosition, Allocation, ArbitrageOpportunity, Event, ExecutedIntent, IdempotencyKey,
    IntentKind, RoundKind, TxIntent,
};

pub struct TransactionConstructionRound {
    ctx: Arc<RoundContext>,
}

impl TransactionConstructionRound {
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        Self { ctx }
    }
}

fn leg_intent(
    key: IdempotencyKey,
    kind: IntentKind,
    target: &ArbitrageOpportunity,
    supply_amount_usd: Decimal,
    borrow_amount_usd: Decimal,
) -> TxIntent {
    TxIntent {
        key,
        kind,
        supply_protocol: target.supply_protocol.clone(),
        supply_market_id: target.supply_market_id.clone(),
        supply_asset: target.supply_asset.clone(),
        borrow_protocol: target.borrow_protocol.clone(),
        borrow_market_id: target.borrow_market_id.clone(),
        borrow_asset: target.borrow_asset.clone(),
        supply_amount_usd,
        borrow_amount_usd,
    }
}

fn enter_intent(cycle_id: u64, allocation: &Allocation) -> TxIntent {
    let opp = &allocation.opportunity;
    let kind = IntentKind::Enter {
        opportunity: opp.clone(),
    };
    let key = IdempotencyKey {
        position_id: position_id(cycle_id, &opp.supply_key(), &opp.borrow_key()),
        cycle_id,
        intent_type: kind.intent_type(),
    };
    leg_intent(key, kind, opp, allocation.allocation_usd, allocation.borrow_amount_usd)
}

fn exit_intent(cycle_id: u64, position: &ActivePosition, kind: IntentKind) -> TxIntent {
    TxIntent {
        key: IdempotencyKey {
            position_id: position.position_id.clone(),
            cycle_id,
            intent_type: kind.intent_type(),
        },
        kind,
        supply_protocol: position.supply_protocol.clone(),
        supply_market_id: position.supply_market_id.clone(),
        supply_asset: position.supply_asset.clone(),
        borrow_protocol: position.borrow_protocol.clone(),
        borrow_market_id: position.borrow_market_id.clone(),
        borrow_asset: position.borrow_asset.clone(),
        supply_amount_usd: position.supplied_amount,
        borrow_amount_usd: position.borrowed_amount,
    }
}

/// Every intent due this cycle: queued exits and migrations first, then
/// new entries. Intents for positions that no longer exist are dropped.
pub fn build_intents(state: &SharedState) -> Vec<TxIntent> {
    let cycle_id = state.cycle().cycle_id;
    let positions = &state.positions().active_positions;
    let mut intents = Vec::new();

    for pending in &state.rebalancing().pending_intents {
        let Some(position) = positions.get(&pending.position_id) else {
            warn!(position = %pending.position_id, "Queued intent for unknown position, dropping");
            continue;
        };
        let intent = match &pending.kind {
            IntentKind::Migrate { target } => {
                let kind = pending.kind.clone();
                let key = IdempotencyKey {
                    position_id: position.position_id.clone(),
                    cycle_id,
                    intent_type: kind.intent_type(),
                };
                leg_intent(key, kind, target, position.supplied_amount, position.borrowed_amount)
            }
            kind => exit_intent(cycle_id, position, kind.clone()),
        };
        intents.push(intent);
    }

    intents.extend(
        state
            .allocation()
            .selected_allocations
            .iter()
            .map(|a| enter_intent(cycle_id, a)),
    );
    intents
}

#[async_trait]
impl Round for TransactionConstructionRound {
    type Payload = TransactionSlice;
    type Slice = TransactionSlice;

    const KIND: RoundKind = RoundKind::TransactionConstruction;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction {
        matching(consensus)
    }

    async fn propose(&self, participant: ParticipantId, state: &SharedState) -> Result<TransactionSlice, RoundError> {
        let intents = build_intents(state);
        let mut executions = Vec::with_capacity(intents.len());
        for intent in intents {
            let outcome = self.ctx.executor.submit(&intent).await;
            if !outcome.is_success() {
                warn!(
                    participant = %participant,
                    key = %intent.key,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "Intent failed"
                );
            }
            executions.push(ExecutedIntent { intent, outcome });
        }
        Ok(TransactionSlice { executions })
    }

    fn apply(&self, _state: &SharedState, payload: &TransactionSlice) -> Result<(TransactionSlice, Event), RoundError> {
        let failed = payload
            .executions
            .iter()
            .filter(|e| !e.outcome.is_success())
            .count();
        let event = if failed == 0 {
            Event::Done
        } else {
            Event::DoneWithWarnings
        };
        info!(
            intents = payload.executions.len(),
            failed,
            dry_run = self.ctx.config.agent.dry_run,
            event = %event,
            "Transactions submitted"
        );
        Ok((payload.clone(), event))
    }
}
