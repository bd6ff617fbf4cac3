//! Position tracking: fold confirmed executions into the position book,
//! then refresh every position against this cycle's market data.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{matching, RoundContext};
use crate::config::ConsensusConfig;
use crate::engine::consensus::{ParticipantId, Reduction};
use crate::engine::{Round, RoundError};
use crate::state::{PositionSlice, SharedState};
use crate::strategy::positions::{open_position, position_id, refresh};
use crate::types::{
    Event, ExecutedIntent, IntentKind, MarketKey, PipelineError, RoundKind, UnifiedMarketData,
};

pub struct PositionTrackingRound {
    ctx: Arc<RoundContext>,
}

impl PositionTrackingRound {
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        Self { ctx }
    }

    fn compute(&self, state: &SharedState) -> Result<PositionSlice, RoundError> {
        let now = state.preprocessing().last_preprocessing_utc.ok_or_else(|| {
            PipelineError::InternalFault("position tracking without an observation time".into())
        })?;
        Ok(track(
            state.positions(),
            &state.transactions().executions,
            &state.preprocessing().unified_markets,
            now,
            self.ctx.config.strategy.min_net_apy,
        ))
    }
}

/// Apply successful executions in order. Failed ones leave the book as is.
pub fn apply_executions(
    book: &mut PositionSlice,
    executions: &[ExecutedIntent],
    now: DateTime<Utc>,
) {
    for ExecutedIntent { intent, outcome } in executions {
        if !outcome.is_success() {
            debug!(key = %intent.key, "Skipping failed execution");
            continue;
        }
        let id = &intent.key.position_id;
        match &intent.kind {
            IntentKind::Enter { opportunity } => {
                if book.active_positions.contains_key(id) {
                    warn!(key = %intent.key, "Entered position id already tracked, ignoring duplicate");
                    continue;
                }
                let position = open_position(id.clone(), intent, opportunity, outcome.nonce, now);
                info!(position = %position, "Position opened");
                book.active_positions.insert(id.clone(), position);
            }
            IntentKind::Exit { reason } => {
                if let Some(closed) = book.active_positions.remove(id) {
                    book.realized_pnl_usd += closed.pnl_usd;
                    info!(position = %id, %reason, pnl = %closed.pnl_usd, "Position closed");
                }
            }
            IntentKind::Migrate { target } => {
                let Some(closed) = book.active_positions.remove(id) else {
                    continue;
                };
                book.realized_pnl_usd += closed.pnl_usd;
                let new_id = position_id(
                    intent.key.cycle_id,
                    &target.supply_key(),
                    &target.borrow_key(),
                );
                let position = open_position(new_id.clone(), intent, target, outcome.nonce, now);
                info!(from = %id, to = %new_id, pnl = %closed.pnl_usd, "Position migrated");
                book.active_positions.insert(new_id, position);
            }
        }
    }
}

/// The next position book: executions applied, interest accrued up to
/// `now` and live metrics recomputed. Positions whose legs are missing
/// from `markets` are listed as stale and left untouched.
pub fn track(
    previous: &PositionSlice,
    executions: &[ExecutedIntent],
    markets: &[UnifiedMarketData],
    now: DateTime<Utc>,
    min_net_apy: Decimal,
) -> PositionSlice {
    let mut book = previous.clone();
    book.stale_positions.clear();
    apply_executions(&mut book, executions, now);

    let by_key: HashMap<MarketKey, &UnifiedMarketData> =
        markets.iter().map(|m| (m.key(), m)).collect();
    for (id, position) in book.active_positions.iter_mut() {
        match (
            by_key.get(&position.supply_key()),
            by_key.get(&position.borrow_key()),
        ) {
            (Some(supply), Some(borrow)) => refresh(position, supply, borrow, now, min_net_apy),
            _ => {
                warn!(position = %id, "Market missing for open position, marking stale");
                book.stale_positions.push(id.clone());
            }
        }
    }
    book.last_tracking_utc = Some(now);
    book
}

#[async_trait]
impl Round for PositionTrackingRound {
    type Payload = PositionSlice;
    type Slice = PositionSlice;

    const KIND: RoundKind = RoundKind::PositionTracking;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction {
        matching(consensus)
    }

    async fn propose(&self, _participant: ParticipantId, state: &SharedState) -> Result<PositionSlice, RoundError> {
        self.compute(state)
    }

    fn apply(&self, _state: &SharedState, payload: &PositionSlice) -> Result<(PositionSlice, Event), RoundError> {
        let event = if payload.stale_positions.is_empty() {
            Event::Done
        } else {
            Event::DoneWithWarnings
        };
        info!(
            positions = payload.active_positions.len(),
            stale = payload.stale_positions.len(),
            deployed = %payload.deployed_capital(),
            realized_pnl = %payload.realized_pnl_usd,
            "Positions tracked"
        );
        Ok((payload.clone(), event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rounds::fixtures::{at, commit, make_ctx, make_markets, state_with_markets};
    use crate::state::TransactionSlice;
    use crate::types::{
        ArbitrageOpportunity, ExitReason, IdempotencyKey, TxIntent, TxOutcome, MAX_HEALTH_FACTOR,
    };
    use rust_decimal_macros::dec;

    fn make_opportunity(supply_id: &str) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            supply_protocol: "fluid".into(),
            supply_market_id: supply_id.into(),
            supply_asset: "USDC".into(),
            supply_apy: dec!(0.05),
            borrow_protocol: "aavev3".into(),
            borrow_market_id: "a1".into(),
            borrow_asset: "USDC".into(),
            borrow_apy: dec!(0.03),
            net_estimated_apy: dec!(0.02),
            required_capital_usd: dec!(10000),
            liquidity_usd: dec!(1000000),
            risk_score: dec!(0.36),
            transaction_cost_usd: Decimal::ZERO,
            timestamp: at(0),
        }
    }

    fn make_execution(id: &str, kind: IntentKind, target: &ArbitrageOpportunity, ok: bool) -> ExecutedIntent {
        let intent = TxIntent {
            key: IdempotencyKey {
                position_id: id.into(),
                cycle_id: 1,
                intent_type: kind.intent_type(),
            },
            kind,
            supply_protocol: target.supply_protocol.clone(),
            supply_market_id: target.supply_market_id.clone(),
            supply_asset: target.supply_asset.clone(),
            borrow_protocol: target.borrow_protocol.clone(),
            borrow_market_id: target.borrow_market_id.clone(),
            borrow_asset: target.borrow_asset.clone(),
            supply_amount_usd: dec!(10000),
            borrow_amount_usd: dec!(5000),
        };
        let outcome = if ok {
            TxOutcome::success("0xabc".into(), Some(0))
        } else {
            TxOutcome::failure("reverted")
        };
        ExecutedIntent { intent, outcome }
    }

    fn enter(id: &str, ok: bool) -> ExecutedIntent {
        let opp = make_opportunity("f1");
        make_execution(id, IntentKind::Enter { opportunity: opp.clone() }, &opp, ok)
    }

    #[test]
    fn test_enter_opens_and_refreshes() {
        let markets = make_markets();
        let book = track(&PositionSlice::default(), &[enter("p1", true)], &markets, at(0), dec!(0.01));
        let p = &book.active_positions["p1"];
        assert_eq!(p.supplied_amount, dec!(10000));
        assert_eq!(p.current_apy, dec!(0.02));
        assert_eq!(p.ltv, dec!(0.5));
        assert!(p.health_factor < MAX_HEALTH_FACTOR);
        assert!(book.stale_positions.is_empty());
        assert_eq!(book.last_tracking_utc, Some(at(0)));
    }

    #[test]
    fn test_failed_execution_ignored() {
        let markets = make_markets();
        let book = track(&PositionSlice::default(), &[enter("p1", false)], &markets, at(0), dec!(0.01));
        assert!(book.active_positions.is_empty());
    }

    #[test]
    fn test_exit_realizes_pnl() {
        let markets = make_markets();
        let mut book = track(&PositionSlice::default(), &[enter("p1", true)], &markets, at(0), dec!(0.01));
        book.active_positions.get_mut("p1").unwrap().pnl_usd = dec!(42);

        let opp = make_opportunity("f1");
        let exit = make_execution("p1", IntentKind::Exit { reason: ExitReason::LowYield }, &opp, true);
        let book = track(&book, &[exit], &markets, at(60), dec!(0.01));
        assert!(book.active_positions.is_empty());
        assert_eq!(book.realized_pnl_usd, dec!(42));
    }

    #[test]
    fn test_migrate_moves_capital_to_target() {
        let mut markets = make_markets();
        markets.push(UnifiedMarketData {
            market_id: "f2".into(),
            ..markets[1].clone()
        });
        let book = track(&PositionSlice::default(), &[enter("p1", true)], &markets, at(0), dec!(0.01));

        let target = make_opportunity("f2");
        let migrate = make_execution("p1", IntentKind::Migrate { target: target.clone() }, &target, true);
        let book = track(&book, &[migrate], &markets, at(0), dec!(0.01));

        let new_id = position_id(1, &target.supply_key(), &target.borrow_key());
        assert!(!book.active_positions.contains_key("p1"));
        let moved = &book.active_positions[&new_id];
        assert_eq!(moved.supply_market_id, "f2");
        assert_eq!(moved.supplied_amount, dec!(10000));
    }

    #[test]
    fn test_missing_leg_marks_stale() {
        let markets = make_markets();
        let book = track(&PositionSlice::default(), &[enter("p1", true)], &markets, at(0), dec!(0.01));
        let before = book.active_positions["p1"].clone();

        let only_aave: Vec<_> = markets.into_iter().filter(|m| m.protocol_name == "aavev3").collect();
        let book = track(&book, &[], &only_aave, at(3600), dec!(0.01));
        assert_eq!(book.stale_positions, vec!["p1".to_string()]);
        assert_eq!(book.active_positions["p1"], before);
    }

    #[tokio::test]
    async fn test_round_warns_on_stale() {
        let round = PositionTrackingRound::new(make_ctx());
        let mut state = state_with_markets(Vec::new());
        commit(&mut state, TransactionSlice { executions: vec![enter("p1", true)] });
        let payload = round.propose(ParticipantId(0), &state).await.unwrap();
        let (slice, event) = round.apply(&state, &payload).unwrap();
        assert_eq!(event, Event::DoneWithWarnings);
        assert_eq!(slice.stale_positions.len(), 1);
    }

    #[tokio::test]
    async fn test_round_requires_observation_time() {
        let round = PositionTrackingRound::new(make_ctx());
        let result = round.propose(ParticipantId(0), &SharedState::new()).await;
        assert!(matches!(
            result,
            Err(RoundError::Pipeline(PipelineError::InternalFault(_)))
        ));
    }
}
