//! Reset: close the cycle. Summarises the journal, advances the cycle
//! counter and, on commit, clears every per-cycle key.

use async_trait::async_trait;
use tracing::{info, warn};

use super::matching;
use crate::config::ConsensusConfig;
use crate::engine::consensus::{ParticipantId, Reduction};
use crate::engine::{Round, RoundError};
use crate::state::{CycleSlice, Journal, SharedState};
use crate::types::{CycleSummary, Event, RoundKind};

#[derive(Debug, Default)]
pub struct ResetRound;

/// Summary of the cycle recorded so far. A failure ends the cycle, so the
/// first failing entry is the terminal one when there is any.
pub fn summarize(cycle_id: u64, journal: &Journal) -> CycleSummary {
    let terminal = journal.first_failure().or_else(|| journal.last());
    CycleSummary {
        cycle_id,
        terminal_round: terminal.map(|e| e.round),
        terminal_event: terminal.map(|e| e.event),
        rounds_run: journal.entries().len(),
        warnings: journal.warnings(),
    }
}

pub fn next_cycle(state: &SharedState) -> CycleSlice {
    let current = state.cycle();
    CycleSlice {
        cycle_id: current.cycle_id + 1,
        completed_cycles: current.completed_cycles + 1,
        last_cycle: Some(summarize(current.cycle_id, state.journal())),
    }
}

#[async_trait]
impl Round for ResetRound {
    type Payload = CycleSlice;
    type Slice = CycleSlice;

    const KIND: RoundKind = RoundKind::Reset;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction {
        matching(consensus)
    }

    async fn propose(&self, _participant: ParticipantId, state: &SharedState) -> Result<CycleSlice, RoundError> {
        Ok(next_cycle(state))
    }

    fn apply(&self, _state: &SharedState, payload: &CycleSlice) -> Result<(CycleSlice, Event), RoundError> {
        if let Some(summary) = &payload.last_cycle {
            if summary.succeeded() {
                info!(
                    cycle = summary.cycle_id,
                    rounds = summary.rounds_run,
                    warnings = summary.warnings,
                    "{summary}"
                );
            } else {
                warn!(
                    cycle = summary.cycle_id,
                    rounds = summary.rounds_run,
                    "{summary}"
                );
            }
        }
        Ok((payload.clone(), Event::Done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rounds::fixtures::{commit, make_markets, state_with_markets};
    use crate::state::{PositionSlice, RankingSlice};
    use rust_decimal_macros::dec;

    #[test]
    fn test_summary_of_clean_cycle() {
        let mut state = SharedState::new();
        state.record(RoundKind::DataCollection, Event::Done);
        state.record(RoundKind::Preprocessing, Event::DoneWithWarnings);
        state.record(RoundKind::Rebalancing, Event::Done);
        let summary = summarize(1, state.journal());
        assert_eq!(summary.terminal_round, Some(RoundKind::Rebalancing));
        assert_eq!(summary.terminal_event, Some(Event::Done));
        assert_eq!(summary.rounds_run, 3);
        assert_eq!(summary.warnings, 1);
        assert!(summary.succeeded());
    }

    #[test]
    fn test_summary_of_failed_cycle() {
        let mut state = SharedState::new();
        state.record(RoundKind::DataCollection, Event::FetchFailed);
        let summary = summarize(4, state.journal());
        assert_eq!(summary.cycle_id, 4);
        assert_eq!(summary.terminal_round, Some(RoundKind::DataCollection));
        assert_eq!(summary.terminal_event, Some(Event::FetchFailed));
        assert!(!summary.succeeded());
    }

    #[test]
    fn test_empty_journal() {
        let summary = summarize(1, &Journal::default());
        assert_eq!(summary.rounds_run, 0);
        assert!(summary.terminal_event.is_none());
    }

    #[tokio::test]
    async fn test_commit_clears_per_cycle_keys() {
        let round = ResetRound;
        let mut state = state_with_markets(make_markets());
        let evaluated_at = state.preprocessing().last_preprocessing_utc;
        commit(
            &mut state,
            RankingSlice {
                ranked_opportunities: Vec::new(),
                evaluated_at,
            },
        );
        commit(
            &mut state,
            PositionSlice {
                realized_pnl_usd: dec!(12),
                stale_positions: vec!["p1".into()],
                ..Default::default()
            },
        );
        state.record(RoundKind::Rebalancing, Event::Done);

        let payload = round.propose(ParticipantId(0), &state).await.unwrap();
        let (slice, event) = round.apply(&state, &payload).unwrap();
        assert_eq!(event, Event::Done);
        commit(&mut state, slice);

        assert_eq!(state.cycle().cycle_id, 2);
        assert_eq!(state.cycle().completed_cycles, 1);
        assert_eq!(state.cycle().last_cycle.as_ref().unwrap().rounds_run, 1);
        assert!(state.preprocessing().unified_markets.is_empty());
        assert!(state.preprocessing().last_preprocessing_utc.is_some());
        assert!(state.ranking().evaluated_at.is_none());
        assert!(state.positions().stale_positions.is_empty());
        assert_eq!(state.positions().realized_pnl_usd, dec!(12));
        assert!(state.journal().entries().is_empty());
    }
}
