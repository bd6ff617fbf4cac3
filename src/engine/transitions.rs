//! Static transition table.
//!
//! `DONE` and `DONE_WITH_WARNINGS` advance along the cycle; every other
//! event routes to Reset, and Reset always re-enters DataCollection on
//! success.

use crate::types::{Event, RoundKind};

/// Round that follows `round` on a successful event.
fn successor(round: RoundKind) -> RoundKind {
    match round {
        RoundKind::DataCollection => RoundKind::Preprocessing,
        RoundKind::Preprocessing => RoundKind::OpportunityRanking,
        RoundKind::OpportunityRanking => RoundKind::Allocation,
        RoundKind::Allocation => RoundKind::TransactionConstruction,
        RoundKind::TransactionConstruction => RoundKind::PositionTracking,
        RoundKind::PositionTracking => RoundKind::Rebalancing,
        RoundKind::Rebalancing => RoundKind::Reset,
        RoundKind::Reset => RoundKind::DataCollection,
    }
}

pub fn next_round(round: RoundKind, event: Event) -> RoundKind {
    match event {
        Event::Done | Event::DoneWithWarnings => successor(round),
        Event::FetchFailed
        | Event::PreprocessingFailed
        | Event::Error
        | Event::Timeout => RoundKind::Reset,
    }
}
