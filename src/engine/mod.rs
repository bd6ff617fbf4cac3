//! Round engine: runs one round at a time, collects participant votes,
//! reduces them to a canonical payload, applies it and transitions.
//!
//! Every failure inside a round becomes an event. Nothing escapes
//! [`Engine::step`]; the engine always transitions.

pub mod consensus;
pub mod transitions;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ConsensusConfig};
use crate::health::{HealthReport, HealthReporter};
use crate::rounds::Rounds;
use crate::state::{SharedState, Slice};
use crate::types::{CycleSummary, Event, PipelineError, RoundKind};
use consensus::{NoAgreement, ParticipantId, Reducer, Reduction, Vote};

/// Upper bound on steps in one `run_cycle` call. A healthy cycle takes
/// at most one pass through every round.
const MAX_STEPS_PER_CYCLE: usize = 32;

// ---------------------------------------------------------------------------
// Round contract
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RoundError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("{0}")]
    Collaborator(#[from] anyhow::Error),
}

/// One step of the cycle.
///
/// `propose` may suspend on external I/O and captures wall-clock values
/// into the payload. `apply` is synchronous and deterministic: it reads
/// only the shared state and the agreed payload.
#[async_trait]
pub trait Round: Send + Sync {
    type Payload: Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + Sync;
    type Slice: Slice;

    const KIND: RoundKind;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction;

    async fn propose(
        &self,
        participant: ParticipantId,
        state: &SharedState,
    ) -> Result<Self::Payload, RoundError>;

    fn apply(
        &self,
        state: &SharedState,
        payload: &Self::Payload,
    ) -> Result<(Self::Slice, Event), RoundError>;
}

/// What one `step` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOutcome {
    pub round: RoundKind,
    pub event: Event,
    pub next_round: RoundKind,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config: Arc<AppConfig>,
    rounds: Rounds,
    health: Arc<dyn HealthReporter>,
    state: SharedState,
    current: RoundKind,
    cycle_started: Option<Instant>,
    last_cycle_duration: Option<Duration>,
}

impl Engine {
    pub fn new(config: Arc<AppConfig>, rounds: Rounds, health: Arc<dyn HealthReporter>) -> Self {
        Self::restore(config, rounds, health, SharedState::new(), RoundKind::DataCollection)
    }

    /// Resume from a snapshot at the round that was due to run next.
    pub fn restore(
        config: Arc<AppConfig>,
        rounds: Rounds,
        health: Arc<dyn HealthReporter>,
        state: SharedState,
        next_round: RoundKind,
    ) -> Self {
        health.publish(HealthReport::starting(next_round, state.cycle().completed_cycles));
        Self {
            config,
            rounds,
            health,
            state,
            current: next_round,
            cycle_started: None,
            last_cycle_duration: None,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Round that the next `step` will run.
    pub fn current_round(&self) -> RoundKind {
        self.current
    }

    /// Run one round to completion and commit its slice when it agreed.
    ///
    /// Does not transition; see [`Engine::step`].
    pub async fn run_round(&mut self, round: RoundKind, timeout: Duration) -> (&SharedState, Event) {
        let participants = self.config.consensus.participants;
        let consensus = &self.config.consensus;
        let state = &mut self.state;
        let event = match round {
            RoundKind::DataCollection => {
                drive(&self.rounds.collection, state, consensus, participants, timeout).await
            }
            RoundKind::Preprocessing => {
                drive(&self.rounds.preprocessing, state, consensus, participants, timeout).await
            }
            RoundKind::OpportunityRanking => {
                drive(&self.rounds.ranking, state, consensus, participants, timeout).await
            }
            RoundKind::Allocation => {
                drive(&self.rounds.allocation, state, consensus, participants, timeout).await
            }
            RoundKind::TransactionConstruction => {
                drive(&self.rounds.transactions, state, consensus, participants, timeout).await
            }
            RoundKind::PositionTracking => {
                drive(&self.rounds.tracking, state, consensus, participants, timeout).await
            }
            RoundKind::Rebalancing => {
                drive(&self.rounds.rebalancing, state, consensus, participants, timeout).await
            }
            RoundKind::Reset => {
                drive(&self.rounds.reset, state, consensus, participants, timeout).await
            }
        };
        (&self.state, event)
    }

    /// Run the current round, then move to the round the transition
    /// table names for its event.
    pub async fn step(&mut self) -> RoundOutcome {
        let round = self.current;
        if round == RoundKind::DataCollection || self.cycle_started.is_none() {
            self.cycle_started = Some(Instant::now());
        }

        let timeout = self.config.rounds.timeout_for(round);
        let (_, event) = self.run_round(round, timeout).await;
        let next_round = transitions::next_round(round, event);

        if round == RoundKind::Reset && !event.is_failure() {
            self.last_cycle_duration = self.cycle_started.take().map(|t| t.elapsed());
        }
        self.current = next_round;

        if event.is_failure() {
            warn!(round = %round, event = %event, next = %next_round, "Round failed");
        } else {
            debug!(round = %round, event = %event, next = %next_round, "Transition");
        }

        self.health.publish(HealthReport {
            current_round: next_round,
            cycle_count: self.state.cycle().completed_cycles,
            last_event: Some(event),
            last_cycle_duration: self.last_cycle_duration,
            last_transition_at: Some(chrono::Utc::now()),
        });

        RoundOutcome {
            round,
            event,
            next_round,
        }
    }

    /// Step until Reset has committed, calling `on_round` after each
    /// round. Returns the summary Reset wrote, or `None` when the step
    /// bound ran out first.
    pub async fn run_cycle_with<F>(&mut self, mut on_round: F) -> Option<CycleSummary>
    where
        F: FnMut(&Engine, &RoundOutcome),
    {
        for _ in 0..MAX_STEPS_PER_CYCLE {
            let outcome = self.step().await;
            on_round(&*self, &outcome);
            if outcome.round == RoundKind::Reset && !outcome.event.is_failure() {
                return self.state.cycle().last_cycle.clone();
            }
        }
        error!(
            round = %self.current,
            steps = MAX_STEPS_PER_CYCLE,
            "Cycle did not complete"
        );
        None
    }

    pub async fn run_cycle(&mut self) -> Option<CycleSummary> {
        self.run_cycle_with(|_, _| {}).await
    }
}

// ---------------------------------------------------------------------------
// Round driver
// ---------------------------------------------------------------------------

/// Why no canonical payload came out of the vote.
enum Failed {
    Timeout,
    Error,
}

/// Collect votes until agreement or the deadline, apply, and commit.
async fn drive<R: Round>(
    round: &R,
    state: &mut SharedState,
    consensus: &ConsensusConfig,
    participants: usize,
    timeout: Duration,
) -> Event {
    let reduction = round.reduction(consensus);
    let agreed = collect(round, state, reduction, participants, timeout).await;

    let event = match agreed {
        Ok(payload) => match round.apply(state, &payload) {
            Ok((slice, event)) => {
                state.record(R::KIND, event);
                state.commit(slice);
                info!(round = %R::KIND, event = %event, version = state.version(), "Round committed");
                return event;
            }
            Err(e) => {
                error!(round = %R::KIND, error = %e, "Apply failed");
                Event::Error
            }
        },
        Err(Failed::Timeout) => Event::Timeout,
        Err(Failed::Error) => Event::Error,
    };
    state.record(R::KIND, event);
    event
}

async fn collect<R: Round>(
    round: &R,
    state: &SharedState,
    reduction: Reduction,
    participants: usize,
    timeout: Duration,
) -> Result<R::Payload, Failed> {
    let deadline = Instant::now() + timeout;
    let mut pending: FuturesUnordered<_> = (0..participants)
        .map(ParticipantId)
        .map(|p| async move { (p, round.propose(p, state).await) })
        .collect();

    let mut votes: Vec<Vote<R::Payload>> = Vec::with_capacity(participants);
    let mut errors = 0usize;
    let mut last_miss: Option<NoAgreement> = None;

    loop {
        match tokio::time::timeout_at(deadline, pending.next()).await {
            Err(_) => {
                let err = PipelineError::AgreementTimeout {
                    round: R::KIND,
                    received: votes.len(),
                    required: last_miss.as_ref().map_or(participants, |m| m.required),
                };
                warn!(
                    round = %R::KIND,
                    timeout_secs = timeout.as_secs(),
                    error = %err,
                    "Round timed out"
                );
                return Err(Failed::Timeout);
            }
            Ok(None) => {
                // Every participant answered and still no agreement.
                let miss = last_miss.unwrap_or(NoAgreement {
                    received: votes.len(),
                    best: 0,
                    required: participants,
                });
                warn!(
                    round = %R::KIND,
                    reduction = %reduction,
                    errors,
                    reason = %miss,
                    "Participants did not agree"
                );
                return if errors > 0 && votes.len() < miss.required {
                    Err(Failed::Error)
                } else {
                    Err(Failed::Timeout)
                };
            }
            Ok(Some((participant, Err(e)))) => {
                errors += 1;
                warn!(round = %R::KIND, participant = %participant, error = %e, "Proposal failed");
            }
            Ok(Some((participant, Ok(payload)))) => {
                match Vote::new(participant, payload) {
                    Ok(vote) => votes.push(vote),
                    Err(e) => {
                        errors += 1;
                        warn!(round = %R::KIND, participant = %participant, error = %e, "Payload not encodable");
                        continue;
                    }
                }
                match reduction.reduce(&votes, participants) {
                    Ok(vote) => {
                        debug!(
                            round = %R::KIND,
                            reduction = %reduction,
                            votes = votes.len(),
                            digest = %vote.digest,
                            "Agreement reached"
                        );
                        return Ok(vote.payload.clone());
                    }
                    Err(miss) => last_miss = Some(miss),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
