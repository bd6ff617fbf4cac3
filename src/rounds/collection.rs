//! Data collection: fetch every configured source concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{smallest_digest, RoundContext};
use crate::config::{CollectionConfig, ConsensusConfig, SourceConfig};
use crate::engine::consensus::{ParticipantId, Reduction};
use crate::engine::{Round, RoundError};
use crate::sources::retry::fetch_with_retry;
use crate::sources::FetchOutcome;
use crate::state::{CollectionSlice, CollectionStatus, SharedState};
use crate::types::{Event, PipelineError, RawSourceRecord, RoundKind, SourceStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionPayload {
    /// One record per configured source, in config order.
    pub records: Vec<RawSourceRecord>,
    pub collected_at: DateTime<Utc>,
}

pub struct DataCollectionRound {
    ctx: Arc<RoundContext>,
}

impl DataCollectionRound {
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        Self { ctx }
    }

    async fn collect_source(&self, source: &SourceConfig) -> RawSourceRecord {
        let cfg = &self.ctx.config.collection;
        let fetch = fetch_with_retry(self.ctx.fetcher.as_ref(), source, cfg);
        let (outcome, attempts) = match tokio::time::timeout(source_budget(cfg), fetch).await {
            Ok(attempted) => (attempted.outcome, attempted.attempts),
            Err(_) => (FetchOutcome::failure("Source budget exhausted", true), cfg.attempts),
        };

        let collection_time = self.ctx.clock.now();
        let (status, raw_payload, error_message) = match outcome {
            FetchOutcome::Success(payload) => (SourceStatus::Success, Some(payload), None),
            FetchOutcome::Failure { message, .. } => (SourceStatus::Failure, None, Some(message)),
        };
        RawSourceRecord {
            protocol_name: source.protocol.clone(),
            chain_id: source.chain_id,
            source_type: source.source_type,
            status,
            collection_time,
            raw_payload,
            error_message,
            attempts,
        }
    }
}

/// Longest one source may take: every attempt timing out plus every
/// backoff delay.
fn source_budget(cfg: &CollectionConfig) -> Duration {
    let attempts = cfg.attempts.max(1);
    let delays: Duration = (1..attempts).map(|n| cfg.backoff_delay(n)).sum();
    cfg.request_timeout() * attempts + delays
}

/// Split failures by criticality and pick the round's event.
pub fn classify(records: &[RawSourceRecord], sources: &[SourceConfig]) -> (CollectionStatus, Event) {
    let mut status = CollectionStatus::default();
    for (record, source) in records.iter().zip(sources) {
        if record.is_success() {
            status.succeeded += 1;
        } else if source.critical {
            status.failed_critical.push(record.protocol_name.clone());
        } else {
            status.failed_non_critical.push(record.protocol_name.clone());
        }
    }

    let event = if !status.failed_critical.is_empty() {
        Event::FetchFailed
    } else if !status.failed_non_critical.is_empty() {
        Event::DoneWithWarnings
    } else {
        Event::Done
    };
    (status, event)
}

#[async_trait]
impl Round for DataCollectionRound {
    type Payload = CollectionPayload;
    type Slice = CollectionSlice;

    const KIND: RoundKind = RoundKind::DataCollection;

    fn reduction(&self, consensus: &ConsensusConfig) -> Reduction {
        smallest_digest(consensus)
    }

    async fn propose(
        &self,
        participant: ParticipantId,
        _state: &SharedState,
    ) -> Result<CollectionPayload, RoundError> {
        let sources = &self.ctx.config.collection.sources;
        let records = join_all(sources.iter().map(|s| self.collect_source(s))).await;
        info!(
            participant = %participant,
            sources = records.len(),
            succeeded = records.iter().filter(|r| r.is_success()).count(),
            "Sources collected"
        );
        Ok(CollectionPayload {
            records,
            collected_at: self.ctx.clock.now(),
        })
    }

    fn apply(
        &self,
        state: &SharedState,
        payload: &CollectionPayload,
    ) -> Result<(CollectionSlice, Event), RoundError> {
        let sources = &self.ctx.config.collection.sources;
        if payload.records.len() != sources.len() {
            return Err(PipelineError::InternalFault(format!(
                "{} records for {} configured sources",
                payload.records.len(),
                sources.len()
            ))
            .into());
        }

        for record in payload.records.iter().filter(|r| !r.is_success()) {
            let failure = PipelineError::SourceFailure {
                source_name: record.protocol_name.clone(),
                message: record.error_message.clone().unwrap_or_default(),
            };
            warn!(attempts = record.attempts, "{failure}");
        }

        let (status, event) = classify(&payload.records, sources);
        let last_successful_collection_utc = if event == Event::FetchFailed {
            let failure = PipelineError::CriticalFetchFailure {
                sources: status.failed_critical.clone(),
            };
            warn!("{failure}");
            state.collection().last_successful_collection_utc
        } else {
            Some(payload.collected_at)
        };

        info!(
            succeeded = status.succeeded,
            failed_critical = status.failed_critical.len(),
            failed_non_critical = status.failed_non_critical.len(),
            event = %event,
            "Data collection complete"
        );

        Ok((
            CollectionSlice {
                raw_market_data_sources: payload.records.clone(),
                data_collection_cycle_status: Some(status),
                last_successful_collection_utc,
            },
            event,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
