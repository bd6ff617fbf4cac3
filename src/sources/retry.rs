//! Retry with exponential backoff around a single fetcher.

use tracing::{debug, warn};

use super::{FetchOutcome, MarketDataFetcher};
use crate::config::{CollectionConfig, SourceConfig};

/// Final outcome of a source plus how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted {
    pub outcome: FetchOutcome,
    pub attempts: u32,
}

/// Fetch `source` up to `config.attempts` times.
///
/// Each attempt is bounded by the request timeout. Only retryable
/// failures are retried; the delay before attempt `n` is
/// `base_delay * backoff_factor^(n-1)`.
pub async fn fetch_with_retry(
    fetcher: &dyn MarketDataFetcher,
    source: &SourceConfig,
    config: &CollectionConfig,
) -> Attempted {
    let max_attempts = config.attempts.max(1);
    let mut last = FetchOutcome::failure("not attempted", false);

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = config.backoff_delay(attempt);
            debug!(
                protocol = %source.protocol,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying source"
            );
            tokio::time::sleep(delay).await;
        }

        let outcome = match tokio::time::timeout(config.request_timeout(), fetcher.fetch(source)).await {
            Ok(outcome) => outcome,
            Err(_) => FetchOutcome::failure(
                format!("Timed out after {}s", config.request_timeout_secs),
                true,
            ),
        };

        if let FetchOutcome::Failure { message, retryable } = &outcome {
            warn!(protocol = %source.protocol, attempt, retryable, error = %message, "Source fetch failed");
        }
        if !outcome.is_retryable() {
            return Attempted {
                outcome,
                attempts: attempt + 1,
            };
        }
        last = outcome;
    }

    Attempted {
        outcome: last,
        attempts: max_attempts,
    }
}
