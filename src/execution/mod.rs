//! Transaction execution.
//!
//! Signing and broadcasting live behind [`TransactionExecutor`]. The only
//! implementation here is the dry-run executor, which logs what it would
//! send and confirms it.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::types::{IdempotencyKey, TxIntent, TxOutcome};

/// Submits one intent. Submitting the same idempotency key again must
/// return the first outcome without sending anything.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    async fn submit(&self, intent: &TxIntent) -> TxOutcome;
}

#[derive(Default)]
struct Ledger {
    outcomes: HashMap<IdempotencyKey, TxOutcome>,
    next_nonce: u64,
}

/// Confirms every intent without touching a chain.
#[derive(Default)]
pub struct DryRunExecutor {
    ledger: Mutex<Ledger>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct intents sent so far.
    pub async fn submitted(&self) -> usize {
        self.ledger.lock().await.outcomes.len()
    }
}

#[async_trait]
impl TransactionExecutor for DryRunExecutor {
    async fn submit(&self, intent: &TxIntent) -> TxOutcome {
        let mut ledger = self.ledger.lock().await;
        if let Some(outcome) = ledger.outcomes.get(&intent.key) {
            debug!(key = %intent.key, "Intent already submitted, returning cached outcome");
            return outcome.clone();
        }

        let nonce = ledger.next_nonce;
        ledger.next_nonce += 1;
        let tx_hash = format!("0x{}", uuid::Uuid::new_v4().simple());

        info!(
            key = %intent.key,
            supply = %format!("{}:{}", intent.supply_protocol, intent.supply_market_id),
            borrow = %format!("{}:{}", intent.borrow_protocol, intent.borrow_market_id),
            supply_usd = %intent.supply_amount_usd,
            borrow_usd = %intent.borrow_amount_usd,
            nonce,
            "[DRY RUN] Would submit transaction"
        );

        let outcome = TxOutcome::success(tx_hash, Some(nonce));
        ledger.outcomes.insert(intent.key.clone(), outcome.clone());
        outcome
    }
}
