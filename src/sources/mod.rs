//! External data collaborators.
//!
//! Rounds only see these traits. [`http`] holds the reqwest-backed
//! implementations; [`retry`] wraps a fetcher with the configured
//! timeout and backoff.

pub mod http;
pub mod retry;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SourceConfig;

/// Result of one fetch attempt. Fetchers never return `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(Value),
    Failure {
        message: String,
        /// Rate limits, server errors, timeouts and transport errors.
        retryable: bool,
    },
}

impl FetchOutcome {
    pub fn failure(message: impl Into<String>, retryable: bool) -> Self {
        FetchOutcome::Failure {
            message: message.into(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchOutcome::Failure { retryable: true, .. })
    }
}

/// Fetches one protocol's raw market payload.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceConfig) -> FetchOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasSource {
    Rpc,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GasQuote {
    pub gas_price_gwei: Decimal,
    pub source: GasSource,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GasPriceOracle: Send + Sync {
    async fn gas_quote(&self) -> Result<GasQuote>;
}

/// Always quotes the configured price.
pub struct StaticGasOracle {
    gas_price_gwei: Decimal,
}

impl StaticGasOracle {
    pub fn new(gas_price_gwei: Decimal) -> Self {
        Self { gas_price_gwei }
    }
}

#[async_trait]
impl GasPriceOracle for StaticGasOracle {
    async fn gas_quote(&self) -> Result<GasQuote> {
        Ok(GasQuote {
            gas_price_gwei: self.gas_price_gwei,
            source: GasSource::Static,
        })
    }
}
