//! reqwest-backed collaborators.
//!
//! `HttpMarketFetcher` GETs REST sources and POSTs the configured GraphQL
//! query to subgraph sources. `RpcGasOracle` asks a JSON-RPC node for
//! `eth_gasPrice`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{FetchOutcome, GasPriceOracle, GasQuote, GasSource, MarketDataFetcher};
use crate::config::{AppConfig, SourceConfig};
use crate::types::SourceType;

const USER_AGENT: &str = "YIELDARB/0.1.0 (yield-arbitrage-agent)";

/// Wei per gwei, as a decimal scale.
const GWEI_SCALE: u32 = 9;

fn build_client(timeout: Duration, name: &str) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .with_context(|| format!("Failed to build HTTP client for {name}"))
}

/// 429 and 5xx are worth another attempt; other statuses are not.
fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

pub struct HttpMarketFetcher {
    http: Client,
}

impl HttpMarketFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(request_timeout, "market data")?,
        })
    }

    fn request(&self, source: &SourceConfig) -> RequestBuilder {
        let builder = match (source.source_type, source.query.as_deref()) {
            (SourceType::Subgraph, Some(query)) => {
                self.http.post(&source.url).json(&json!({ "query": query }))
            }
            _ => self.http.get(&source.url),
        };
        match bearer_token(source) {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

/// Token named by `api_key_env`, when configured and set.
fn bearer_token(source: &SourceConfig) -> Option<SecretString> {
    let env = source.api_key_env.as_deref()?;
    match AppConfig::resolve_env(env) {
        Ok(value) => Some(SecretString::new(value)),
        Err(e) => {
            warn!(protocol = %source.protocol, error = %e, "API key missing, sending unauthenticated");
            None
        }
    }
}

#[async_trait]
impl MarketDataFetcher for HttpMarketFetcher {
    async fn fetch(&self, source: &SourceConfig) -> FetchOutcome {
        debug!(protocol = %source.protocol, url = %source.url, "Fetching market data");

        let response = match self.request(source).send().await {
            Ok(r) => r,
            Err(e) => return FetchOutcome::failure(format!("Request error: {e}"), true),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return FetchOutcome::failure(format!("HTTP {status}: {body}"), is_retryable(status));
        }

        match response.json::<Value>().await {
            Ok(payload) => match graphql_errors(&payload) {
                Some(errors) => FetchOutcome::failure(format!("GraphQL errors: {errors}"), false),
                None => FetchOutcome::Success(payload),
            },
            Err(e) => FetchOutcome::failure(format!("Invalid JSON body: {e}"), false),
        }
    }
}

/// Subgraphs answer 200 with an `errors` array on bad queries.
fn graphql_errors(payload: &Value) -> Option<&Value> {
    payload
        .get("errors")
        .filter(|e| e.as_array().is_some_and(|a| !a.is_empty()))
}

// ---------------------------------------------------------------------------
// Gas price
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

pub struct RpcGasOracle {
    http: Client,
    rpc_url: String,
}

impl RpcGasOracle {
    pub fn new(rpc_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(request_timeout, "gas oracle")?,
            rpc_url: rpc_url.into(),
        })
    }
}

/// `"0x5f5e100"` wei → 0.1 gwei.
pub fn parse_gas_price_hex(hex_wei: &str) -> Result<Decimal> {
    let digits = hex_wei.trim_start_matches("0x");
    let wei = u128::from_str_radix(digits, 16)
        .with_context(|| format!("Invalid eth_gasPrice result: {hex_wei}"))?;
    let wei = i128::try_from(wei).context("Gas price out of range")?;
    Decimal::try_from_i128_with_scale(wei, GWEI_SCALE)
        .map(|d| d.normalize())
        .context("Gas price out of range")
}

#[async_trait]
impl GasPriceOracle for RpcGasOracle {
    async fn gas_quote(&self) -> Result<GasQuote> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "eth_gasPrice",
            "params": [],
            "id": 1,
        });
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .context("eth_gasPrice request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("eth_gasPrice error {status}: {text}");
        }

        let rpc: RpcResponse = response
            .json()
            .await
            .context("Failed to parse eth_gasPrice response")?;
        if let Some(error) = rpc.error {
            anyhow::bail!("eth_gasPrice returned error: {error}");
        }
        let result = rpc.result.context("eth_gasPrice response has no result")?;

        Ok(GasQuote {
            gas_price_gwei: parse_gas_price_hex(&result)?,
            source: GasSource::Rpc,
        })
    }
}
