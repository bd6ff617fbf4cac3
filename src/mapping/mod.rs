//! Protocol mapping registry.
//!
//! A closed set of supported protocols, each bound to the normalizer for
//! the payload format its source serves. Normalizers turn one raw source
//! record into zero or more `UnifiedMarketData` with gross rates only;
//! fees, utilization and cost estimates are applied by preprocessing.

pub mod aave;
pub mod compound;
pub mod fluid;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{RawSourceRecord, UnifiedMarketData};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    AaveV3,
    Fluid,
    CompoundV3,
}

impl Protocol {
    pub const ALL: &'static [Protocol] = &[Protocol::AaveV3, Protocol::Fluid, Protocol::CompoundV3];

    /// Registry name as used in config and in `protocol_name` fields.
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::AaveV3 => "aavev3",
            Protocol::Fluid => "fluid",
            Protocol::CompoundV3 => "compoundv3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Map a successful record through this protocol's normalizer.
    pub fn normalize(&self, record: &RawSourceRecord) -> Result<MappedMarkets, MappingError> {
        let payload = record
            .raw_payload
            .as_ref()
            .ok_or(MappingError::MissingPayload)?;
        match self {
            Protocol::AaveV3 => aave::normalize(record, payload),
            Protocol::Fluid => fluid::normalize(record, payload),
            Protocol::CompoundV3 => compound::normalize(record, payload),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Resolve a record's protocol and normalize it. Unknown protocol names
/// are rejected rather than skipped.
pub fn normalize_record(record: &RawSourceRecord) -> Result<MappedMarkets, MappingError> {
    let protocol = Protocol::from_name(&record.protocol_name)
        .ok_or_else(|| MappingError::UnsupportedProtocol(record.protocol_name.clone()))?;
    protocol.normalize(record)
}

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Markets extracted from one record, plus the ones that were skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedMarkets {
    pub markets: Vec<UnifiedMarketData>,
    /// `(market_id, reason)` for markets missing required fields.
    pub skipped: Vec<(String, String)>,
}

impl MappedMarkets {
    pub(crate) fn push(&mut self, market_id: &str, built: Result<UnifiedMarketData, String>) {
        match built {
            Ok(m) => self.markets.push(m),
            Err(reason) => self.skipped.push((market_id.to_string(), reason)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MappingError {
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Record has no payload")]
    MissingPayload,

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Parse a decimal from plain or scientific notation.
pub(crate) fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Deserialize an optional decimal that sources send either as a JSON
/// number or as a string.
pub(crate) fn flex_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => parse_decimal(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("not a number: {s}"))),
        Some(serde_json::Value::Number(n)) => parse_decimal(&n.to_string())
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("number out of range: {n}"))),
        Some(other) => Err(D::Error::custom(format!("expected number, got {other}"))),
    }
}

pub(crate) fn required(value: Option<Decimal>, field: &str) -> Result<Decimal, String> {
    value.ok_or_else(|| format!("missing {field}"))
}

/// Largest USD total accepted from a source.
pub(crate) const MAX_USD: Decimal = dec!(1_000_000_000_000_000);
/// Largest annual rate accepted from a source, as a ratio.
pub(crate) const MAX_APY: Decimal = dec!(1000);
/// Collateral parameters are ratios of supplied value.
pub(crate) const MAX_RATIO: Decimal = Decimal::ONE;

/// Check a converted value lies in `[0, max]`.
pub(crate) fn bounded(value: Decimal, field: &str, max: Decimal) -> Result<Decimal, String> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(format!("negative {field}: {value}"));
    }
    if value > max {
        return Err(format!("{field} out of range: {value}"));
    }
    Ok(value)
}

/// Convert a source unit (bps, ray, percent) into a ratio.
pub(crate) fn scaled(value: Decimal, unit: Decimal, field: &str) -> Result<Decimal, String> {
    value
        .checked_div(unit)
        .ok_or_else(|| format!("{field} overflows: {value}"))
}

/// Pull the array at `path` (e.g. `["data", "reserves"]`) out of a payload.
pub(crate) fn array_at<'a>(
    payload: &'a serde_json::Value,
    path: &[&str],
) -> Result<&'a Vec<serde_json::Value>, MappingError> {
    let mut cursor = payload;
    for key in path {
        cursor = cursor
            .get(key)
            .ok_or_else(|| MappingError::Malformed(format!("missing '{}'", path.join("."))))?;
    }
    cursor
        .as_array()
        .ok_or_else(|| MappingError::Malformed(format!("'{}' is not an array", path.join("."))))
}

#[cfg(test)]
pub(crate) fn make_record(protocol: &str, payload: serde_json::Value) -> RawSourceRecord {
    use crate::types::{SourceStatus, SourceType};
    RawSourceRecord {
        protocol_name: protocol.to_string(),
        chain_id: 42161,
        source_type: SourceType::Api,
        status: SourceStatus::Success,
        collection_time: chrono::DateTime::<chrono::Utc>::from_timestamp(1_760_000_000, 0)
            .unwrap_or_default(),
        raw_payload: Some(payload),
        error_message: None,
        attempts: 1,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
