//! Token registry.
//!
//! Maps protocol receipt tokens (`aArbUSDC`, `fUSDC`, ...) to their
//! underlying asset, classifies assets for risk scoring, and carries the
//! Arbitrum addresses and decimals of the assets the agent trades.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Asset classes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Stablecoin,
    EthCorrelated,
    BtcCorrelated,
    Other,
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetClass::Stablecoin => write!(f, "stablecoin"),
            AssetClass::EthCorrelated => write!(f, "eth_correlated"),
            AssetClass::BtcCorrelated => write!(f, "btc_correlated"),
            AssetClass::Other => write!(f, "other"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry tables
// ---------------------------------------------------------------------------

/// A receipt token and what it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenMapping {
    pub platform_token: &'static str,
    pub underlying: &'static str,
    pub asset_class: AssetClass,
    pub decimals: u8,
}

const fn mapping(
    platform_token: &'static str,
    underlying: &'static str,
    asset_class: AssetClass,
    decimals: u8,
) -> TokenMapping {
    TokenMapping {
        platform_token,
        underlying,
        asset_class,
        decimals,
    }
}

pub const TOKEN_MAPPINGS: &[TokenMapping] = &[
    // Fluid
    mapping("fUSDT", "USDT", AssetClass::Stablecoin, 6),
    mapping("fUSDC", "USDC", AssetClass::Stablecoin, 6),
    mapping("fDAI", "DAI", AssetClass::Stablecoin, 18),
    mapping("fWETH", "WETH", AssetClass::EthCorrelated, 18),
    mapping("fwstETH", "wstETH", AssetClass::EthCorrelated, 18),
    // Aave v3
    mapping("aArbUSDC", "USDC", AssetClass::Stablecoin, 6),
    mapping("aArbUSDCn", "USDC", AssetClass::Stablecoin, 6),
    mapping("aArbUSDT", "USDT", AssetClass::Stablecoin, 6),
    mapping("aArbDAI", "DAI", AssetClass::Stablecoin, 18),
    mapping("aArbGHO", "GHO", AssetClass::Stablecoin, 18),
    mapping("aArbWETH", "WETH", AssetClass::EthCorrelated, 18),
    mapping("aArbwstETH", "wstETH", AssetClass::EthCorrelated, 18),
    mapping("aArbWBTC", "WBTC", AssetClass::BtcCorrelated, 8),
    // Compound v3
    mapping("cUSDCv3", "USDC", AssetClass::Stablecoin, 6),
    mapping("cWETHv3", "WETH", AssetClass::EthCorrelated, 18),
];

/// Canonical Arbitrum addresses of underlying assets.
pub const ARBITRUM_TOKEN_ADDRESSES: &[(&str, &str)] = &[
    ("USDC", "0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
    ("USDC.e", "0xFF970A61A043b1cA14834A43f5dE4533EBDDb5CC"),
    ("USDT", "0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9"),
    ("DAI", "0xDA10009cBd5D07dd0CeCc66161FC93D7c9000da1"),
    ("WETH", "0x82aF49447D8a07e3bd95BD0d56f35241523fBab1"),
    ("WBTC", "0x2f2a2543B76A4166549F7aaB2e75Bef0aefC5B0f"),
];

const KNOWN_UNDERLYING: &[&str] = &["USDC", "USDT", "DAI", "WETH", "WBTC", "GHO", "wstETH", "ETH"];

/// Longest prefixes first so `aArbUSDC` never parses as `a` + `ArbUSDC`.
const PREFIXES: &[&str] = &["aArb", "a.e.", "fwst", "a", "c", "f", "r", "y"];

const STABLECOINS: &[&str] = &["USDC", "USDC.E", "USDT", "DAI", "FRAX", "LUSD", "GHO", "USDD", "TUSD", "MIM"];
const ETH_CORRELATED: &[&str] = &["ETH", "WETH", "STETH", "WSTETH", "RETH", "WEETH"];
const BTC_CORRELATED: &[&str] = &["BTC", "WBTC", "TBTC"];

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

/// Underlying asset for a receipt token, or `None` if it can't be resolved.
pub fn underlying_asset(platform_token: &str) -> Option<&'static str> {
    if let Some(m) = TOKEN_MAPPINGS.iter().find(|m| m.platform_token == platform_token) {
        return Some(m.underlying);
    }
    for prefix in PREFIXES {
        if let Some(rest) = platform_token.strip_prefix(prefix) {
            if let Some(known) = KNOWN_UNDERLYING
                .iter()
                .find(|k| k.eq_ignore_ascii_case(rest))
            {
                return Some(known);
            }
        }
    }
    None
}

/// Normalise a symbol to its underlying asset. Symbols that already name
/// an underlying, or that can't be resolved, are returned unchanged.
pub fn normalize_symbol(symbol: &str) -> String {
    if KNOWN_UNDERLYING.iter().any(|k| *k == symbol) {
        return symbol.to_string();
    }
    underlying_asset(symbol)
        .map(str::to_string)
        .unwrap_or_else(|| symbol.to_string())
}

pub fn classify_asset(symbol: &str) -> AssetClass {
    let upper = symbol.to_ascii_uppercase();
    if let Some(m) = TOKEN_MAPPINGS
        .iter()
        .find(|m| m.underlying.eq_ignore_ascii_case(&upper))
    {
        return m.asset_class;
    }
    if STABLECOINS.contains(&upper.as_str()) {
        AssetClass::Stablecoin
    } else if ETH_CORRELATED.contains(&upper.as_str()) {
        AssetClass::EthCorrelated
    } else if BTC_CORRELATED.contains(&upper.as_str()) {
        AssetClass::BtcCorrelated
    } else {
        AssetClass::Other
    }
}

/// Decimals for a platform or underlying symbol (18 if unknown).
pub fn token_decimals(symbol: &str) -> u8 {
    TOKEN_MAPPINGS
        .iter()
        .find(|m| m.platform_token == symbol || m.underlying.eq_ignore_ascii_case(symbol))
        .map(|m| m.decimals)
        .unwrap_or(18)
}

/// Arbitrum address for a platform or underlying symbol.
pub fn token_address(symbol: &str) -> Option<&'static str> {
    let lookup = |s: &str| {
        ARBITRUM_TOKEN_ADDRESSES
            .iter()
            .find(|(sym, _)| *sym == s)
            .map(|(_, addr)| *addr)
    };
    lookup(symbol).or_else(|| underlying_asset(symbol).and_then(lookup))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
