//! Opportunity generation and ranking.
//!
//! Pairs every supply market with every compatible borrow market,
//! prices the spread net of annualised entry cost, filters against the
//! configured floors and caps, and sorts into a total order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cmp::Ordering;
use tracing::debug;

use super::{annualized_cost, risk};
use crate::config::StrategyConfig;
use crate::types::{ArbitrageOpportunity, UnifiedMarketData};

/// Why a candidate pair was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rejection {
    NoCapital,
    BelowMinApy,
    RiskTooHigh,
    Illiquid,
}

/// Counts of what the last ranking pass produced and dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankingStats {
    pub candidates: usize,
    pub no_capital: usize,
    pub below_min_apy: usize,
    pub risk_too_high: usize,
    pub illiquid: usize,
}

impl RankingStats {
    fn count(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::NoCapital => self.no_capital += 1,
            Rejection::BelowMinApy => self.below_min_apy += 1,
            Rejection::RiskTooHigh => self.risk_too_high += 1,
            Rejection::Illiquid => self.illiquid += 1,
        }
    }
}

pub struct OpportunityFinder<'a> {
    config: &'a StrategyConfig,
}

impl<'a> OpportunityFinder<'a> {
    pub fn new(config: &'a StrategyConfig) -> Self {
        Self { config }
    }

    /// Generate, filter and rank opportunities over one market snapshot.
    pub fn rank(
        &self,
        markets: &[UnifiedMarketData],
        evaluated_at: DateTime<Utc>,
    ) -> (Vec<ArbitrageOpportunity>, RankingStats) {
        let mut stats = RankingStats::default();
        let mut ranked = Vec::new();

        for supply in markets {
            for borrow in markets {
                if !self.pairable(supply, borrow) {
                    continue;
                }
                stats.candidates += 1;
                match self.evaluate(supply, borrow, evaluated_at) {
                    Ok(opp) => ranked.push(opp),
                    Err(rejection) => {
                        debug!(
                            supply = %supply.key(),
                            borrow = %borrow.key(),
                            ?rejection,
                            "Pair rejected"
                        );
                        stats.count(rejection);
                    }
                }
            }
        }

        ranked.sort_by(compare_ranked);
        (ranked, stats)
    }

    fn pairable(&self, supply: &UnifiedMarketData, borrow: &UnifiedMarketData) -> bool {
        if supply.key() == borrow.key() {
            return false;
        }
        if supply.protocol_name == borrow.protocol_name && !self.config.allow_same_protocol {
            return false;
        }
        self.config
            .assets_compatible(&supply.asset_symbol, &borrow.asset_symbol)
    }

    /// Price one ordered pair; `Err` names the first failed filter.
    pub fn evaluate(
        &self,
        supply: &UnifiedMarketData,
        borrow: &UnifiedMarketData,
        evaluated_at: DateTime<Utc>,
    ) -> Result<ArbitrageOpportunity, Rejection> {
        let cfg = self.config;
        let liquidity_usd = supply.liquidity_usd.min(borrow.liquidity_usd);
        let required_capital_usd = cfg
            .max_allocation_per_opportunity
            .min(liquidity_usd)
            .min(cfg.total_available_capital);
        if required_capital_usd <= Decimal::ZERO {
            return Err(Rejection::NoCapital);
        }

        // An unrepresentable cost can never clear the minimum APY.
        let transaction_cost_usd = supply
            .transaction_cost_estimate_usd
            .checked_add(borrow.transaction_cost_estimate_usd)
            .ok_or(Rejection::BelowMinApy)?;
        let net_estimated_apy = annualized_cost(
            transaction_cost_usd,
            required_capital_usd,
            cfg.holding_period_days,
        )
        .and_then(|cost_rate| {
            supply
                .supply_apy_net
                .checked_sub(borrow.borrow_apy_net)?
                .checked_sub(cost_rate)
        })
        .ok_or(Rejection::BelowMinApy)?;
        let risk_score = risk::risk_score(supply, borrow, &cfg.risk);

        if net_estimated_apy < cfg.min_net_apy {
            return Err(Rejection::BelowMinApy);
        }
        if risk_score > cfg.max_risk_score {
            return Err(Rejection::RiskTooHigh);
        }
        if supply.liquidity_usd < cfg.min_liquidity_usd || borrow.liquidity_usd < cfg.min_liquidity_usd {
            return Err(Rejection::Illiquid);
        }

        Ok(ArbitrageOpportunity {
            supply_protocol: supply.protocol_name.clone(),
            supply_market_id: supply.market_id.clone(),
            supply_asset: supply.asset_symbol.clone(),
            supply_apy: supply.supply_apy_net,
            borrow_protocol: borrow.protocol_name.clone(),
            borrow_market_id: borrow.market_id.clone(),
            borrow_asset: borrow.asset_symbol.clone(),
            borrow_apy: borrow.borrow_apy_net,
            net_estimated_apy,
            required_capital_usd,
            liquidity_usd,
            risk_score,
            transaction_cost_usd,
            timestamp: evaluated_at,
        })
    }
}

/// Net APY desc, risk asc, market id pair asc, protocol pair asc.
pub fn compare_ranked(a: &ArbitrageOpportunity, b: &ArbitrageOpportunity) -> Ordering {
    b.net_estimated_apy
        .cmp(&a.net_estimated_apy)
        .then_with(|| a.risk_score.cmp(&b.risk_score))
        .then_with(|| a.supply_market_id.cmp(&b.supply_market_id))
        .then_with(|| a.borrow_market_id.cmp(&b.borrow_market_id))
        .then_with(|| a.supply_protocol.cmp(&b.supply_protocol))
        .then_with(|| a.borrow_protocol.cmp(&b.borrow_protocol))
}

/// Format a rate as a percentage string for logs.
pub fn pct(rate: Decimal) -> String {
    format!("{:.2}%", rate * dec!(100))
}
