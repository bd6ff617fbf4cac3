//! Rebalancing decisions.
//!
//! One action per position, first match wins:
//! 1. health factor below the critical threshold: forced exit;
//! 2. yield below `min_net_apy` for longer than the grace period: exit;
//! 3. a better unheld pair beats the current yield by more than the
//!    migration margin plus the annualised switching cost: migrate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use super::annualized_cost;
use crate::config::{RebalancingConfig, StrategyConfig};
use crate::state::{PendingIntent, PositionSlice, RebalanceAction, RebalanceDecision};
use crate::types::{
    ActivePosition, ArbitrageOpportunity, ExitReason, IntentKind, MarketKey, UnifiedMarketData,
};

pub struct Rebalancer<'a> {
    config: &'a RebalancingConfig,
    strategy: &'a StrategyConfig,
}

impl<'a> Rebalancer<'a> {
    pub fn new(config: &'a RebalancingConfig, strategy: &'a StrategyConfig) -> Self {
        Self { config, strategy }
    }

    /// Decide an action for every open position, in position id order.
    pub fn decide(
        &self,
        positions: &PositionSlice,
        ranked: &[ArbitrageOpportunity],
        markets: &[UnifiedMarketData],
        now: DateTime<Utc>,
    ) -> Vec<RebalanceDecision> {
        let by_key: HashMap<MarketKey, &UnifiedMarketData> =
            markets.iter().map(|m| (m.key(), m)).collect();
        let held: BTreeSet<(MarketKey, MarketKey)> = positions
            .active_positions
            .values()
            .map(|p| (p.supply_key(), p.borrow_key()))
            .collect();
        let mut claimed: BTreeSet<(MarketKey, MarketKey)> = BTreeSet::new();

        positions
            .active_positions
            .values()
            .map(|position| {
                let action = self.decide_one(position, ranked, &by_key, &held, &mut claimed, now);
                match &action {
                    RebalanceAction::Hold => debug!(position = %position.position_id, "Hold"),
                    RebalanceAction::Exit { reason } => info!(
                        position = %position.position_id,
                        %reason,
                        health_factor = %position.health_factor,
                        "Exit queued"
                    ),
                    RebalanceAction::Migrate { target, improvement } => info!(
                        position = %position.position_id,
                        target = %target,
                        improvement = %improvement,
                        "Migration queued"
                    ),
                }
                RebalanceDecision {
                    position_id: position.position_id.clone(),
                    action,
                }
            })
            .collect()
    }

    fn decide_one(
        &self,
        position: &ActivePosition,
        ranked: &[ArbitrageOpportunity],
        markets: &HashMap<MarketKey, &UnifiedMarketData>,
        held: &BTreeSet<(MarketKey, MarketKey)>,
        claimed: &mut BTreeSet<(MarketKey, MarketKey)>,
        now: DateTime<Utc>,
    ) -> RebalanceAction {
        if position.health_factor < self.config.critical_health_factor {
            return RebalanceAction::Exit {
                reason: ExitReason::HealthFactor,
            };
        }

        if position.current_apy < self.strategy.min_net_apy {
            if let Some(since) = position.below_min_apy_since {
                if now - since > self.config.grace_period() {
                    return RebalanceAction::Exit {
                        reason: ExitReason::LowYield,
                    };
                }
            }
        }

        // Migration needs fresh data for both current legs.
        let (Some(supply), Some(borrow)) = (
            markets.get(&position.supply_key()),
            markets.get(&position.borrow_key()),
        ) else {
            return RebalanceAction::Hold;
        };
        let Some(hurdle) = supply
            .transaction_cost_estimate_usd
            .checked_add(borrow.transaction_cost_estimate_usd)
            .and_then(|exit_cost| {
                annualized_cost(exit_cost, position.supplied_amount, self.strategy.holding_period_days)
            })
            .and_then(|exit_rate| exit_rate.checked_add(self.config.migration_margin))
        else {
            return RebalanceAction::Hold;
        };

        let candidate = ranked.iter().find(|opp| {
            let pair = (opp.supply_key(), opp.borrow_key());
            !held.contains(&pair) && !claimed.contains(&pair)
        });
        if let Some(target) = candidate {
            let improvement = target.net_estimated_apy - position.current_apy;
            if improvement > hurdle {
                claimed.insert((target.supply_key(), target.borrow_key()));
                return RebalanceAction::Migrate {
                    target: target.clone(),
                    improvement,
                };
            }
        }
        RebalanceAction::Hold
    }
}

/// Intents to queue for the next transaction round.
pub fn pending_intents(decisions: &[RebalanceDecision]) -> Vec<PendingIntent> {
    decisions
        .iter()
        .filter_map(|d| {
            let kind = match &d.action {
                RebalanceAction::Hold => return None,
                RebalanceAction::Exit { reason } => IntentKind::Exit { reason: *reason },
                RebalanceAction::Migrate { target, .. } => IntentKind::Migrate {
                    target: target.clone(),
                },
            };
            Some(PendingIntent {
                position_id: d.position_id.clone(),
                kind,
            })
        })
        .collect()
}
