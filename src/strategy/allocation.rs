//! Capital allocation.
//!
//! Walks the ranked opportunity list and assigns capital subject to the
//! per-opportunity cap, the opportunity's liquidity, the remaining
//! capital, and a per-protocol cap that counts capital already deployed
//! in open positions. Pairs already held, or reserved as the target of a
//! queued migration, are not entered again.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::config::StrategyConfig;
use crate::state::{PendingIntent, PositionSlice};
use crate::types::{Allocation, ArbitrageOpportunity, IntentKind, MarketKey, UnifiedMarketData};

/// Result of one allocation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPlan {
    pub allocations: Vec<Allocation>,
    pub remaining_capital_usd: Decimal,
}

pub struct Allocator<'a> {
    config: &'a StrategyConfig,
}

impl<'a> Allocator<'a> {
    pub fn new(config: &'a StrategyConfig) -> Self {
        Self { config }
    }

    /// How many new positions this pass may open.
    pub fn slots(&self, open_positions: usize) -> usize {
        let wanted = if self.config.diversification {
            self.config.max_opportunities
        } else {
            1
        };
        wanted.min(self.config.max_positions.saturating_sub(open_positions))
    }

    pub fn allocate(
        &self,
        ranked: &[ArbitrageOpportunity],
        markets: &[UnifiedMarketData],
        positions: &PositionSlice,
        pending: &[PendingIntent],
    ) -> AllocationPlan {
        let cfg = self.config;
        let mut remaining = (cfg.total_available_capital - positions.deployed_capital())
            .max(Decimal::ZERO);
        let slots = self.slots(positions.active_positions.len());

        let collateral: HashMap<MarketKey, Decimal> = markets
            .iter()
            .map(|m| (m.key(), m.collateral_factor))
            .collect();

        let mut per_protocol: BTreeMap<String, Decimal> = BTreeMap::new();
        for p in positions.active_positions.values() {
            *per_protocol.entry(p.supply_protocol.clone()).or_default() += p.supplied_amount;
        }

        let migration_targets: Vec<&ArbitrageOpportunity> = pending
            .iter()
            .filter_map(|p| match &p.kind {
                IntentKind::Migrate { target } => Some(target),
                _ => None,
            })
            .collect();

        let mut allocations = Vec::new();
        for opp in ranked {
            if allocations.len() >= slots || remaining <= Decimal::ZERO {
                break;
            }
            if positions.active_positions.values().any(|p| p.holds(opp)) {
                debug!(supply = %opp.supply_key(), borrow = %opp.borrow_key(), "Pair already held");
                continue;
            }
            if migration_targets
                .iter()
                .any(|t| t.supply_key() == opp.supply_key() && t.borrow_key() == opp.borrow_key())
            {
                debug!(supply = %opp.supply_key(), borrow = %opp.borrow_key(), "Pair reserved by queued migration");
                continue;
            }

            let used = per_protocol
                .get(&opp.supply_protocol)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let protocol_room = (cfg.max_allocation_per_protocol - used).max(Decimal::ZERO);
            let allocation_usd = cfg
                .max_allocation_per_opportunity
                .min(opp.liquidity_usd)
                .min(remaining)
                .min(protocol_room);

            if allocation_usd < cfg.min_position_size || allocation_usd <= Decimal::ZERO {
                debug!(
                    supply = %opp.supply_key(),
                    allocation = %allocation_usd,
                    "Allocation below minimum position size"
                );
                continue;
            }

            let cf = collateral
                .get(&opp.supply_key())
                .copied()
                .unwrap_or(cfg.target_ltv);
            let borrow_amount_usd = allocation_usd * cfg.target_ltv.min(cf);

            remaining -= allocation_usd;
            *per_protocol.entry(opp.supply_protocol.clone()).or_default() += allocation_usd;
            allocations.push(Allocation {
                opportunity: opp.clone(),
                allocation_usd,
                borrow_amount_usd,
            });
        }

        AllocationPlan {
            allocations,
            remaining_capital_usd: remaining,
        }
    }
}
