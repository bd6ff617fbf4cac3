//! Full cycles through every round with three participants.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use yieldarb::storage::{self, Snapshot};
use yieldarb::types::{Event, RoundKind};

use crate::mock_sources::{Harness, MarketRates};

fn temp_path() -> String {
    let mut p = std::env::temp_dir();
    p.push(format!("yieldarb_it_state_{}.json", uuid::Uuid::new_v4()));
    p.to_string_lossy().to_string()
}

#[tokio::test]
async fn test_full_cycle_enters_position() {
    let mut h = Harness::new();
    let summary = h.engine.run_cycle().await.expect("cycle completes");

    assert!(summary.succeeded());
    assert_eq!(summary.cycle_id, 1);
    assert_eq!(summary.rounds_run, 7);
    assert_eq!(summary.terminal_round, Some(RoundKind::Rebalancing));
    assert_eq!(summary.warnings, 0);

    let state = h.engine.state();
    assert_eq!(state.cycle().cycle_id, 2);
    assert_eq!(state.cycle().completed_cycles, 1);
    assert_eq!(h.engine.current_round(), RoundKind::DataCollection);

    let positions = &state.positions().active_positions;
    assert_eq!(positions.len(), 1);
    let p = positions.values().next().unwrap();
    assert_eq!(p.supply_protocol, "fluid");
    assert_eq!(p.borrow_protocol, "aavev3");
    assert_eq!(p.supplied_amount, dec!(25000));
    assert_eq!(p.borrowed_amount, dec!(12500));
    assert_eq!(p.current_apy, dec!(0.02));
    assert_eq!(p.health_factor, dec!(1.7));

    // Three participants submitted one intent between them.
    assert_eq!(h.executor.submitted().await, 1);
}

#[tokio::test]
async fn test_reset_clears_per_cycle_keys() {
    let mut h = Harness::new();
    h.engine.run_cycle().await.unwrap();
    let state = h.engine.state();

    assert!(state.collection().raw_market_data_sources.is_empty());
    assert!(state.collection().last_successful_collection_utc.is_some());
    assert!(state.preprocessing().unified_markets.is_empty());
    assert!(state.preprocessing().last_preprocessing_utc.is_some());
    assert!(state.ranking().ranked_opportunities.is_empty());
    assert!(state.allocation().selected_allocations.is_empty());
    assert!(state.transactions().executions.is_empty());
    assert!(state.rebalancing().decisions.is_empty());
    assert!(state.journal().entries().is_empty());
    assert_eq!(state.positions().active_positions.len(), 1);
}

#[tokio::test]
async fn test_critical_source_failure_resets() {
    let mut h = Harness::new();
    h.markets.fail("aavev3");
    let summary = h.engine.run_cycle().await.unwrap();

    assert!(!summary.succeeded());
    assert_eq!(summary.terminal_round, Some(RoundKind::DataCollection));
    assert_eq!(summary.terminal_event, Some(Event::FetchFailed));
    assert_eq!(summary.rounds_run, 1);
    assert_eq!(h.engine.state().cycle().cycle_id, 2);
    assert!(h.engine.state().positions().active_positions.is_empty());
    assert!(h.engine.state().collection().last_successful_collection_utc.is_none());
    assert_eq!(h.executor.submitted().await, 0);

    h.markets.restore("aavev3");
    let summary = h.engine.run_cycle().await.unwrap();
    assert!(summary.succeeded());
    assert_eq!(h.engine.state().positions().active_positions.len(), 1);
}

#[tokio::test]
async fn test_held_position_accrues_across_cycles() {
    let mut h = Harness::new();
    h.engine.run_cycle().await.unwrap();

    h.clock.advance(Duration::days(1));
    let summary = h.engine.run_cycle().await.unwrap();
    assert!(summary.succeeded());

    let positions = &h.engine.state().positions().active_positions;
    assert_eq!(positions.len(), 1);
    let p = positions.values().next().unwrap();
    assert!(p.pnl_usd > Decimal::ZERO);
    assert!(p.supplied_amount > dec!(25000));

    // The only opportunity is already held.
    assert_eq!(h.executor.submitted().await, 1);
}

#[tokio::test]
async fn test_forced_exit_on_low_health_factor() {
    let mut h = Harness::new();
    h.engine.run_cycle().await.unwrap();

    // Liquidation threshold collapses: health factor drops to 1.0.
    let fluid = h.markets.rates("fluid");
    h.markets.set_rates(
        "fluid",
        MarketRates {
            collateral_factor_bps: 4000,
            liquidation_threshold_bps: 5000,
            ..fluid
        },
    );
    h.clock.advance(Duration::hours(1));
    h.engine.run_cycle().await.unwrap();

    let state = h.engine.state();
    assert_eq!(state.positions().active_positions.len(), 1);
    let pending = &state.rebalancing().pending_intents;
    assert_eq!(pending.len(), 1);

    h.clock.advance(Duration::hours(1));
    h.engine.run_cycle().await.unwrap();

    let state = h.engine.state();
    assert!(state.positions().active_positions.is_empty());
    assert!(state.positions().realized_pnl_usd > Decimal::ZERO);
    assert!(state.rebalancing().pending_intents.is_empty());
    assert_eq!(h.executor.submitted().await, 2);
}

#[tokio::test]
async fn test_health_report_follows_engine() {
    let mut h = Harness::new();
    h.engine.run_cycle().await.unwrap();

    let report = h.health.latest();
    assert_eq!(report.current_round, RoundKind::DataCollection);
    assert_eq!(report.cycle_count, 1);
    assert_eq!(report.last_event, Some(Event::Done));
    assert!(report.last_cycle_duration.is_some());
}

#[tokio::test]
async fn test_resume_from_snapshot() {
    let path = temp_path();
    let mut h = Harness::new();
    h.engine.run_cycle().await.unwrap();

    let snapshot = Snapshot::new(h.engine.state().clone(), h.engine.current_round());
    storage::save_snapshot(&snapshot, Some(&path)).unwrap();
    let loaded = storage::load_snapshot(Some(&path)).unwrap().unwrap();
    storage::delete_snapshot(Some(&path)).unwrap();

    let mut resumed = Harness::resume(loaded.state, loaded.next_round);
    assert_eq!(resumed.engine.state(), h.engine.state());

    let summary = resumed.engine.run_cycle().await.unwrap();
    assert_eq!(summary.cycle_id, 2);
    assert!(summary.succeeded());
    assert_eq!(resumed.engine.state().positions().active_positions.len(), 1);
}
