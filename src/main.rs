//! YIELDARB: replicated lending yield-arbitrage agent
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the shared state from disk (or starts fresh), and runs the
//! collect→rank→allocate→execute→track→rebalance cycle on an interval
//! with graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use yieldarb::clock::SystemClock;
use yieldarb::config::AppConfig;
use yieldarb::engine::Engine;
use yieldarb::execution::DryRunExecutor;
use yieldarb::health::{spawn_health_server, HealthReport, HealthReporter, NoopHealthReporter, WatchHealthReporter};
use yieldarb::rounds::{RoundContext, Rounds};
use yieldarb::sources::http::{HttpMarketFetcher, RpcGasOracle};
use yieldarb::sources::{GasPriceOracle, StaticGasOracle};
use yieldarb::state::SharedState;
use yieldarb::storage::{self, Snapshot};
use yieldarb::types::{CycleSummary, RoundKind};

const BANNER: &str = r#"
 __   _____ ___ _    ___   _   ___ ___
 \ \ / /_ _| __| |  |   \ /_\ | _ \ _ )
  \ V / | || _|| |__| |) / _ \|   / _ \
   |_| |___|___|____|___/_/ \_\_|_\___/

  Lending yield arbitrage, replicated round by round
  v0.1.0 autonomous agent
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = Arc::new(AppConfig::load("config.toml")?);

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        chain_id = cfg.agent.chain_id,
        cycle_interval_secs = cfg.agent.cycle_interval_secs,
        participants = cfg.consensus.participants,
        sources = cfg.collection.sources.len(),
        dry_run = cfg.agent.dry_run,
        "YIELDARB starting up"
    );
    if !cfg.agent.dry_run {
        warn!("Live execution is not available, submitting through the dry-run executor");
    }

    // -- Restore or create state -----------------------------------------

    let state_file = cfg.agent.state_file.clone();
    let (state, next_round) = match storage::load_snapshot(state_file.as_deref())? {
        Some(snapshot) => {
            info!(
                cycle = snapshot.state.cycle().cycle_id,
                positions = snapshot.state.positions().active_positions.len(),
                next_round = %snapshot.next_round,
                "Resumed from saved state"
            );
            (snapshot.state, snapshot.next_round)
        }
        None => {
            info!("Fresh start");
            (SharedState::new(), RoundKind::DataCollection)
        }
    };

    // -- Initialise components -------------------------------------------

    let request_timeout = cfg.collection.request_timeout();
    let gas: Arc<dyn GasPriceOracle> = match &cfg.preprocessing.gas_rpc_url {
        Some(url) => {
            info!(url = %url, "Using RPC gas oracle");
            Arc::new(RpcGasOracle::new(url.clone(), request_timeout)?)
        }
        None => Arc::new(StaticGasOracle::new(cfg.preprocessing.static_gas_price_gwei)),
    };

    let ctx = Arc::new(RoundContext {
        config: cfg.clone(),
        fetcher: Arc::new(HttpMarketFetcher::new(request_timeout)?),
        gas,
        executor: Arc::new(DryRunExecutor::new()),
        clock: Arc::new(SystemClock),
    });

    let health: Arc<dyn HealthReporter> = if cfg.health.enabled {
        let reporter = WatchHealthReporter::new(HealthReport::starting(
            next_round,
            state.cycle().completed_cycles,
        ));
        spawn_health_server(reporter.subscribe(), cfg.health.port).await?;
        Arc::new(reporter)
    } else {
        Arc::new(NoopHealthReporter)
    };

    let mut engine = Engine::restore(cfg.clone(), Rounds::new(ctx), health, state, next_round);

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.agent.cycle_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.agent.cycle_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let summary = engine
                    .run_cycle_with(|engine, _outcome| {
                        // Persist after every committed round
                        let snapshot = Snapshot::new(engine.state().clone(), engine.current_round());
                        if let Err(e) = storage::save_snapshot(&snapshot, state_file.as_deref()) {
                            error!(error = %e, "Failed to save state");
                        }
                    })
                    .await;
                match summary {
                    Some(summary) => log_cycle_summary(&summary, engine.state()),
                    None => error!("Cycle aborted, resuming from the current round next tick"),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    let snapshot = Snapshot::new(engine.state().clone(), engine.current_round());
    storage::save_snapshot(&snapshot, state_file.as_deref())?;
    info!(
        cycles = engine.state().cycle().completed_cycles,
        positions = engine.state().positions().active_positions.len(),
        realized_pnl = %engine.state().positions().realized_pnl_usd,
        "YIELDARB shut down cleanly."
    );

    Ok(())
}

fn log_cycle_summary(summary: &CycleSummary, state: &SharedState) {
    let positions = state.positions();
    info!(
        cycle = summary.cycle_id,
        succeeded = summary.succeeded(),
        rounds = summary.rounds_run,
        warnings = summary.warnings,
        positions = positions.active_positions.len(),
        deployed = %positions.deployed_capital(),
        realized_pnl = %positions.realized_pnl_usd,
        queued = state.rebalancing().pending_intents.len(),
        "Cycle complete"
    );
}

/// Initialise the `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter; `YIELDARB_LOG_JSON` switches
/// to JSON lines.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("yieldarb=info"));

    if std::env::var("YIELDARB_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
