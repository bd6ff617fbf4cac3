//! Health publishing.
//!
//! The engine publishes a [`HealthReport`] after every round. The watch
//! reporter keeps the latest one for the HTTP health server in
//! [`routes`].

pub mod routes;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::types::{Event, RoundKind};

/// Snapshot of where the pipeline stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Round that will run next.
    pub current_round: RoundKind,
    pub cycle_count: u64,
    pub last_event: Option<Event>,
    pub last_cycle_duration: Option<Duration>,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub fn starting(current_round: RoundKind, cycle_count: u64) -> Self {
        Self {
            current_round,
            cycle_count,
            last_event: None,
            last_cycle_duration: None,
            last_transition_at: None,
        }
    }
}

pub trait HealthReporter: Send + Sync {
    fn publish(&self, report: HealthReport);
}

/// Keeps the latest report in a `tokio::sync::watch` channel.
pub struct WatchHealthReporter {
    tx: watch::Sender<HealthReport>,
}

impl WatchHealthReporter {
    pub fn new(initial: HealthReport) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthReport> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> HealthReport {
        self.tx.borrow().clone()
    }
}

impl HealthReporter for WatchHealthReporter {
    fn publish(&self, report: HealthReport) {
        // send_replace stores the value even with no receivers attached.
        self.tx.send_replace(report);
    }
}

/// Discards every report. For runs with the health server disabled.
pub struct NoopHealthReporter;

impl HealthReporter for NoopHealthReporter {
    fn publish(&self, _report: HealthReport) {}
}

/// Start the health server in a background task.
///
/// Binding happens before returning so a taken port fails startup.
pub async fn spawn_health_server(
    reports: watch::Receiver<HealthReport>,
    port: u16,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = routes::build_router(reports);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health port {port}"))?;
    info!(port, "Health server listening on http://localhost:{port}/healthcheck");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Health server stopped");
        }
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
