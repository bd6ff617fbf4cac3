//! Health route handlers.

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use super::HealthReport;
use crate::types::{Event, RoundKind};

pub type HealthState = watch::Receiver<HealthReport>;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub current_round: RoundKind,
    pub cycle_count: u64,
    pub last_event: Option<Event>,
    pub last_cycle_duration_secs: Option<f64>,
    pub seconds_since_last_transition: Option<i64>,
}

/// Build the health router.
pub fn build_router(state: HealthState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/healthcheck", get(healthcheck))
        .layer(cors)
        .with_state(state)
}

/// GET /healthcheck
pub async fn healthcheck(State(state): State<HealthState>) -> Json<HealthResponse> {
    let report = state.borrow().clone();
    Json(HealthResponse {
        current_round: report.current_round,
        cycle_count: report.cycle_count,
        last_event: report.last_event,
        last_cycle_duration_secs: report.last_cycle_duration.map(|d| d.as_secs_f64()),
        seconds_since_last_transition: report
            .last_transition_at
            .map(|at| (Utc::now() - at).num_seconds()),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
