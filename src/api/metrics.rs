//! Prometheus scrape endpoint.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::metrics;
use crate::server::AppState;

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    refresh_gauges(&state);

    match metrics::encode_metrics() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encoding failed: {}", e)).into_response()
        }
    }
}

/// Gauges that mirror live core state are set at scrape time.
/// The health snapshot uses a bounded lock read, so a busy core never stalls a scrape.
fn refresh_gauges(state: &AppState) {
    let snapshot = state.health.snapshot();
    metrics::CONNECTIONS_ACTIVE.set(snapshot.online_users as i64);
    if snapshot.core_unavailable {
        tracing::debug!("Queue and room gauges left at their previous values");
    }
}
