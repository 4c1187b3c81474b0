//! Health check and statistics endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::batcher::BatcherStats;
use crate::connection_manager::{ConnectionStats, ReasonCount};
use crate::health::{HealthReport, HealthStatus};
use crate::rooms::RoomStats;
use crate::server::AppState;
use crate::types::PerModality;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub version: String,
    pub active_connections: usize,
    #[serde(flatten)]
    pub report: HealthReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub online_users: usize,
    pub queue_stats: PerModality<usize>,
    pub rooms: RoomStats,
    pub connections: ConnectionStats,
    pub disconnects: DisconnectSummary,
    pub batcher: BatcherStats,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectSummary {
    pub total: u64,
    pub top_reasons: Vec<ReasonCount>,
}

/// GET /health - 503 when the service is down
pub async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.health_check();
    let code = match report.status {
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };

    let body = HealthResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: report.snapshot.online_users,
        report,
    };
    (code, Json(body)).into_response()
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let snapshot = state.health.snapshot();
    let connections = state.core.connections();

    Json(StatsResponse {
        online_users: snapshot.online_users,
        queue_stats: snapshot.queue_depths,
        rooms: snapshot.rooms,
        connections: connections.stats(),
        disconnects: DisconnectSummary {
            total: connections.disconnects().total(),
            top_reasons: snapshot.top_disconnect_reasons,
        },
        batcher: snapshot.batcher,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
