use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::debug::{force_match, matchmaking_details};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes(state: AppState) -> Router<AppState> {
    // Admin endpoints, guarded by X-API-Key when api.key is set
    let admin = Router::new()
        .route("/stats", get(stats))
        .route("/debug/matchmaking", get(matchmaking_details))
        .route("/debug/force-match/{chat_type}", post(force_match))
        .route_layer(middleware::from_fn_with_state(state, api_key_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .merge(admin)
}
