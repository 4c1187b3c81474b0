//! API layer - HTTP endpoint handlers organized by concern.

mod debug;
mod health;
mod metrics;
mod routes;

pub use debug::{force_match, matchmaking_details, ForceMatchResponse, MatchmakingDebugResponse};
pub use health::{health, stats, DisconnectSummary, HealthResponse, StatsResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
