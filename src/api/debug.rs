//! Matchmaking introspection and manual pairing.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::chat::PendingMatch;
use crate::error::{AppError, Result};
use crate::matchmaking::TicketInfo;
use crate::server::AppState;
use crate::types::{ChatType, PerModality};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingDebugResponse {
    pub queue_stats: PerModality<usize>,
    pub queue_details: PerModality<Vec<TicketInfo>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceMatchResponse {
    #[serde(flatten)]
    pub pending: PendingMatch,
    /// False when a member vanished before the announcement and the match was rolled back
    pub announced: bool,
}

/// GET /debug/matchmaking
pub async fn matchmaking_details(State(state): State<AppState>) -> Json<MatchmakingDebugResponse> {
    let queue_details = state.core.queue_details();
    let queue_stats = PerModality {
        text: queue_details.text.len(),
        video: queue_details.video.len(),
    };
    Json(MatchmakingDebugResponse {
        queue_stats,
        queue_details,
    })
}

/// POST /debug/force-match/{chat_type} - pair the two oldest waiters, or `null`
#[tracing::instrument(name = "api.force_match", skip(state))]
pub async fn force_match(
    State(state): State<AppState>,
    Path(chat_type): Path<String>,
) -> Result<Json<Option<ForceMatchResponse>>> {
    let chat_type: ChatType = chat_type
        .parse()
        .map_err(|e: crate::types::UnknownChatType| AppError::Validation(e.to_string()))?;

    let Some(pending) = state.core.force_match(chat_type) else {
        tracing::debug!(chat_type = %chat_type, "Force match found fewer than two waiters");
        return Ok(Json(None));
    };

    let announced = state.core.announce_match(pending.clone()).await;
    tracing::info!(
        room_id = %pending.room_id,
        chat_type = %chat_type,
        announced,
        "Force match issued"
    );
    Ok(Json(Some(ForceMatchResponse { pending, announced })))
}
