use serde::Serialize;
use uuid::Uuid;

use crate::connection_manager::TabResolver;
use crate::matchmaking::MatchQueue;
use crate::rooms::{RoomManager, RoomStats};
use crate::types::{ChatType, PerModality};

/// Everything guarded by the core lock
#[derive(Debug)]
pub struct MatchState {
    pub tabs: TabResolver,
    pub queue: MatchQueue,
    pub rooms: RoomManager,
}

impl MatchState {
    pub fn new(allow_same_ip: bool) -> Self {
        Self {
            tabs: TabResolver::new(),
            queue: MatchQueue::new(allow_same_ip),
            rooms: RoomManager::new(),
        }
    }
}

/// A room that exists but whose members have not been told yet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMatch {
    pub room_id: Uuid,
    pub chat_type: ChatType,
    pub members: [Uuid; 2],
    #[serde(skip)]
    pub auth_ids: [Option<String>; 2],
    pub shared_interests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FindOutcome {
    Queued { position: usize },
    Matched(PendingMatch),
}

/// Point-in-time view of the locked state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreSnapshot {
    pub queue_depths: PerModality<usize>,
    pub oldest_wait_secs: PerModality<i64>,
    pub rooms: RoomStats,
    pub identified_tabs: usize,
}
