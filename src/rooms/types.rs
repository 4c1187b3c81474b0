use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::matchmaking::{MatchPair, WaitingTicket};
use crate::types::{ChatType, PerModality};

/// Room lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    /// Match made, waiting for both members to acknowledge
    Created,
    Active,
    Closed,
}

/// Why a room was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Left,
    Disconnected,
    IdleTimeout,
    ServerShutdown,
    Invariant,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Left => "left",
            CloseReason::Disconnected => "disconnected",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::Invariant => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: Uuid,
    pub members: [Uuid; 2],
    pub chat_type: ChatType,
    pub shared_interests: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub state: RoomState,
    acks: [bool; 2],
    /// Whether `matched` went out to both members
    pub announced: bool,
    pub last_activity: DateTime<Utc>,
    /// Original tickets, kept for priority re-queueing on rollback
    pub tickets: [WaitingTicket; 2],
}

impl Room {
    pub(super) fn from_pair(pair: MatchPair) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            members: [pair.waiting.connection_id, pair.arriving.connection_id],
            chat_type: pair.chat_type,
            shared_interests: pair.shared_interests,
            created_at: now,
            state: RoomState::Created,
            acks: [false; 2],
            announced: false,
            last_activity: now,
            tickets: [pair.waiting, pair.arriving],
        }
    }

    fn slot(&self, connection_id: Uuid) -> Option<usize> {
        self.members.iter().position(|m| *m == connection_id)
    }

    pub fn is_member(&self, connection_id: Uuid) -> bool {
        self.slot(connection_id).is_some()
    }

    pub fn partner_of(&self, connection_id: Uuid) -> Option<Uuid> {
        self.slot(connection_id).map(|i| self.members[1 - i])
    }

    pub fn ticket_of(&self, connection_id: Uuid) -> Option<&WaitingTicket> {
        self.slot(connection_id).map(|i| &self.tickets[i])
    }

    /// Record an acknowledgement. Returns true when this made the room Active.
    pub(super) fn acknowledge(&mut self, connection_id: Uuid) -> bool {
        let Some(i) = self.slot(connection_id) else {
            return false;
        };
        self.acks[i] = true;
        if self.state == RoomState::Created && self.acks.iter().all(|a| *a) {
            self.state = RoomState::Active;
            return true;
        }
        false
    }

    pub fn acknowledged_by(&self, connection_id: Uuid) -> bool {
        self.slot(connection_id).map(|i| self.acks[i]).unwrap_or(false)
    }

    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity).num_seconds().max(0)
    }
}

/// A room removed from the manager
#[derive(Debug, Clone)]
pub struct ClosedRoom {
    pub room: Room,
    pub reason: CloseReason,
    /// Member that did not trigger the close, if the close was triggered by one
    pub remaining: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Still waiting on the partner
    Pending,
    /// Both members acknowledged, room just became Active
    Activated([Uuid; 2]),
    /// Room was already Active
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub total_rooms: usize,
    pub active_rooms: usize,
    pub by_modality: PerModality<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Connection {0} is already in a room")]
    AlreadyInRoom(Uuid),

    #[error("Room {0} not found")]
    NotFound(Uuid),

    #[error("Connection {connection_id} is not a member of room {room_id}")]
    NotAMember { room_id: Uuid, connection_id: Uuid },
}

impl RoomError {
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::AlreadyInRoom(_) => "ALREADY_IN_ROOM",
            RoomError::NotFound(_) => "ROOM_NOT_FOUND",
            RoomError::NotAMember { .. } => "NOT_A_MEMBER",
        }
    }
}
