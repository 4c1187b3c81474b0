use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::profile::DisplayIdentity;
use crate::types::ChatType;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    IdentifyTab(IdentifyTab),
    FindPartner {
        #[serde(default)]
        interests: Vec<String>,
    },
    CancelSearch,
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    RoomReady {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    RoomMessage {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        payload: serde_json::Value,
    },
    HeartbeatResponse {
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(rename = "chatType", default)]
        chat_type: Option<ChatType>,
    },
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::IdentifyTab(_) => "identify_tab",
            ClientMessage::FindPartner { .. } => "find_partner",
            ClientMessage::CancelSearch => "cancel_search",
            ClientMessage::LeaveRoom { .. } => "leave_room",
            ClientMessage::RoomReady { .. } => "room_ready",
            ClientMessage::RoomMessage { .. } => "room_message",
            ClientMessage::HeartbeatResponse { .. } => "heartbeat_response",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Payload of `identify_tab`. `tab_id` is optional on the wire so a request
/// without it can be logged and ignored instead of failing to parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyTab {
    #[serde(default)]
    pub tab_id: Option<String>,
    #[serde(default)]
    pub chat_type: Option<ChatType>,
    #[serde(default)]
    pub auth_id: Option<String>,
    #[serde(default)]
    pub is_reconnect: bool,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TabIdentified {
        #[serde(rename = "socketId")]
        socket_id: Uuid,
        #[serde(rename = "tabId")]
        tab_id: String,
        #[serde(rename = "chatType")]
        chat_type: ChatType,
        #[serde(rename = "isReconnect")]
        is_reconnect: bool,
        timestamp: i64,
    },
    DuplicateTabDetected {
        #[serde(rename = "tabId")]
        tab_id: String,
        message: String,
    },
    AuthConflictDetected {
        #[serde(rename = "chatType")]
        chat_type: ChatType,
        message: String,
    },
    Searching {
        #[serde(rename = "chatType")]
        chat_type: ChatType,
        position: usize,
    },
    SearchCancelled,
    SearchTimeout {
        #[serde(rename = "chatType")]
        chat_type: ChatType,
    },
    Matched {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        #[serde(rename = "partnerInterests")]
        partner_interests: Vec<String>,
        #[serde(rename = "chatType")]
        chat_type: ChatType,
        partner: DisplayIdentity,
    },
    RoomActive {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    PartnerMessage {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        payload: serde_json::Value,
    },
    PartnerLeft {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    RoomClosed {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        reason: String,
    },
    Heartbeat {
        timestamp: i64,
    },
    Pong,
    ServerShutdown {
        reason: String,
        #[serde(rename = "reconnectAfter", skip_serializing_if = "Option::is_none")]
        reconnect_after: Option<u64>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn shutdown(reason: impl Into<String>, reconnect_after: Option<u64>) -> Self {
        Self::ServerShutdown {
            reason: reason.into(),
            reconnect_after,
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Critical messages are system events; backpressure never drops them.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            ServerMessage::PartnerMessage { .. } | ServerMessage::Heartbeat { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::TabIdentified { .. } => "tab_identified",
            ServerMessage::DuplicateTabDetected { .. } => "duplicate_tab_detected",
            ServerMessage::AuthConflictDetected { .. } => "auth_conflict_detected",
            ServerMessage::Searching { .. } => "searching",
            ServerMessage::SearchCancelled => "search_cancelled",
            ServerMessage::SearchTimeout { .. } => "search_timeout",
            ServerMessage::Matched { .. } => "matched",
            ServerMessage::RoomActive { .. } => "room_active",
            ServerMessage::PartnerMessage { .. } => "partner_message",
            ServerMessage::PartnerLeft { .. } => "partner_left",
            ServerMessage::RoomClosed { .. } => "room_closed",
            ServerMessage::Heartbeat { .. } => "heartbeat",
            ServerMessage::Pong => "pong",
            ServerMessage::ServerShutdown { .. } => "server_shutdown",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[derive(Serialize)]
struct BatchFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    messages: &'a [ServerMessage],
}

/// Item placed on a connection's outbound channel
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// An ordered batch produced by the message batcher
    Batch(Vec<ServerMessage>),
    /// Send a close frame and stop the connection
    Close { code: u16, reason: String },
}

impl OutboundMessage {
    /// Serialize a batch to one text frame. A single message is sent bare,
    /// larger batches are wrapped in `{"type":"batch","messages":[..]}`.
    pub fn batch_json(messages: &[ServerMessage]) -> Result<String, serde_json::Error> {
        match messages {
            [single] => serde_json::to_string(single),
            many => serde_json::to_string(&BatchFrame {
                kind: "batch",
                messages: many,
            }),
        }
    }
}
