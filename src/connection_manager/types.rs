//! Connection handle and related types

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::types::ChatType;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Metadata captured from the upgrade request
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub remote_addr: IpAddr,
    pub user_agent: Option<String>,
    /// Tab id hinted in the query string; the tab is only bound by `identify_tab`
    pub tab_hint: Option<String>,
    pub chat_type: ChatType,
}

impl ConnectionMeta {
    pub fn new(remote_addr: IpAddr) -> Self {
        Self {
            remote_addr,
            user_agent: None,
            tab_hint: None,
            chat_type: ChatType::default(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_chat_type(mut self, chat_type: ChatType) -> Self {
        self.chat_type = chat_type;
        self
    }

    pub fn with_tab_hint(mut self, tab_id: impl Into<String>) -> Self {
        self.tab_hint = Some(tab_id.into());
        self
    }
}

/// Handle for a single WebSocket connection
pub struct ConnectionHandle {
    pub id: Uuid,
    pub meta: ConnectionMeta,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
    /// Last activity timestamp (Unix seconds) - using AtomicI64 for lock-free updates
    last_activity: AtomicI64,
    /// Set once the connection is being torn down; a closing connection is not live
    closing: AtomicBool,
    close_signal: Notify,
}

impl ConnectionHandle {
    pub fn new(meta: ConnectionMeta, sender: mpsc::Sender<OutboundMessage>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            meta,
            connected_at: now,
            sender,
            last_activity: AtomicI64::new(now.timestamp()),
            closing: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, secs: i64) {
        self.last_activity
            .store(Utc::now().timestamp() - secs, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    /// Seconds since the last inbound frame
    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() - self.last_activity.load(Ordering::Relaxed)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Hand an ordered batch to the connection's writer without waiting.
    pub fn try_deliver(
        &self,
        messages: Vec<ServerMessage>,
    ) -> Result<(), mpsc::error::TrySendError<OutboundMessage>> {
        self.sender.try_send(OutboundMessage::Batch(messages))
    }

    /// Start closing the connection. Anything already handed to the writer
    /// is sent before the close frame. Returns false if it was already closing.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        let reason = reason.into();
        if self
            .sender
            .try_send(OutboundMessage::Close { code, reason })
            .is_err()
        {
            // Writer is gone or backed up; wake it directly instead
            self.close_signal.notify_one();
        }
        true
    }

    /// Resolves when `close` could not enqueue a close frame
    pub async fn close_requested(&self) {
        self.close_signal.notified().await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote_addr", &self.meta.remote_addr)
            .field("chat_type", &self.meta.chat_type)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Error returned when a connection is refused at handshake
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Total connection limit exceeded ({current}/{max})")]
    TotalLimitExceeded { current: usize, max: usize },

    #[error("Too many connections from {ip} ({current}/{max})")]
    IpLimitExceeded { ip: IpAddr, current: usize, max: usize },

    #[error("Server is shutting down")]
    Draining,
}

impl ConnectionError {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionError::TotalLimitExceeded { .. } => "SERVER_FULL",
            ConnectionError::IpLimitExceeded { .. } => "TOO_MANY_CONNECTIONS",
            ConnectionError::Draining => "SHUTTING_DOWN",
        }
    }
}
