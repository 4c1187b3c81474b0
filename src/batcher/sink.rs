use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::connection_manager::ConnectionManager;
use crate::websocket::{OutboundMessage, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Target {0} is not connected")]
    TargetGone(Uuid),

    #[error("Outbound channel for {0} is full")]
    ChannelFull(Uuid),

    #[error("Message batcher is shutting down")]
    ShuttingDown,
}

/// A batch the sink did not accept, handed back intact
#[derive(Debug)]
pub struct Undelivered {
    pub error: DeliveryError,
    pub batch: Vec<ServerMessage>,
}

/// Destination for flushed batches
pub trait BatchSink: Send + Sync + 'static {
    /// Hand `batch` to `target` without blocking
    fn deliver(&self, target: Uuid, batch: Vec<ServerMessage>) -> Result<(), Undelivered>;
}

impl BatchSink for ConnectionManager {
    fn deliver(&self, target: Uuid, batch: Vec<ServerMessage>) -> Result<(), Undelivered> {
        let Some(handle) = self.get(target) else {
            return Err(Undelivered {
                error: DeliveryError::TargetGone(target),
                batch,
            });
        };

        handle.try_deliver(batch).map_err(|e| {
            let error = match &e {
                TrySendError::Full(_) => DeliveryError::ChannelFull(target),
                TrySendError::Closed(_) => DeliveryError::TargetGone(target),
            };
            let batch = match e.into_inner() {
                OutboundMessage::Batch(batch) => batch,
                OutboundMessage::Close { .. } => Vec::new(),
            };
            Undelivered { error, batch }
        })
    }
}
