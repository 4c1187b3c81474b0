//! Graceful shutdown handling for the pairing service.
//!
//! The sequence is:
//! 1. Stop accepting connections
//! 2. Tell every client the server is going away
//! 3. Close open rooms
//! 4. Flush the message batcher and stop it
//! 5. Signal background tasks to stop
//! 6. Wait (bounded) for clients to disconnect, then close the rest

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::chat::ChatCore;
use crate::config::ShutdownSettings;
use crate::connection_manager::DisconnectReason;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for clients to disconnect on their own (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Suggested reconnect delay to send to clients (default: 5 seconds)
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::from(&ShutdownSettings::default())
    }
}

impl From<&ShutdownSettings> for ShutdownConfig {
    fn from(settings: &ShutdownSettings) -> Self {
        Self {
            drain_timeout: Duration::from_secs(settings.drain_timeout_secs),
            reconnect_after_seconds: settings.reconnect_after_seconds,
        }
    }
}

/// Handles graceful shutdown of the pairing service
pub struct GracefulShutdown {
    core: Arc<ChatCore>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(core: Arc<ChatCore>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(core, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(core: Arc<ChatCore>, shutdown_tx: broadcast::Sender<()>, config: ShutdownConfig) -> Self {
        Self {
            core,
            shutdown_tx,
            config,
        }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.core.connections().len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Refusing new connections");
        self.core.begin_drain();

        tracing::info!("Phase 2: Notifying clients");
        result.clients_notified = self
            .core
            .notify_shutdown(reason, Some(self.config.reconnect_after_seconds));

        tracing::info!("Phase 3: Closing rooms");
        result.rooms_closed = self.core.close_all_rooms();

        tracing::info!("Phase 4: Flushing message batcher");
        result.messages_flushed = self.core.batcher().shutdown();

        tracing::info!("Phase 5: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 6: Waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;
        result.connections_forced = self.core.close_all_connections(DisconnectReason::ServerShutdown);

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            rooms_closed = result.rooms_closed,
            messages_flushed = result.messages_flushed,
            connections_closed = result.connections_closed,
            connections_forced = result.connections_forced,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    /// Wait for clients to disconnect on their own
    async fn wait_for_connections_to_close(&self) -> usize {
        let connections = self.core.connections();
        let initial = connections.len();
        if initial == 0 {
            return 0;
        }

        let wait_future = async {
            while !connections.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        let _ = timeout(self.config.drain_timeout, wait_future).await;

        let remaining = connections.len();
        if remaining > 0 {
            tracing::warn!(
                remaining_connections = remaining,
                "Some connections did not close gracefully"
            );
        }

        initial.saturating_sub(remaining)
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Connections that received `server_shutdown`
    pub clients_notified: usize,
    pub rooms_closed: usize,
    pub messages_flushed: usize,
    /// Connections that closed on their own within the drain timeout
    pub connections_closed: usize,
    /// Connections closed by the server after the drain timeout
    pub connections_forced: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::create_chat_core;
    use crate::config::Settings;
    use crate::connection_manager::{ConnectionError, ConnectionMeta};
    use crate::profile::AnonymousProfileStore;
    use crate::websocket::{OutboundMessage, ServerMessage};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn meta() -> ConnectionMeta {
        ConnectionMeta::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_shutdown_no_connections() {
        let core = create_chat_core(&Settings::default(), Arc::new(AnonymousProfileStore));
        let (tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::new(core.clone(), tx);

        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 0);
        assert_eq!(result.connections_closed, 0);
        assert!(core.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_notifies_then_closes_stragglers() {
        let core = create_chat_core(&Settings::default(), Arc::new(AnonymousProfileStore));
        let (conn_tx, mut conn_rx) = mpsc::channel(8);
        core.register_connection(meta(), conn_tx).unwrap();

        let (tx, mut tasks_rx) = broadcast::channel(1);
        let config = ShutdownConfig {
            drain_timeout: Duration::from_secs(1),
            reconnect_after_seconds: 7,
        };
        let result = GracefulShutdown::with_config(core.clone(), tx, config)
            .execute("maintenance")
            .await;

        assert_eq!(result.clients_notified, 1);
        assert_eq!(result.connections_forced, 1);
        assert!(tasks_rx.try_recv().is_ok());
        assert!(core.connections().is_empty());

        match conn_rx.recv().await.unwrap() {
            OutboundMessage::Batch(messages) => assert_eq!(
                messages,
                vec![ServerMessage::shutdown("maintenance", Some(7))]
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            conn_rx.recv().await.unwrap(),
            OutboundMessage::Close { code: 1001, .. }
        ));

        // New connections are refused once draining
        let (late_tx, _late_rx) = mpsc::channel(1);
        assert_eq!(
            core.register_connection(meta(), late_tx).unwrap_err(),
            ConnectionError::Draining
        );
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_after_seconds, 5);
    }
}
