use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::chat::ChatCore;
use crate::config::WebSocketConfig;

/// Background task for heartbeats and unresponsive-connection reaping
pub struct HeartbeatTask {
    config: WebSocketConfig,
    core: Arc<ChatCore>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(config: WebSocketConfig, core: Arc<ChatCore>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            config,
            core,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        // Skip immediate first tick
        heartbeat_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.tick(connection_timeout);
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    fn tick(&self, connection_timeout: u64) {
        if self.core.is_draining() {
            return;
        }
        let start = Instant::now();
        let reaped = self.core.reap_idle_connections(connection_timeout);
        let sent = self.core.broadcast_heartbeat();

        if sent > 0 || reaped > 0 {
            tracing::debug!(
                sent,
                reaped,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Heartbeat round completed"
            );
        }
    }
}
