use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::chat::ChatCore;
use crate::config::{MatchmakingConfig, WebSocketConfig};
use crate::health::HealthMonitor;

/// Periodic matching pass, queue/room expiry, health sampling and mapping sweep
pub struct MaintenanceTask {
    match_interval: Duration,
    cleanup_interval: Duration,
    core: Arc<ChatCore>,
    health: Arc<HealthMonitor>,
    shutdown: broadcast::Receiver<()>,
}

impl MaintenanceTask {
    pub fn new(
        matchmaking: &MatchmakingConfig,
        websocket: &WebSocketConfig,
        core: Arc<ChatCore>,
        health: Arc<HealthMonitor>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            match_interval: Duration::from_secs(matchmaking.match_interval.max(1)),
            cleanup_interval: Duration::from_secs(websocket.cleanup_interval.max(1)),
            core,
            health,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut match_timer = tokio::time::interval(self.match_interval);
        let mut cleanup_timer = tokio::time::interval(self.cleanup_interval);
        match_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            match_interval_secs = self.match_interval.as_secs(),
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            "Maintenance task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Maintenance task received shutdown signal");
                    break;
                }
                _ = match_timer.tick() => {
                    self.match_pass();
                }
                _ = cleanup_timer.tick() => {
                    self.core.sweep_stale_mappings();
                }
            }
        }

        tracing::info!("Maintenance task stopped");
    }

    fn match_pass(&self) {
        if self.core.is_draining() {
            return;
        }

        let matches = self.core.run_matching();
        for pending in matches {
            let core = self.core.clone();
            tokio::spawn(async move {
                core.announce_match(pending).await;
            });
        }

        let expired = self.core.expire_waiting();
        let idle_rooms = self.core.close_idle_rooms();
        if expired > 0 || idle_rooms > 0 {
            tracing::info!(expired, idle_rooms, "Maintenance pass closed stale entries");
        }

        self.health.sample();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::create_chat_core;
    use crate::config::Settings;
    use crate::profile::AnonymousProfileStore;

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_samples_health_and_stops() {
        let settings = Settings::default();
        let core = create_chat_core(&settings, Arc::new(AnonymousProfileStore));
        let health = Arc::new(HealthMonitor::new(core.clone(), settings.health.clone()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = MaintenanceTask::new(
            &settings.matchmaking,
            &settings.websocket,
            core,
            health.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_secs(settings.matchmaking.match_interval * 2 + 1)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task stops")
            .unwrap();

        assert!(health.sample_count() >= 2);
    }
}
