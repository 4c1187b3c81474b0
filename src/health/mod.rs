//! Service health classification
//!
//! The monitor aggregates registry, queue, room and batcher counters into a
//! snapshot and classifies the service as healthy, degraded or down.
//! Reads never fail: a sub-component that cannot be read in time is
//! replaced by defaults and the problem is logged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::batcher::BatcherStats;
use crate::chat::{ChatCore, CoreSnapshot};
use crate::config::HealthConfig;
use crate::connection_manager::ReasonCount;
use crate::rooms::RoomStats;
use crate::types::{ChatType, PerModality};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub online_users: usize,
    pub stale_connections: usize,
    pub queue_depths: PerModality<usize>,
    pub oldest_wait_secs: PerModality<i64>,
    pub rooms: RoomStats,
    pub identified_tabs: usize,
    pub top_disconnect_reasons: Vec<ReasonCount>,
    pub batcher: BatcherStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_heartbeat_latency_ms: Option<f64>,
    pub uptime_secs: u64,
    pub draining: bool,
    /// The core state could not be read in time; its fields are defaults
    pub core_unavailable: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

/// One periodic sample used for "sustained" and "spike" rules
#[derive(Debug, Clone, Copy)]
struct HealthSample {
    queue_depths: PerModality<usize>,
    /// Cumulative ping-timeout + transport-close disconnects
    network_failures: u64,
}

pub struct HealthMonitor {
    core: Arc<ChatCore>,
    config: HealthConfig,
    started: Instant,
    samples: Mutex<VecDeque<HealthSample>>,
}

impl HealthMonitor {
    pub fn new(core: Arc<ChatCore>, config: HealthConfig) -> Self {
        Self {
            core,
            samples: Mutex::new(VecDeque::with_capacity(config.sample_history)),
            config,
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let connections = self.core.connections();
        let timeout = Duration::from_millis(self.config.read_timeout_ms);

        let (core, core_unavailable) = match self.core.try_snapshot(timeout) {
            Some(snapshot) => (snapshot, false),
            None => {
                tracing::warn!(
                    timeout_ms = self.config.read_timeout_ms,
                    "Core state read timed out, reporting defaults"
                );
                (CoreSnapshot::default(), true)
            }
        };

        HealthSnapshot {
            online_users: connections.len(),
            stale_connections: connections.stale_count(self.config.stale_after_secs),
            queue_depths: core.queue_depths,
            oldest_wait_secs: core.oldest_wait_secs,
            rooms: core.rooms,
            identified_tabs: core.identified_tabs,
            top_disconnect_reasons: connections.disconnects().top_reasons(10),
            batcher: self.core.batcher().stats(),
            avg_heartbeat_latency_ms: self.core.average_latency_ms(),
            uptime_secs: self.started.elapsed().as_secs(),
            draining: self.core.is_draining(),
            core_unavailable,
        }
    }

    /// Record a sample for trend rules. Called on the maintenance interval.
    pub fn sample(&self) {
        let snapshot = self.snapshot();
        let sample = HealthSample {
            queue_depths: snapshot.queue_depths,
            network_failures: self.core.connections().disconnects().network_failures(),
        };
        self.push_sample(sample);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    fn push_sample(&self, sample: HealthSample) {
        let mut samples = self.samples.lock();
        samples.push_back(sample);
        while samples.len() > self.config.sample_history.max(2) {
            samples.pop_front();
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let snapshot = self.snapshot();
        let mut status = HealthStatus::Healthy;
        let mut reasons = Vec::new();
        let mut raise = |level: HealthStatus, reason: String| {
            status = status.max(level);
            reasons.push(reason);
        };

        if snapshot.draining {
            raise(HealthStatus::Down, "shutting down".to_string());
        }
        if snapshot.core_unavailable {
            raise(HealthStatus::Degraded, "core state unavailable".to_string());
        }

        if snapshot.online_users > 0 {
            let ratio = snapshot.stale_connections as f64 / snapshot.online_users as f64;
            if ratio >= self.config.stale_ratio_down {
                raise(HealthStatus::Down, format!("stale connection ratio {:.2}", ratio));
            } else if ratio >= self.config.stale_ratio_degraded {
                raise(HealthStatus::Degraded, format!("stale connection ratio {:.2}", ratio));
            }
        }

        let samples = self.samples.lock();
        let needed = self.config.sustained_samples.max(1);
        if samples.len() >= needed {
            for chat_type in ChatType::ALL {
                let sustained = samples
                    .iter()
                    .rev()
                    .take(needed)
                    .all(|s| *s.queue_depths.get(chat_type) > self.config.queue_depth_threshold);
                if sustained {
                    raise(
                        HealthStatus::Degraded,
                        format!("sustained {} queue depth above {}", chat_type, self.config.queue_depth_threshold),
                    );
                }
            }
        }

        let mut recent = samples.iter().rev();
        if let (Some(last), Some(prev)) = (recent.next(), recent.next()) {
            let delta = last.network_failures.saturating_sub(prev.network_failures);
            if delta >= self.config.disconnect_spike {
                raise(
                    HealthStatus::Degraded,
                    format!("{} ping-timeout/transport-close disconnects since last sample", delta),
                );
            }
        }
        drop(samples);

        if status != HealthStatus::Healthy {
            tracing::debug!(status = status.as_str(), reasons = ?reasons, "Health check");
        }

        HealthReport {
            status,
            reasons,
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::create_chat_core;
    use crate::config::Settings;
    use crate::connection_manager::{ConnectionMeta, DisconnectReason};
    use crate::profile::AnonymousProfileStore;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn monitor(config: HealthConfig) -> HealthMonitor {
        let core = create_chat_core(&Settings::default(), Arc::new(AnonymousProfileStore));
        HealthMonitor::new(core, config)
    }

    fn sample(text_depth: usize, network_failures: u64) -> HealthSample {
        HealthSample {
            queue_depths: PerModality {
                text: text_depth,
                video: 0,
            },
            network_failures,
        }
    }

    #[test]
    fn test_idle_service_is_healthy() {
        let monitor = monitor(HealthConfig::default());
        let report = monitor.health_check();

        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.reasons.is_empty());
        assert_eq!(report.snapshot.online_users, 0);
    }

    #[test]
    fn test_sustained_queue_depth_degrades() {
        let config = HealthConfig {
            queue_depth_threshold: 10,
            sustained_samples: 3,
            ..HealthConfig::default()
        };
        let monitor = monitor(config);

        monitor.push_sample(sample(50, 0));
        monitor.push_sample(sample(50, 0));
        assert_eq!(monitor.health_check().status, HealthStatus::Healthy);

        monitor.push_sample(sample(50, 0));
        let report = monitor.health_check();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.reasons[0].contains("text"));

        // One sample back under threshold clears it
        monitor.push_sample(sample(1, 0));
        assert_eq!(monitor.health_check().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_disconnect_spike_degrades() {
        let config = HealthConfig {
            disconnect_spike: 20,
            ..HealthConfig::default()
        };
        let monitor = monitor(config);

        monitor.push_sample(sample(0, 5));
        monitor.push_sample(sample(0, 10));
        assert_eq!(monitor.health_check().status, HealthStatus::Healthy);

        monitor.push_sample(sample(0, 40));
        assert_eq!(monitor.health_check().status, HealthStatus::Degraded);
    }

    #[test]
    fn test_sample_history_is_bounded() {
        let config = HealthConfig {
            sample_history: 3,
            ..HealthConfig::default()
        };
        let monitor = monitor(config);
        for i in 0..10 {
            monitor.push_sample(sample(i, 0));
        }
        assert_eq!(monitor.samples.lock().len(), 3);
    }

    #[test]
    fn test_sample_reads_network_failures() {
        let monitor = monitor(HealthConfig::default());
        let connections = monitor.core.connections();
        for reason in [DisconnectReason::PingTimeout, DisconnectReason::ClientClose] {
            let (tx, _rx) = mpsc::channel(1);
            let handle = connections
                .register(ConnectionMeta::new(IpAddr::V4(Ipv4Addr::LOCALHOST)), tx)
                .unwrap();
            connections.unregister(handle.id, reason);
        }

        monitor.sample();
        assert_eq!(monitor.samples.lock().back().unwrap().network_failures, 1);
    }

    #[test]
    fn test_stale_connections_take_service_down() {
        let config = HealthConfig {
            stale_after_secs: 0,
            ..HealthConfig::default()
        };
        let monitor = monitor(config);
        let (tx, _rx) = mpsc::channel(1);
        let handle = monitor
            .core
            .connections()
            .register(ConnectionMeta::new(IpAddr::V4(Ipv4Addr::LOCALHOST)), tx)
            .unwrap();
        // Make the connection look silent for a while
        handle.backdate_activity(30);

        let report = monitor.health_check();
        assert_eq!(report.status, HealthStatus::Down);
        assert_eq!(report.snapshot.stale_connections, 1);
    }

    #[test]
    fn test_draining_is_down() {
        let monitor = monitor(HealthConfig::default());
        monitor.core.begin_drain();

        let report = monitor.health_check();
        assert_eq!(report.status, HealthStatus::Down);
        assert!(report.snapshot.draining);
    }

    #[test]
    fn test_report_serializes_flat() {
        let monitor = monitor(HealthConfig::default());
        let json = serde_json::to_value(monitor.health_check()).unwrap();

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["onlineUsers"], 0);
        assert!(json["queueDepths"]["text"].is_number());
    }
}
