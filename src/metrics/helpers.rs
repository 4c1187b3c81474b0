//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::connection_manager::DisconnectReason;
use crate::types::{ChatType, PerModality};

use super::{
    BATCHES_DEFERRED, BATCHES_FLUSHED, BATCH_SIZE, CONNECTIONS_ACTIVE, CONNECTIONS_OPENED, CONNECTIONS_REJECTED,
    DISCONNECTS_TOTAL, FORCE_MATCHES, HEARTBEAT_LATENCY_MS, HEARTBEAT_TIMEOUTS, MATCHES_TOTAL,
    MATCH_ROLLBACKS, MESSAGES_DELIVERED, MESSAGES_DROPPED, MESSAGES_RELAYED, QUEUE_DEPTH,
    ROOMS_CLOSED, ROOMS_OPEN, SEARCH_TIMEOUTS, SESSION_DURATION,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        CONNECTIONS_OPENED.inc();
        CONNECTIONS_ACTIVE.inc();
    }

    /// Record a refused handshake, labelled by refusal code
    pub fn record_rejected(code: &str) {
        CONNECTIONS_REJECTED.with_label_values(&[code]).inc();
    }

    pub fn record_closed(reason: DisconnectReason, session: Duration) {
        CONNECTIONS_ACTIVE.dec();
        DISCONNECTS_TOTAL.with_label_values(&[reason.as_str()]).inc();
        SESSION_DURATION.observe(session.as_secs_f64());
    }
}

pub struct MatchMetrics;

impl MatchMetrics {
    pub fn record_match(chat_type: ChatType) {
        MATCHES_TOTAL.with_label_values(&[chat_type.as_str()]).inc();
    }

    pub fn record_rollback() {
        MATCH_ROLLBACKS.inc();
    }

    pub fn record_force_match() {
        FORCE_MATCHES.inc();
    }

    pub fn record_search_timeouts(count: usize) {
        SEARCH_TIMEOUTS.inc_by(count as u64);
    }

    /// Publish current queue depths
    pub fn set_queue_depths(depths: PerModality<usize>) {
        for chat_type in ChatType::ALL {
            QUEUE_DEPTH
                .with_label_values(&[chat_type.as_str()])
                .set(*depths.get(chat_type) as i64);
        }
    }
}

pub struct RoomMetrics;

impl RoomMetrics {
    pub fn set_open(count: usize) {
        ROOMS_OPEN.set(count as i64);
    }

    pub fn record_closed(reason: &str) {
        ROOMS_CLOSED.with_label_values(&[reason]).inc();
    }

    pub fn record_relayed() {
        MESSAGES_RELAYED.inc();
    }
}

pub struct BatcherMetrics;

impl BatcherMetrics {
    pub fn record_flushed(size: usize) {
        BATCHES_FLUSHED.inc();
        MESSAGES_DELIVERED.inc_by(size as u64);
        BATCH_SIZE.observe(size as f64);
    }

    pub fn record_deferred() {
        BATCHES_DEFERRED.inc();
    }

    pub fn record_backpressure_drop() {
        MESSAGES_DROPPED.with_label_values(&["backpressure"]).inc();
    }

    pub fn record_delivery_drop(count: usize) {
        MESSAGES_DROPPED
            .with_label_values(&["delivery"])
            .inc_by(count as u64);
    }
}

pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_latency(latency_ms: f64) {
        HEARTBEAT_LATENCY_MS.observe(latency_ms);
    }

    pub fn record_timeouts(count: usize) {
        HEARTBEAT_TIMEOUTS.inc_by(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_do_not_panic() {
        ConnectionMetrics::record_opened();
        ConnectionMetrics::record_rejected("TOO_MANY_CONNECTIONS");
        ConnectionMetrics::record_closed(DisconnectReason::ClientClose, Duration::from_secs(3));
        MatchMetrics::record_match(ChatType::Text);
        MatchMetrics::set_queue_depths(PerModality { text: 2, video: 0 });
        RoomMetrics::record_closed("left");
        BatcherMetrics::record_flushed(3);
        BatcherMetrics::record_delivery_drop(2);
        HeartbeatMetrics::record_latency(42.0);
    }
}
