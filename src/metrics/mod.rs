//! Prometheus metrics for the pairing service.
//!
//! - Connection metrics (opened, closed by reason, rejected, active)
//! - Matchmaking metrics (queue depth, matches, rollbacks)
//! - Room and batcher metrics
//! - Heartbeat latency

mod helpers;

pub use helpers::{
    encode_metrics, BatcherMetrics, ConnectionMetrics, HeartbeatMetrics, MatchMetrics, RoomMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "pairline";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of active WebSocket connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of active WebSocket connections"
    ).unwrap();

    pub static ref CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections accepted"
    ).unwrap();

    /// Refused handshakes by cause
    pub static ref CONNECTIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_rejected_total", METRIC_PREFIX),
        "Total WebSocket handshakes refused",
        &["code"]
    ).unwrap();

    pub static ref DISCONNECTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_disconnects_total", METRIC_PREFIX),
        "Total disconnects by reason",
        &["reason"]
    ).unwrap();

    pub static ref SESSION_DURATION: Histogram = register_histogram!(
        format!("{}_session_duration_seconds", METRIC_PREFIX),
        "Connection lifetime in seconds",
        vec![1.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();

    // ============================================================================
    // Matchmaking Metrics
    // ============================================================================

    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_queue_depth", METRIC_PREFIX),
        "Waiting tickets per chat type",
        &["chat_type"]
    ).unwrap();

    pub static ref MATCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_matches_total", METRIC_PREFIX),
        "Total matches made per chat type",
        &["chat_type"]
    ).unwrap();

    /// Matches undone because one side vanished before notification
    pub static ref MATCH_ROLLBACKS: IntCounter = register_int_counter!(
        format!("{}_match_rollbacks_total", METRIC_PREFIX),
        "Total matches rolled back"
    ).unwrap();

    pub static ref FORCE_MATCHES: IntCounter = register_int_counter!(
        format!("{}_force_matches_total", METRIC_PREFIX),
        "Total administrative force matches"
    ).unwrap();

    pub static ref SEARCH_TIMEOUTS: IntCounter = register_int_counter!(
        format!("{}_search_timeouts_total", METRIC_PREFIX),
        "Total tickets expired by the wait ceiling"
    ).unwrap();

    // ============================================================================
    // Room Metrics
    // ============================================================================

    pub static ref ROOMS_OPEN: IntGauge = register_int_gauge!(
        format!("{}_rooms_open", METRIC_PREFIX),
        "Number of open rooms"
    ).unwrap();

    pub static ref ROOMS_CLOSED: IntCounterVec = register_int_counter_vec!(
        format!("{}_rooms_closed_total", METRIC_PREFIX),
        "Total rooms closed by reason",
        &["reason"]
    ).unwrap();

    pub static ref MESSAGES_RELAYED: IntCounter = register_int_counter!(
        format!("{}_messages_relayed_total", METRIC_PREFIX),
        "Total room messages relayed to a partner"
    ).unwrap();

    // ============================================================================
    // Batcher Metrics
    // ============================================================================

    pub static ref BATCHES_FLUSHED: IntCounter = register_int_counter!(
        format!("{}_batches_flushed_total", METRIC_PREFIX),
        "Total batches handed to connections"
    ).unwrap();

    pub static ref MESSAGES_DELIVERED: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total messages handed to connections"
    ).unwrap();

    pub static ref BATCHES_DEFERRED: IntCounter = register_int_counter!(
        format!("{}_batches_deferred_total", METRIC_PREFIX),
        "Batches put back because the connection's outbound channel was full"
    ).unwrap();

    /// Dropped messages by cause (backpressure, delivery)
    pub static ref MESSAGES_DROPPED: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_dropped_total", METRIC_PREFIX),
        "Total messages dropped",
        &["cause"]
    ).unwrap();

    pub static ref BATCH_SIZE: Histogram = register_histogram!(
        format!("{}_batch_size", METRIC_PREFIX),
        "Messages per flushed batch",
        vec![1.0, 2.0, 4.0, 8.0, 16.0, 64.0, 256.0]
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    pub static ref HEARTBEAT_LATENCY_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_latency_ms", METRIC_PREFIX),
        "Client reported heartbeat round trip in milliseconds",
        vec![10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]
    ).unwrap();

    pub static ref HEARTBEAT_TIMEOUTS: IntCounter = register_int_counter!(
        format!("{}_heartbeat_timeouts_total", METRIC_PREFIX),
        "Total connections closed for missing heartbeats"
    ).unwrap();
}
