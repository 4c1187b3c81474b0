//! Connection statistics and disconnect bookkeeping

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Client sent a close frame
    ClientClose,
    /// Socket ended without a close frame
    TransportClose,
    /// Socket read/write error
    TransportError,
    /// No activity within the connection timeout
    PingTimeout,
    /// Evicted by a newer connection for the same tab
    DuplicateTab,
    /// Evicted by a newer connection for the same (auth id, modality)
    AuthConflict,
    /// Tab never identified within the handshake timeout
    HandshakeTimeout,
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClose => "client_close",
            DisconnectReason::TransportClose => "transport_close",
            DisconnectReason::TransportError => "transport_error",
            DisconnectReason::PingTimeout => "ping_timeout",
            DisconnectReason::DuplicateTab => "duplicate_tab",
            DisconnectReason::AuthConflict => "auth_conflict",
            DisconnectReason::HandshakeTimeout => "handshake_timeout",
            DisconnectReason::ServerShutdown => "server_shutdown",
        }
    }

    /// Reasons that indicate network trouble rather than user intent
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            DisconnectReason::PingTimeout | DisconnectReason::TransportClose
        )
    }

    /// Close frame code sent when the server ends the connection for this reason
    pub fn close_code(&self) -> u16 {
        match self {
            DisconnectReason::DuplicateTab => 4001,
            DisconnectReason::AuthConflict => 4002,
            DisconnectReason::PingTimeout => 4003,
            DisconnectReason::HandshakeTimeout => 4004,
            DisconnectReason::ServerShutdown => 1001,
            _ => 1000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ReasonTotals {
    count: u64,
    session_time: Duration,
}

/// Histogram of disconnect reasons with session durations
#[derive(Debug, Default)]
pub struct DisconnectStats {
    reasons: Mutex<HashMap<DisconnectReason, ReasonTotals>>,
}

impl DisconnectStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reason: DisconnectReason, session: Duration) {
        let mut reasons = self.reasons.lock();
        let totals = reasons.entry(reason).or_default();
        totals.count += 1;
        totals.session_time += session;
    }

    pub fn count(&self, reason: DisconnectReason) -> u64 {
        self.reasons.lock().get(&reason).map(|t| t.count).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.reasons.lock().values().map(|t| t.count).sum()
    }

    /// Cumulative ping-timeout + transport-close disconnects
    pub fn network_failures(&self) -> u64 {
        self.reasons
            .lock()
            .iter()
            .filter(|(reason, _)| reason.is_network_failure())
            .map(|(_, t)| t.count)
            .sum()
    }

    /// Most frequent reasons first, ties broken by name
    pub fn top_reasons(&self, limit: usize) -> Vec<ReasonCount> {
        let reasons = self.reasons.lock();
        let mut out: Vec<ReasonCount> = reasons
            .iter()
            .map(|(reason, totals)| ReasonCount {
                reason: *reason,
                count: totals.count,
                avg_session_secs: if totals.count == 0 {
                    0.0
                } else {
                    totals.session_time.as_secs_f64() / totals.count as f64
                },
            })
            .collect();
        drop(reasons);

        out.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.reason.as_str().cmp(b.reason.as_str()))
        });
        out.truncate(limit);
        out
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasonCount {
    pub reason: DisconnectReason,
    pub count: u64,
    pub avg_session_secs: f64,
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub unique_ips: usize,
    pub total_opened: u64,
    pub total_rejected: u64,
}
