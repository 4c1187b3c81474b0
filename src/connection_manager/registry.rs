use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::websocket::OutboundMessage;

use super::stats::{ConnectionStats, DisconnectReason, DisconnectStats};
use super::types::{ConnectionError, ConnectionHandle, ConnectionMeta};

/// Manages all active WebSocket connections and per-IP admission
pub struct ConnectionManager {
    /// connection_id -> ConnectionHandle
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    /// remote ip -> live connection count
    ip_index: DashMap<IpAddr, usize>,
    total: AtomicUsize,
    limits: LimitsConfig,
    accepting: AtomicBool,
    disconnects: DisconnectStats,
    total_opened: AtomicU64,
    total_rejected: AtomicU64,
}

impl ConnectionManager {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            connections: DashMap::new(),
            ip_index: DashMap::new(),
            total: AtomicUsize::new(0),
            limits,
            accepting: AtomicBool::new(true),
            disconnects: DisconnectStats::new(),
            total_opened: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> LimitsConfig {
        self.limits
    }

    /// Register a new connection, refusing it when the global or per-IP
    /// ceiling is reached. A refused connection leaves no state behind.
    pub fn register(
        &self,
        meta: ConnectionMeta,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        if !self.accepting.load(Ordering::Acquire) {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ConnectionError::Draining);
        }

        let max = self.limits.max_connections;
        if let Err(current) = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
        {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ConnectionError::TotalLimitExceeded { current, max });
        }

        let ip = meta.remote_addr;
        let max_per_ip = self.limits.max_connections_per_ip;
        {
            // Entry guard makes check-and-increment atomic per ip
            let mut count = self.ip_index.entry(ip).or_insert(0);
            if *count >= max_per_ip {
                let current = *count;
                drop(count);
                self.total.fetch_sub(1, Ordering::AcqRel);
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                self.ip_index.remove_if(&ip, |_, n| *n == 0);
                return Err(ConnectionError::IpLimitExceeded {
                    ip,
                    current,
                    max: max_per_ip,
                });
            }
            *count += 1;
        }

        let handle = Arc::new(ConnectionHandle::new(meta, sender));
        self.connections.insert(handle.id, handle.clone());
        self.total_opened.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            connection_id = %handle.id,
            remote_addr = %ip,
            chat_type = %handle.meta.chat_type,
            "Connection registered"
        );

        Ok(handle)
    }

    /// Unregister a connection. Returns the handle the first time only.
    pub fn unregister(&self, connection_id: Uuid, reason: DisconnectReason) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(&connection_id)?;

        let ip = handle.meta.remote_addr;
        if let Entry::Occupied(mut entry) = self.ip_index.entry(ip) {
            *entry.get_mut() = entry.get().saturating_sub(1);
            if *entry.get() == 0 {
                entry.remove();
            }
        }
        self.total.fetch_sub(1, Ordering::AcqRel);

        let session = (Utc::now() - handle.connected_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.disconnects.record(reason, session);

        tracing::info!(
            connection_id = %connection_id,
            reason = reason.as_str(),
            session_secs = session.as_secs(),
            "Connection unregistered"
        );

        Some(handle)
    }

    /// Get connection by ID
    pub fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    /// Registered and not being torn down
    pub fn is_live(&self, connection_id: Uuid) -> bool {
        self.connections
            .get(&connection_id)
            .map(|h| !h.is_closing())
            .unwrap_or(false)
    }

    /// Get all connections
    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ip_connection_count(&self, ip: IpAddr) -> usize {
        self.ip_index.get(&ip).map(|n| *n).unwrap_or(0)
    }

    /// Connections with no inbound activity for longer than `timeout_secs`
    pub fn idle_connections(&self, timeout_secs: u64) -> Vec<Arc<ConnectionHandle>> {
        let now = Utc::now();
        self.connections
            .iter()
            .filter(|entry| entry.value().idle_secs(now) > timeout_secs as i64)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn stale_count(&self, stale_after_secs: u64) -> usize {
        let now = Utc::now();
        self.connections
            .iter()
            .filter(|entry| entry.value().idle_secs(now) > stale_after_secs as i64)
            .count()
    }

    /// Refuse all further registrations
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn disconnects(&self) -> &DisconnectStats {
        &self.disconnects
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            total_connections: self.connections.len(),
            unique_ips: self.ip_index.len(),
            total_opened: self.total_opened.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(LimitsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn register(
        manager: &ConnectionManager,
        addr: IpAddr,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let (tx, _rx) = mpsc::channel(8);
        manager.register(ConnectionMeta::new(addr), tx)
    }

    #[test]
    fn test_sixth_connection_from_same_ip_is_refused() {
        let manager = ConnectionManager::new(LimitsConfig {
            max_connections: 100,
            max_connections_per_ip: 5,
        });

        for _ in 0..5 {
            register(&manager, ip(1)).unwrap();
        }
        let err = register(&manager, ip(1)).unwrap_err();

        assert!(matches!(err, ConnectionError::IpLimitExceeded { current: 5, max: 5, .. }));
        assert_eq!(manager.len(), 5);
        assert_eq!(manager.ip_connection_count(ip(1)), 5);
        assert_eq!(manager.stats().total_rejected, 1);

        // Other addresses are unaffected
        assert!(register(&manager, ip(2)).is_ok());
    }

    #[test]
    fn test_unregister_frees_ip_slot() {
        let manager = ConnectionManager::new(LimitsConfig {
            max_connections: 100,
            max_connections_per_ip: 1,
        });
        let handle = register(&manager, ip(1)).unwrap();
        assert!(register(&manager, ip(1)).is_err());

        assert!(manager.unregister(handle.id, DisconnectReason::ClientClose).is_some());
        assert_eq!(manager.ip_connection_count(ip(1)), 0);
        assert!(register(&manager, ip(1)).is_ok());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let manager = ConnectionManager::default();
        let handle = register(&manager, ip(1)).unwrap();

        assert!(manager.unregister(handle.id, DisconnectReason::ClientClose).is_some());
        assert!(manager.unregister(handle.id, DisconnectReason::ClientClose).is_none());
        assert_eq!(manager.disconnects().total(), 1);
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_total_limit() {
        let manager = ConnectionManager::new(LimitsConfig {
            max_connections: 2,
            max_connections_per_ip: 10,
        });
        register(&manager, ip(1)).unwrap();
        register(&manager, ip(2)).unwrap();

        let err = register(&manager, ip(3)).unwrap_err();
        assert_eq!(err, ConnectionError::TotalLimitExceeded { current: 2, max: 2 });
        assert_eq!(manager.ip_connection_count(ip(3)), 0);
    }

    #[test]
    fn test_draining_refuses_connections() {
        let manager = ConnectionManager::default();
        manager.stop_accepting();
        assert_eq!(register(&manager, ip(1)).unwrap_err(), ConnectionError::Draining);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_closing_connection_is_not_live() {
        let manager = ConnectionManager::default();
        let handle = register(&manager, ip(1)).unwrap();
        assert!(manager.is_live(handle.id));

        handle.close(1000, "bye");
        assert!(!manager.is_live(handle.id));
        assert!(manager.get(handle.id).is_some());
    }
}
