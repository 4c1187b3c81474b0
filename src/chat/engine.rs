use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::batcher::MessageBatcher;
use crate::config::{MatchmakingConfig, ProfileConfig, RoomConfig};
use crate::connection_manager::{
    ConnectionError, ConnectionHandle, ConnectionManager, ConnectionMeta, DisconnectReason,
    IdentifyRequest, TabSession,
};
use crate::matchmaking::{normalize_with, EnqueueOutcome, MatchPair, TicketInfo, WaitingTicket};
use crate::metrics::{ConnectionMetrics, HeartbeatMetrics, MatchMetrics, RoomMetrics};
use crate::profile::{resolve_display_identity, DisplayIdentity, ProfileStore};
use crate::rooms::{AckOutcome, CloseReason, ClosedRoom};
use crate::types::{ChatType, PerModality};
use crate::websocket::{IdentifyTab, OutboundMessage, ServerMessage};

use super::error::CoreError;
use super::types::{CoreSnapshot, FindOutcome, MatchState, PendingMatch};

/// Settings the core consults at runtime
#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub matchmaking: MatchmakingConfig,
    pub rooms: RoomConfig,
    pub profile_timeout: Duration,
}

impl CoreOptions {
    pub fn new(matchmaking: &MatchmakingConfig, rooms: &RoomConfig, profile: &ProfileConfig) -> Self {
        Self {
            matchmaking: matchmaking.clone(),
            rooms: rooms.clone(),
            profile_timeout: Duration::from_millis(profile.lookup_timeout_ms),
        }
    }
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self::new(
            &MatchmakingConfig::default(),
            &RoomConfig::default(),
            &ProfileConfig::default(),
        )
    }
}

/// Owner of all pairing state.
///
/// Tab sessions, waiting tickets and rooms live in one [`MatchState`] behind a
/// single mutex. Every operation takes the lock, mutates synchronously,
/// queues its outbound events and releases the lock before any await.
pub struct ChatCore {
    connections: Arc<ConnectionManager>,
    batcher: Arc<MessageBatcher>,
    state: Mutex<MatchState>,
    profiles: Arc<dyn ProfileStore>,
    options: CoreOptions,
    draining: AtomicBool,
    latency_sum_ms: AtomicU64,
    latency_samples: AtomicU64,
}

impl ChatCore {
    pub fn new(
        connections: Arc<ConnectionManager>,
        batcher: Arc<MessageBatcher>,
        profiles: Arc<dyn ProfileStore>,
        options: CoreOptions,
    ) -> Self {
        Self {
            state: Mutex::new(MatchState::new(options.matchmaking.allow_same_ip)),
            connections,
            batcher,
            profiles,
            options,
            draining: AtomicBool::new(false),
            latency_sum_ms: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn batcher(&self) -> &Arc<MessageBatcher> {
        &self.batcher
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    pub fn register_connection(
        &self,
        meta: ConnectionMeta,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        match self.connections.register(meta, sender) {
            Ok(handle) => {
                ConnectionMetrics::record_opened();
                Ok(handle)
            }
            Err(e) => {
                ConnectionMetrics::record_rejected(e.code());
                tracing::warn!(error = %e, "Connection refused");
                Err(e)
            }
        }
    }

    /// Bind the connection to a tab, evicting any live connection that holds
    /// the same tab or the same (auth id, chat type).
    ///
    /// Returns `None` when the request carries no tab id or the connection is
    /// already gone; neither case mutates state.
    pub fn identify_tab(&self, connection_id: Uuid, request: IdentifyTab) -> Option<TabSession> {
        let Some(tab_id) = request.tab_id.filter(|t| !t.trim().is_empty()) else {
            tracing::warn!(connection_id = %connection_id, "identify_tab without tabId ignored");
            return None;
        };
        let Some(handle) = self.connections.get(connection_id) else {
            tracing::debug!(connection_id = %connection_id, "identify_tab from unknown connection");
            return None;
        };
        let chat_type = request.chat_type.unwrap_or(handle.meta.chat_type);

        let mut evicted: Vec<(Uuid, DisconnectReason)> = Vec::new();
        let session = {
            let mut state = self.state.lock();
            let outcome = state.tabs.identify(
                IdentifyRequest {
                    connection_id,
                    remote_addr: handle.meta.remote_addr,
                    tab_id: tab_id.clone(),
                    chat_type,
                    auth_id: request.auth_id.clone(),
                },
                |id| self.connections.is_live(id),
            );

            if let Some(old) = outcome.duplicate_of {
                tracing::info!(
                    tab_id = %tab_id,
                    old_connection = %old,
                    new_connection = %connection_id,
                    "Duplicate tab, evicting previous connection"
                );
                self.send(
                    old,
                    ServerMessage::DuplicateTabDetected {
                        tab_id: tab_id.clone(),
                        message: "This tab was opened in another window".to_string(),
                    },
                );
                evicted.push((old, DisconnectReason::DuplicateTab));
            }
            for other in &outcome.auth_conflicts {
                tracing::info!(
                    chat_type = %chat_type,
                    old_connection = %other,
                    new_connection = %connection_id,
                    "Auth conflict, evicting previous connection"
                );
                self.send(
                    *other,
                    ServerMessage::AuthConflictDetected {
                        chat_type,
                        message: "Your account connected from another tab".to_string(),
                    },
                );
                evicted.push((*other, DisconnectReason::AuthConflict));
            }

            // Evicted sockets leave the queue and their rooms before the lock drops
            for (id, _) in &evicted {
                if let Some(closed) = state.rooms.close_for_connection(*id, CloseReason::Disconnected) {
                    self.settle_closed_room(&mut state, closed);
                }
                state.queue.cancel(*id);
            }

            self.send(
                connection_id,
                ServerMessage::TabIdentified {
                    socket_id: connection_id,
                    tab_id: tab_id.clone(),
                    chat_type,
                    is_reconnect: request.is_reconnect,
                    timestamp: Utc::now().timestamp_millis(),
                },
            );
            outcome.session
        };

        for (id, reason) in evicted {
            self.close_connection(id, reason);
        }

        Some(session)
    }

    /// Deliver pending notices, close the socket and drop its state
    pub fn close_connection(&self, connection_id: Uuid, reason: DisconnectReason) {
        self.batcher.flush_now(connection_id);
        match self.connections.get(connection_id) {
            Some(handle) => {
                handle.close(reason.close_code(), reason.as_str());
            }
            None => {
                tracing::debug!(connection_id = %connection_id, "Eviction target already gone");
            }
        }
        self.handle_disconnect(connection_id, reason);
    }

    /// Tear down everything a connection owns. Safe to call more than once.
    pub fn handle_disconnect(&self, connection_id: Uuid, reason: DisconnectReason) {
        if let Some(handle) = self.connections.unregister(connection_id, reason) {
            let session = (Utc::now() - handle.connected_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            ConnectionMetrics::record_closed(reason, session);
        }

        {
            let mut state = self.state.lock();
            state.tabs.remove_connection(connection_id);
            state.queue.cancel(connection_id);
            if let Some(closed) = state
                .rooms
                .close_for_connection(connection_id, CloseReason::Disconnected)
            {
                self.settle_closed_room(&mut state, closed);
            }
        }

        self.batcher.discard(connection_id);
    }

    // ------------------------------------------------------------------
    // Matchmaking
    // ------------------------------------------------------------------

    /// Queue the connection for a partner, leaving any current room first
    pub fn find_partner(&self, connection_id: Uuid, interests: &[String]) -> Result<FindOutcome, CoreError> {
        let interests = normalize_with(&self.options.matchmaking, interests);
        let mut state = self.state.lock();

        let session = state
            .tabs
            .session(connection_id)
            .cloned()
            .ok_or(CoreError::NotIdentified(connection_id))?;

        if let Some(room_id) = state.rooms.room_of(connection_id) {
            let closed = state.rooms.leave(room_id, connection_id)?;
            self.settle_closed_room(&mut state, closed);
        }

        let ticket = WaitingTicket::new(connection_id, session.chat_type, interests, session.remote_addr)
            .with_auth_id(session.auth_id);

        match state.queue.enqueue(ticket) {
            EnqueueOutcome::Queued { position } => {
                tracing::debug!(
                    connection_id = %connection_id,
                    chat_type = %session.chat_type,
                    position,
                    "Waiting for partner"
                );
                self.send(
                    connection_id,
                    ServerMessage::Searching {
                        chat_type: session.chat_type,
                        position,
                    },
                );
                Ok(FindOutcome::Queued { position })
            }
            EnqueueOutcome::Matched(pair) => match self.open_room(&mut state, pair) {
                Some(pending) => Ok(FindOutcome::Matched(pending)),
                None => Ok(FindOutcome::Queued {
                    position: state.queue.position(connection_id).unwrap_or(0),
                }),
            },
        }
    }

    /// Remove the caller's ticket if present. Always answers `search_cancelled`.
    pub fn cancel_search(&self, connection_id: Uuid) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.queue.cancel(connection_id).is_some();
            self.send(connection_id, ServerMessage::SearchCancelled);
            removed
        };
        tracing::debug!(connection_id = %connection_id, removed, "Search cancelled");
        removed
    }

    /// Re-run pairing over every queue
    pub fn run_matching(&self) -> Vec<PendingMatch> {
        let mut state = self.state.lock();
        let mut pending = Vec::new();
        for chat_type in ChatType::ALL {
            for pair in state.queue.run_matching(chat_type) {
                if let Some(p) = self.open_room(&mut state, pair) {
                    pending.push(p);
                }
            }
        }
        pending
    }

    /// Pair the two longest-waiting tickets regardless of interests or conflicts
    pub fn force_match(&self, chat_type: ChatType) -> Option<PendingMatch> {
        let mut state = self.state.lock();
        let pair = state.queue.force_match(chat_type)?;
        MatchMetrics::record_force_match();
        tracing::info!(
            chat_type = %chat_type,
            first = %pair.waiting.connection_id,
            second = %pair.arriving.connection_id,
            "Force match"
        );
        self.open_room(&mut state, pair)
    }

    /// Drop tickets past the configured wait ceiling
    pub fn expire_waiting(&self) -> usize {
        let Some(max_wait) = self.options.matchmaking.max_wait_secs else {
            return 0;
        };

        let mut state = self.state.lock();
        let expired = state.queue.expire(Duration::from_secs(max_wait), Utc::now());
        for ticket in &expired {
            self.send(
                ticket.connection_id,
                ServerMessage::SearchTimeout {
                    chat_type: ticket.chat_type,
                },
            );
        }
        if !expired.is_empty() {
            MatchMetrics::record_search_timeouts(expired.len());
            tracing::info!(count = expired.len(), "Search timeouts");
        }
        expired.len()
    }

    fn open_room(&self, state: &mut MatchState, pair: MatchPair) -> Option<PendingMatch> {
        let tickets = [pair.waiting.clone(), pair.arriving.clone()];
        match state.rooms.create(pair) {
            Ok(room) => {
                MatchMetrics::record_match(room.chat_type);
                tracing::info!(
                    room_id = %room.id,
                    chat_type = %room.chat_type,
                    shared = ?room.shared_interests,
                    "Match made"
                );
                Some(PendingMatch {
                    room_id: room.id,
                    chat_type: room.chat_type,
                    members: room.members,
                    auth_ids: [room.tickets[0].auth_id.clone(), room.tickets[1].auth_id.clone()],
                    shared_interests: room.shared_interests.clone(),
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "Matched a connection that is already in a room");
                for ticket in tickets {
                    if state.rooms.room_of(ticket.connection_id).is_none() {
                        state.queue.requeue_front(ticket);
                    }
                }
                None
            }
        }
    }

    /// Look up both display identities, then tell both members.
    /// Returns false if the match was rolled back.
    pub async fn announce_match(&self, pending: PendingMatch) -> bool {
        let timeout = self.options.profile_timeout;
        let store = self.profiles.as_ref();
        let (first, second) = futures::join!(
            resolve_display_identity(store, pending.auth_ids[0].as_deref(), timeout),
            resolve_display_identity(store, pending.auth_ids[1].as_deref(), timeout),
        );
        self.deliver_match(&pending, [first, second])
    }

    /// Notify both members of a match, or roll it back if either side is no
    /// longer live. The live side goes back to the head of its queue.
    pub fn deliver_match(&self, pending: &PendingMatch, identities: [DisplayIdentity; 2]) -> bool {
        let mut state = self.state.lock();

        if state.rooms.get(pending.room_id).is_none() {
            tracing::debug!(room_id = %pending.room_id, "Room closed before it was announced");
            return false;
        }

        if let Some(gone) = pending
            .members
            .iter()
            .copied()
            .find(|m| !self.connections.is_live(*m))
        {
            if let Some(closed) = state
                .rooms
                .close_for_connection(gone, CloseReason::Disconnected)
            {
                self.settle_closed_room(&mut state, closed);
            }
            return false;
        }

        state.rooms.mark_announced(pending.room_id);
        for (i, member) in pending.members.iter().enumerate() {
            self.send(
                *member,
                ServerMessage::Matched {
                    room_id: pending.room_id,
                    partner_interests: pending.shared_interests.clone(),
                    chat_type: pending.chat_type,
                    partner: identities[1 - i].clone(),
                },
            );
        }
        true
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    pub fn leave_room(&self, connection_id: Uuid, room_id: Uuid) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        let closed = state.rooms.leave(room_id, connection_id)?;
        self.settle_closed_room(&mut state, closed);
        Ok(())
    }

    pub fn acknowledge_room(&self, connection_id: Uuid, room_id: Uuid) -> Result<AckOutcome, CoreError> {
        let mut state = self.state.lock();
        let outcome = state.rooms.acknowledge(room_id, connection_id)?;
        if let AckOutcome::Activated(members) = outcome {
            for member in members {
                self.send(member, ServerMessage::RoomActive { room_id });
            }
        }
        Ok(outcome)
    }

    /// Forward an opaque payload to the caller's partner
    pub fn relay(&self, connection_id: Uuid, room_id: Uuid, payload: Value) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        let partner = state.rooms.relay_target(room_id, connection_id)?;
        self.send(partner, ServerMessage::PartnerMessage { room_id, payload });
        RoomMetrics::record_relayed();
        Ok(())
    }

    /// Close rooms idle past the configured timeout
    pub fn close_idle_rooms(&self) -> usize {
        let Some(idle) = self.options.rooms.idle_timeout_secs else {
            return 0;
        };
        let mut state = self.state.lock();
        let closed = state.rooms.close_idle(Duration::from_secs(idle), Utc::now());
        let count = closed.len();
        for room in closed {
            self.settle_closed_room(&mut state, room);
        }
        count
    }

    pub fn close_all_rooms(&self) -> usize {
        let mut state = self.state.lock();
        let closed = state.rooms.close_all(CloseReason::ServerShutdown);
        let count = closed.len();
        for room in closed {
            self.settle_closed_room(&mut state, room);
        }
        RoomMetrics::set_open(0);
        count
    }

    /// Apply the side effects of a room leaving the manager
    fn settle_closed_room(&self, state: &mut MatchState, closed: ClosedRoom) {
        RoomMetrics::record_closed(closed.reason.as_str());
        let room_id = closed.room.id;

        match closed.remaining {
            Some(survivor) if !closed.room.announced => self.rollback(state, &closed, survivor),
            Some(partner) => {
                self.send(partner, ServerMessage::PartnerLeft { room_id });
            }
            None => {
                for member in closed.room.members {
                    self.send(
                        member,
                        ServerMessage::RoomClosed {
                            room_id,
                            reason: closed.reason.as_str().to_string(),
                        },
                    );
                }
            }
        }
    }

    /// Undo an unannounced match: the surviving member goes back to the
    /// head of its queue
    fn rollback(&self, state: &mut MatchState, closed: &ClosedRoom, survivor: Uuid) {
        MatchMetrics::record_rollback();
        if !self.connections.is_live(survivor) {
            return;
        }
        if let Some(ticket) = closed.room.ticket_of(survivor) {
            tracing::info!(
                room_id = %closed.room.id,
                connection_id = %survivor,
                "Match rolled back, re-queueing at front"
            );
            state.queue.requeue_front(ticket.clone());
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Record a heartbeat answer. `timestamp` is the echoed server heartbeat
    /// time in milliseconds. Only the latency sample is kept; activity time
    /// is refreshed by the socket reader for every inbound frame.
    pub fn record_heartbeat(&self, connection_id: Uuid, timestamp: Option<i64>) {
        let Some(sent) = timestamp else {
            return;
        };
        let latency = Utc::now().timestamp_millis() - sent;
        if latency < 0 {
            tracing::debug!(connection_id = %connection_id, latency, "Heartbeat echo from the future, ignored");
            return;
        }
        self.latency_sum_ms.fetch_add(latency as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        HeartbeatMetrics::record_latency(latency as f64);
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        (samples > 0).then(|| self.latency_sum_ms.load(Ordering::Relaxed) as f64 / samples as f64)
    }

    /// Queue a heartbeat to every live connection
    pub fn broadcast_heartbeat(&self) -> usize {
        let mut sent = 0;
        for handle in self.connections.all() {
            if !handle.is_closing() {
                self.send(handle.id, ServerMessage::heartbeat());
                sent += 1;
            }
        }
        sent
    }

    /// Close connections silent for longer than `timeout_secs`
    pub fn reap_idle_connections(&self, timeout_secs: u64) -> usize {
        let idle = self.connections.idle_connections(timeout_secs);
        for handle in &idle {
            tracing::info!(
                connection_id = %handle.id,
                idle_secs = handle.idle_secs(Utc::now()),
                "Closing unresponsive connection"
            );
            let reason = DisconnectReason::PingTimeout;
            handle.close(reason.close_code(), reason.as_str());
            self.handle_disconnect(handle.id, reason);
        }
        if !idle.is_empty() {
            HeartbeatMetrics::record_timeouts(idle.len());
        }
        idle.len()
    }

    /// Drop tab mappings of dead connections and force-close inconsistent rooms
    pub fn sweep_stale_mappings(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.tabs.sweep(|id| self.connections.is_live(id));
        for closed in state.rooms.close_inconsistent() {
            self.settle_closed_room(&mut state, closed);
        }
        if removed > 0 {
            tracing::info!(removed, "Swept stale tab mappings");
        }
        removed
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Refuse new connections from now on
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
        self.connections.stop_accepting();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn notify_shutdown(&self, reason: &str, reconnect_after: Option<u64>) -> usize {
        let handles = self.connections.all();
        for handle in &handles {
            self.send(handle.id, ServerMessage::shutdown(reason, reconnect_after));
        }
        handles.len()
    }

    /// Close every remaining connection with `reason`
    pub fn close_all_connections(&self, reason: DisconnectReason) -> usize {
        let handles = self.connections.all();
        for handle in &handles {
            self.close_connection(handle.id, reason);
        }
        handles.len()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> CoreSnapshot {
        let state = self.state.lock();
        Self::snapshot_of(&state)
    }

    /// Like [`snapshot`](Self::snapshot) but gives up after `timeout`
    pub fn try_snapshot(&self, timeout: Duration) -> Option<CoreSnapshot> {
        let state = self.state.try_lock_for(timeout)?;
        Some(Self::snapshot_of(&state))
    }

    fn snapshot_of(state: &MatchState) -> CoreSnapshot {
        let now = Utc::now();
        let depths = state.queue.depths();
        MatchMetrics::set_queue_depths(depths);
        RoomMetrics::set_open(state.rooms.len());
        CoreSnapshot {
            queue_depths: depths,
            oldest_wait_secs: PerModality {
                text: state.queue.oldest_wait_secs(ChatType::Text, now),
                video: state.queue.oldest_wait_secs(ChatType::Video, now),
            },
            rooms: state.rooms.stats(),
            identified_tabs: state.tabs.tab_count(),
        }
    }

    pub fn queue_details(&self) -> PerModality<Vec<TicketInfo>> {
        let state = self.state.lock();
        let now = Utc::now();
        PerModality {
            text: state.queue.details(ChatType::Text, now),
            video: state.queue.details(ChatType::Video, now),
        }
    }

    pub fn connection_for_tab(&self, tab_id: &str) -> Option<Uuid> {
        self.state.lock().tabs.connection_for_tab(tab_id)
    }

    pub fn room_of(&self, connection_id: Uuid) -> Option<Uuid> {
        self.state.lock().rooms.room_of(connection_id)
    }

    pub fn is_identified(&self, connection_id: Uuid) -> bool {
        self.state.lock().tabs.session(connection_id).is_some()
    }

    pub fn is_waiting(&self, connection_id: Uuid) -> bool {
        self.state.lock().queue.contains(connection_id)
    }

    /// Queue one event for a connection through the batcher
    pub fn send(&self, target: Uuid, message: ServerMessage) {
        if let Err(e) = self.batcher.enqueue(target, message) {
            tracing::debug!(target_id = %target, error = %e, "Outbound event not queued");
        }
    }
}

impl std::fmt::Debug for ChatCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCore")
            .field("connections", &self.connections.len())
            .field("draining", &self.is_draining())
            .finish()
    }
}
