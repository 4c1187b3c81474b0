use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::matchmaking::MatchPair;
use crate::types::{ChatType, PerModality};

use super::types::{AckOutcome, CloseReason, ClosedRoom, Room, RoomError, RoomState, RoomStats};

/// Owns all open rooms and the member -> room index.
///
/// A connection belongs to at most one open room. Closed rooms are removed
/// immediately and handed back to the caller as [`ClosedRoom`].
#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: HashMap<Uuid, Room>,
    members: HashMap<Uuid, Uuid>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room from a matched pair. Fails if either side is already
    /// in an open room.
    pub fn create(&mut self, pair: MatchPair) -> Result<&Room, RoomError> {
        for conn in [pair.waiting.connection_id, pair.arriving.connection_id] {
            if self.members.contains_key(&conn) {
                return Err(RoomError::AlreadyInRoom(conn));
            }
        }

        let room = Room::from_pair(pair);
        let room_id = room.id;
        for member in room.members {
            self.members.insert(member, room_id);
        }

        tracing::debug!(
            room_id = %room_id,
            chat_type = %room.chat_type,
            shared = room.shared_interests.len(),
            "Room created"
        );

        Ok(self.rooms.entry(room_id).or_insert(room))
    }

    pub fn get(&self, room_id: Uuid) -> Option<&Room> {
        self.rooms.get(&room_id)
    }

    pub fn room_of(&self, connection_id: Uuid) -> Option<Uuid> {
        self.members.get(&connection_id).copied()
    }

    pub fn mark_announced(&mut self, room_id: Uuid) {
        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.announced = true;
        }
    }

    /// Explicit leave by a member
    pub fn leave(&mut self, room_id: Uuid, connection_id: Uuid) -> Result<ClosedRoom, RoomError> {
        self.member_room(room_id, connection_id)?;
        self.remove(room_id, CloseReason::Left, Some(connection_id))
            .ok_or(RoomError::NotFound(room_id))
    }

    /// Close whatever room a disconnecting connection was in
    pub fn close_for_connection(&mut self, connection_id: Uuid, reason: CloseReason) -> Option<ClosedRoom> {
        let room_id = self.room_of(connection_id)?;
        if !self.rooms.contains_key(&room_id) {
            tracing::error!(
                connection_id = %connection_id,
                room_id = %room_id,
                "Member index points at a missing room"
            );
            self.members.remove(&connection_id);
            return None;
        }
        self.remove(room_id, reason, Some(connection_id))
    }

    pub fn acknowledge(&mut self, room_id: Uuid, connection_id: Uuid) -> Result<AckOutcome, RoomError> {
        self.member_room(room_id, connection_id)?;
        let room = self.rooms.get_mut(&room_id).ok_or(RoomError::NotFound(room_id))?;

        if room.state == RoomState::Active {
            return Ok(AckOutcome::AlreadyActive);
        }
        room.last_activity = Utc::now();
        if room.acknowledge(connection_id) {
            tracing::debug!(room_id = %room_id, "Room active");
            return Ok(AckOutcome::Activated(room.members));
        }
        Ok(AckOutcome::Pending)
    }

    /// Resolve the partner a relayed message should go to and refresh the
    /// room's activity time.
    pub fn relay_target(&mut self, room_id: Uuid, connection_id: Uuid) -> Result<Uuid, RoomError> {
        self.member_room(room_id, connection_id)?;
        let room = self.rooms.get_mut(&room_id).ok_or(RoomError::NotFound(room_id))?;
        room.last_activity = Utc::now();
        room.partner_of(connection_id)
            .ok_or(RoomError::NotAMember { room_id, connection_id })
    }

    /// Close rooms without activity for longer than `timeout`
    pub fn close_idle(&mut self, timeout: Duration, now: DateTime<Utc>) -> Vec<ClosedRoom> {
        let timeout = timeout.as_secs() as i64;
        let idle: Vec<Uuid> = self
            .rooms
            .values()
            .filter(|r| r.idle_secs(now) >= timeout)
            .map(|r| r.id)
            .collect();

        idle.into_iter()
            .filter_map(|id| self.remove(id, CloseReason::IdleTimeout, None))
            .collect()
    }

    /// Force-close rooms whose members disagree with the member index
    pub fn close_inconsistent(&mut self) -> Vec<ClosedRoom> {
        let broken: Vec<Uuid> = self
            .rooms
            .values()
            .filter(|r| r.members.iter().any(|m| self.members.get(m) != Some(&r.id)))
            .map(|r| r.id)
            .collect();

        broken
            .into_iter()
            .filter_map(|id| {
                tracing::error!(room_id = %id, "Room membership out of sync, closing");
                self.remove(id, CloseReason::Invariant, None)
            })
            .collect()
    }

    pub fn close_all(&mut self, reason: CloseReason) -> Vec<ClosedRoom> {
        let ids: Vec<Uuid> = self.rooms.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id, reason, None))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn stats(&self) -> RoomStats {
        let mut by_modality = PerModality::<usize>::default();
        let mut active_rooms = 0;
        for room in self.rooms.values() {
            *by_modality.get_mut(room.chat_type) += 1;
            if room.state == RoomState::Active {
                active_rooms += 1;
            }
        }
        RoomStats {
            total_rooms: self.rooms.len(),
            active_rooms,
            by_modality,
        }
    }

    pub fn count(&self, chat_type: ChatType) -> usize {
        self.rooms.values().filter(|r| r.chat_type == chat_type).count()
    }

    fn member_room(&mut self, room_id: Uuid, connection_id: Uuid) -> Result<(), RoomError> {
        let room = self.rooms.get(&room_id).ok_or(RoomError::NotFound(room_id))?;
        if !room.is_member(connection_id) {
            return Err(RoomError::NotAMember { room_id, connection_id });
        }
        if self.members.get(&connection_id) != Some(&room_id) {
            tracing::error!(
                room_id = %room_id,
                connection_id = %connection_id,
                "Room membership out of sync, closing"
            );
            self.remove(room_id, CloseReason::Invariant, None);
            return Err(RoomError::NotFound(room_id));
        }
        Ok(())
    }

    fn remove(&mut self, room_id: Uuid, reason: CloseReason, by: Option<Uuid>) -> Option<ClosedRoom> {
        let mut room = self.rooms.remove(&room_id)?;
        for member in room.members {
            if self.members.get(&member) == Some(&room_id) {
                self.members.remove(&member);
            }
        }
        room.state = RoomState::Closed;
        let remaining = by.and_then(|conn| room.partner_of(conn));

        tracing::debug!(
            room_id = %room_id,
            reason = reason.as_str(),
            lifetime_secs = (Utc::now() - room.created_at).num_seconds(),
            "Room closed"
        );

        Some(ClosedRoom { room, reason, remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaking::{normalize_interests, WaitingTicket};
    use std::net::{IpAddr, Ipv4Addr};

    fn pair(chat_type: ChatType) -> MatchPair {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        MatchPair {
            chat_type,
            waiting: WaitingTicket::new(Uuid::new_v4(), chat_type, normalize_interests(&["music"], 10, 32), ip),
            arriving: WaitingTicket::new(Uuid::new_v4(), chat_type, normalize_interests(&["music"], 10, 32), ip),
            shared_interests: vec!["music".into()],
        }
    }

    #[test]
    fn test_create_indexes_both_members() {
        let mut rooms = RoomManager::new();
        let p = pair(ChatType::Text);
        let (a, b) = (p.waiting.connection_id, p.arriving.connection_id);
        let room_id = rooms.create(p).unwrap().id;

        assert_eq!(rooms.room_of(a), Some(room_id));
        assert_eq!(rooms.room_of(b), Some(room_id));
        let room = rooms.get(room_id).unwrap();
        assert_eq!(room.state, RoomState::Created);
        assert_eq!(room.partner_of(a), Some(b));
        assert_eq!(room.shared_interests, vec!["music"]);
    }

    #[test]
    fn test_member_cannot_join_two_rooms() {
        let mut rooms = RoomManager::new();
        let p = pair(ChatType::Text);
        let a = p.waiting.connection_id;
        rooms.create(p).unwrap();

        let mut second = pair(ChatType::Text);
        second.arriving.connection_id = a;
        assert_eq!(rooms.create(second).unwrap_err(), RoomError::AlreadyInRoom(a));
        assert_eq!(rooms.len(), 1);
    }

    #[test]
    fn test_leave_closes_and_reports_partner() {
        let mut rooms = RoomManager::new();
        let p = pair(ChatType::Video);
        let (a, b) = (p.waiting.connection_id, p.arriving.connection_id);
        let room_id = rooms.create(p).unwrap().id;

        let closed = rooms.leave(room_id, a).unwrap();
        assert_eq!(closed.remaining, Some(b));
        assert_eq!(closed.room.state, RoomState::Closed);
        assert_eq!(closed.reason, CloseReason::Left);
        assert!(rooms.is_empty());
        assert_eq!(rooms.room_of(b), None);

        // Second leave finds nothing
        assert_eq!(rooms.leave(room_id, b).unwrap_err(), RoomError::NotFound(room_id));
    }

    #[test]
    fn test_leave_by_stranger_is_refused() {
        let mut rooms = RoomManager::new();
        let room_id = rooms.create(pair(ChatType::Text)).unwrap().id;
        let stranger = Uuid::new_v4();

        assert!(matches!(rooms.leave(room_id, stranger), Err(RoomError::NotAMember { .. })));
        assert_eq!(rooms.len(), 1);
    }

    #[test]
    fn test_acknowledge_activates_after_both() {
        let mut rooms = RoomManager::new();
        let p = pair(ChatType::Text);
        let (a, b) = (p.waiting.connection_id, p.arriving.connection_id);
        let room_id = rooms.create(p).unwrap().id;

        assert_eq!(rooms.acknowledge(room_id, a).unwrap(), AckOutcome::Pending);
        assert_eq!(rooms.acknowledge(room_id, a).unwrap(), AckOutcome::Pending);
        assert_eq!(rooms.acknowledge(room_id, b).unwrap(), AckOutcome::Activated([a, b]));
        assert_eq!(rooms.acknowledge(room_id, b).unwrap(), AckOutcome::AlreadyActive);
        assert_eq!(rooms.stats().active_rooms, 1);
    }

    #[test]
    fn test_relay_target_is_partner() {
        let mut rooms = RoomManager::new();
        let p = pair(ChatType::Text);
        let (a, b) = (p.waiting.connection_id, p.arriving.connection_id);
        let room_id = rooms.create(p).unwrap().id;

        assert_eq!(rooms.relay_target(room_id, a).unwrap(), b);
        assert_eq!(rooms.relay_target(room_id, b).unwrap(), a);
        assert!(rooms.relay_target(Uuid::new_v4(), a).is_err());
    }

    #[test]
    fn test_close_for_connection() {
        let mut rooms = RoomManager::new();
        let p = pair(ChatType::Text);
        let (a, b) = (p.waiting.connection_id, p.arriving.connection_id);
        rooms.create(p).unwrap();

        let closed = rooms.close_for_connection(b, CloseReason::Disconnected).unwrap();
        assert_eq!(closed.remaining, Some(a));
        assert!(rooms.close_for_connection(b, CloseReason::Disconnected).is_none());
    }

    #[test]
    fn test_close_idle() {
        let mut rooms = RoomManager::new();
        let room_id = rooms.create(pair(ChatType::Text)).unwrap().id;
        rooms.create(pair(ChatType::Text)).unwrap();
        rooms.rooms.get_mut(&room_id).unwrap().last_activity = Utc::now() - chrono::Duration::seconds(600);

        let closed = rooms.close_idle(Duration::from_secs(300), Utc::now());
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].room.id, room_id);
        assert_eq!(closed[0].reason, CloseReason::IdleTimeout);
        assert!(closed[0].remaining.is_none());
        assert_eq!(rooms.len(), 1);
    }

    #[test]
    fn test_inconsistent_room_is_force_closed() {
        let mut rooms = RoomManager::new();
        let p = pair(ChatType::Text);
        let a = p.waiting.connection_id;
        let room_id = rooms.create(p).unwrap().id;
        rooms.members.remove(&a);

        let closed = rooms.close_inconsistent();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].room.id, room_id);
        assert!(rooms.is_empty());
        assert!(rooms.members.is_empty());
    }

    #[test]
    fn test_stats_by_modality() {
        let mut rooms = RoomManager::new();
        rooms.create(pair(ChatType::Text)).unwrap();
        rooms.create(pair(ChatType::Video)).unwrap();
        rooms.create(pair(ChatType::Video)).unwrap();

        let stats = rooms.stats();
        assert_eq!(stats.total_rooms, 3);
        assert_eq!(stats.by_modality, PerModality { text: 1, video: 2 });
        assert_eq!(rooms.count(ChatType::Video), 2);

        assert_eq!(rooms.close_all(CloseReason::ServerShutdown).len(), 3);
        assert!(rooms.is_empty());
    }
}
