//! Per-modality waiting queues and the pairing algorithm.
//!
//! Each modality keeps its tickets in an ordered map keyed by a sequence
//! number. Appends take increasing numbers and priority re-insertions take
//! decreasing negative ones, so FIFO order is just key order. A
//! connection-id index makes cancellation a direct removal that never
//! renumbers the remaining tickets.
//!
//! Cost: cancellation is an O(1) index lookup plus an O(log n) map removal.
//! A fresh ticket's position is known in O(1) since it is always last;
//! [`MatchQueue::position`] for an arbitrary ticket counts its predecessors
//! and is O(n), which only diagnostics use.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{ChatType, PerModality};

use super::interests::{shared_interests, Interests};

/// A connection waiting for a partner
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingTicket {
    pub connection_id: Uuid,
    pub chat_type: ChatType,
    pub interests: Interests,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_id: Option<String>,
    pub remote_addr: IpAddr,
    pub enqueued_at: DateTime<Utc>,
}

impl WaitingTicket {
    pub fn new(connection_id: Uuid, chat_type: ChatType, interests: Interests, remote_addr: IpAddr) -> Self {
        Self {
            connection_id,
            chat_type,
            interests,
            auth_id: None,
            remote_addr,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_auth_id(mut self, auth_id: Option<String>) -> Self {
        self.auth_id = auth_id;
        self
    }

    pub fn wait_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.enqueued_at).num_seconds().max(0)
    }
}

/// Two tickets removed from the queue together
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPair {
    pub chat_type: ChatType,
    /// The ticket that was already waiting
    pub waiting: WaitingTicket,
    /// The ticket whose arrival (or scan turn) produced the match
    pub arriving: WaitingTicket,
    pub shared_interests: Vec<String>,
}

impl MatchPair {
    fn new(waiting: WaitingTicket, arriving: WaitingTicket) -> Self {
        let shared_interests = shared_interests(&waiting.interests, &arriving.interests);
        Self {
            chat_type: arriving.chat_type,
            waiting,
            arriving,
            shared_interests,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued { position: usize },
    Matched(MatchPair),
}

/// Diagnostic view of a waiting ticket
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketInfo {
    pub connection_id: Uuid,
    pub interests: Vec<String>,
    pub has_auth: bool,
    pub wait_secs: i64,
    pub position: usize,
}

#[derive(Debug, Default)]
struct ModalityQueue {
    order: BTreeMap<i64, WaitingTicket>,
    next_back: i64,
    next_front: i64,
}

impl ModalityQueue {
    fn push_back(&mut self, ticket: WaitingTicket) -> i64 {
        let seq = self.next_back;
        self.next_back += 1;
        self.order.insert(seq, ticket);
        seq
    }

    fn push_front(&mut self, ticket: WaitingTicket) -> i64 {
        self.next_front -= 1;
        let seq = self.next_front;
        self.order.insert(seq, ticket);
        seq
    }

    fn position(&self, seq: i64) -> usize {
        self.order.range(..seq).count()
    }
}

#[derive(Debug)]
pub struct MatchQueue {
    queues: PerModality<ModalityQueue>,
    /// connection -> (modality, sequence number)
    index: HashMap<Uuid, (ChatType, i64)>,
    allow_same_ip: bool,
}

impl MatchQueue {
    pub fn new(allow_same_ip: bool) -> Self {
        Self {
            queues: PerModality::default(),
            index: HashMap::new(),
            allow_same_ip,
        }
    }

    /// Add a ticket and try to pair it immediately. A connection that is
    /// already waiting has its old ticket replaced.
    pub fn enqueue(&mut self, ticket: WaitingTicket) -> EnqueueOutcome {
        self.cancel(ticket.connection_id);

        if let Some(partner_seq) = self.select_partner(&ticket) {
            if let Some(partner) = self.remove_seq(ticket.chat_type, partner_seq) {
                return EnqueueOutcome::Matched(MatchPair::new(partner, ticket));
            }
        }

        let chat_type = ticket.chat_type;
        let connection_id = ticket.connection_id;
        let queue = self.queues.get_mut(chat_type);
        let seq = queue.push_back(ticket);
        let position = queue.order.len() - 1;
        self.index.insert(connection_id, (chat_type, seq));

        EnqueueOutcome::Queued { position }
    }

    /// Put a ticket back at the head of its queue without attempting a match
    pub fn requeue_front(&mut self, ticket: WaitingTicket) {
        self.cancel(ticket.connection_id);
        let chat_type = ticket.chat_type;
        let connection_id = ticket.connection_id;
        let seq = self.queues.get_mut(chat_type).push_front(ticket);
        self.index.insert(connection_id, (chat_type, seq));
    }

    /// Remove a connection's ticket. Unknown connections are a no-op.
    pub fn cancel(&mut self, connection_id: Uuid) -> Option<WaitingTicket> {
        let (chat_type, seq) = self.index.remove(&connection_id)?;
        self.queues.get_mut(chat_type).order.remove(&seq)
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.index.contains_key(&connection_id)
    }

    pub fn position(&self, connection_id: Uuid) -> Option<usize> {
        let (chat_type, seq) = self.index.get(&connection_id)?;
        Some(self.queues.get(*chat_type).position(*seq))
    }

    /// Re-run pairing over a whole queue in FIFO order
    pub fn run_matching(&mut self, chat_type: ChatType) -> Vec<MatchPair> {
        let seqs: Vec<i64> = self.queues.get(chat_type).order.keys().copied().collect();
        let mut pairs = Vec::new();

        for seq in seqs {
            let Some(ticket) = self.remove_seq(chat_type, seq) else {
                // Already paired earlier in this pass
                continue;
            };

            match self.select_partner(&ticket) {
                Some(partner_seq) => {
                    if let Some(partner) = self.remove_seq(chat_type, partner_seq) {
                        // Whichever of the two was queued first counts as waiting
                        if partner_seq < seq {
                            pairs.push(MatchPair::new(partner, ticket));
                        } else {
                            pairs.push(MatchPair::new(ticket, partner));
                        }
                    }
                }
                None => {
                    self.index.insert(ticket.connection_id, (chat_type, seq));
                    self.queues.get_mut(chat_type).order.insert(seq, ticket);
                }
            }
        }

        pairs
    }

    /// Pair the two longest-waiting tickets, ignoring interests and conflict rules
    pub fn force_match(&mut self, chat_type: ChatType) -> Option<MatchPair> {
        if self.depth(chat_type) < 2 {
            return None;
        }
        let mut oldest = self.queues.get(chat_type).order.keys().copied().take(2);
        let (first, second) = (oldest.next()?, oldest.next()?);

        let waiting = self.remove_seq(chat_type, first)?;
        let arriving = self.remove_seq(chat_type, second)?;
        Some(MatchPair::new(waiting, arriving))
    }

    /// Remove tickets that have waited longer than `max_wait`
    pub fn expire(&mut self, max_wait: Duration, now: DateTime<Utc>) -> Vec<WaitingTicket> {
        let max_wait = max_wait.as_secs() as i64;
        let expired: Vec<Uuid> = ChatType::ALL
            .iter()
            .flat_map(|ct| self.queues.get(*ct).order.values())
            .filter(|t| t.wait_secs(now) >= max_wait)
            .map(|t| t.connection_id)
            .collect();

        expired
            .into_iter()
            .filter_map(|conn| self.cancel(conn))
            .collect()
    }

    pub fn depth(&self, chat_type: ChatType) -> usize {
        self.queues.get(chat_type).order.len()
    }

    pub fn depths(&self) -> PerModality<usize> {
        PerModality {
            text: self.depth(ChatType::Text),
            video: self.depth(ChatType::Video),
        }
    }

    /// Seconds the head of the queue has been waiting
    pub fn oldest_wait_secs(&self, chat_type: ChatType, now: DateTime<Utc>) -> i64 {
        self.queues
            .get(chat_type)
            .order
            .values()
            .map(|t| t.wait_secs(now))
            .max()
            .unwrap_or(0)
    }

    pub fn details(&self, chat_type: ChatType, now: DateTime<Utc>) -> Vec<TicketInfo> {
        self.queues
            .get(chat_type)
            .order
            .values()
            .enumerate()
            .map(|(position, t)| TicketInfo {
                connection_id: t.connection_id,
                interests: t.interests.iter().cloned().collect(),
                has_auth: t.auth_id.is_some(),
                wait_secs: t.wait_secs(now),
                position,
            })
            .collect()
    }

    fn remove_seq(&mut self, chat_type: ChatType, seq: i64) -> Option<WaitingTicket> {
        let ticket = self.queues.get_mut(chat_type).order.remove(&seq)?;
        self.index.remove(&ticket.connection_id);
        Some(ticket)
    }

    fn conflicts(&self, a: &WaitingTicket, b: &WaitingTicket) -> bool {
        if a.connection_id == b.connection_id {
            return true;
        }
        if let (Some(x), Some(y)) = (&a.auth_id, &b.auth_id) {
            if x == y {
                return true;
            }
        }
        !self.allow_same_ip && a.remote_addr == b.remote_addr
    }

    /// Sequence number of the best partner for `ticket`, if any.
    ///
    /// Empty interests take the first compatible ticket. Otherwise the first
    /// ticket with an overlapping interest wins, then the longest-waiting
    /// ticket with no interests.
    fn select_partner(&self, ticket: &WaitingTicket) -> Option<i64> {
        let mut candidates = self
            .queues
            .get(ticket.chat_type)
            .order
            .iter()
            .filter(|(_, other)| !self.conflicts(ticket, other));

        if ticket.interests.is_empty() {
            return candidates.next().map(|(seq, _)| *seq);
        }

        let mut fallback = None;
        for (seq, other) in candidates {
            if !other.interests.is_disjoint(&ticket.interests) {
                return Some(*seq);
            }
            if fallback.is_none() && other.interests.is_empty() {
                fallback = Some(*seq);
            }
        }
        fallback
    }
}

impl Default for MatchQueue {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaking::normalize_interests;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 1, 0, last))
    }

    fn ticket(chat_type: ChatType, interests: &[&str]) -> WaitingTicket {
        WaitingTicket::new(
            Uuid::new_v4(),
            chat_type,
            normalize_interests(interests, 10, 32),
            ip(1),
        )
    }

    fn matched(outcome: EnqueueOutcome) -> MatchPair {
        match outcome {
            EnqueueOutcome::Matched(pair) => pair,
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_interest_match() {
        let mut queue = MatchQueue::default();
        let x = ticket(ChatType::Text, &["music"]);
        let y = ticket(ChatType::Text, &["music", "games"]);

        assert_eq!(queue.enqueue(x.clone()), EnqueueOutcome::Queued { position: 0 });
        let pair = matched(queue.enqueue(y.clone()));

        assert_eq!(pair.waiting.connection_id, x.connection_id);
        assert_eq!(pair.arriving.connection_id, y.connection_id);
        assert_eq!(pair.shared_interests, vec!["music"]);
        assert_eq!(queue.depth(ChatType::Text), 0);
        assert!(!queue.contains(x.connection_id));
    }

    #[test]
    fn test_modalities_never_mix() {
        let mut queue = MatchQueue::default();
        queue.enqueue(ticket(ChatType::Text, &[]));
        let outcome = queue.enqueue(ticket(ChatType::Video, &[]));

        assert_eq!(outcome, EnqueueOutcome::Queued { position: 0 });
        assert_eq!(queue.depths(), PerModality { text: 1, video: 1 });
    }

    #[test]
    fn test_empty_interest_takes_fifo_head() {
        let mut queue = MatchQueue::default();
        let first = ticket(ChatType::Text, &["chess"]);
        queue.enqueue(first.clone());
        queue.enqueue(ticket(ChatType::Text, &["cooking"]));

        let pair = matched(queue.enqueue(ticket(ChatType::Text, &[])));
        assert_eq!(pair.waiting.connection_id, first.connection_id);
        assert!(pair.shared_interests.is_empty());
    }

    #[test]
    fn test_earliest_intersecting_ticket_wins() {
        let mut queue = MatchQueue::default();
        let early = ticket(ChatType::Text, &["games", "film"]);
        // queue order: art, early, games
        queue.requeue_front(ticket(ChatType::Text, &["games"]));
        queue.requeue_front(early.clone());
        queue.requeue_front(ticket(ChatType::Text, &["art"]));

        let pair = matched(queue.enqueue(ticket(ChatType::Text, &["games"])));
        assert_eq!(pair.waiting.connection_id, early.connection_id);
        assert_eq!(pair.shared_interests, vec!["games"]);
    }

    #[test]
    fn test_intersection_preferred_over_older_empty_ticket() {
        let mut queue = MatchQueue::default();
        let empty = ticket(ChatType::Text, &[]);
        let music = ticket(ChatType::Text, &["music"]);
        // queue order: empty, music
        queue.requeue_front(music.clone());
        queue.requeue_front(empty.clone());

        let pair = matched(queue.enqueue(ticket(ChatType::Text, &["music"])));
        assert_eq!(pair.waiting.connection_id, music.connection_id);
        assert!(queue.contains(empty.connection_id));
    }

    #[test]
    fn test_falls_back_to_longest_waiting_empty_ticket() {
        let mut queue = MatchQueue::default();
        let empty = ticket(ChatType::Text, &[]);
        // queue order: art, empty
        queue.requeue_front(empty.clone());
        queue.requeue_front(ticket(ChatType::Text, &["art"]));

        let pair = matched(queue.enqueue(ticket(ChatType::Text, &["music"])));
        assert_eq!(pair.waiting.connection_id, empty.connection_id);
        assert!(pair.shared_interests.is_empty());
    }

    #[test]
    fn test_disjoint_interests_stay_queued() {
        let mut queue = MatchQueue::default();
        queue.enqueue(ticket(ChatType::Text, &["art"]));
        let outcome = queue.enqueue(ticket(ChatType::Text, &["music"]));

        assert_eq!(outcome, EnqueueOutcome::Queued { position: 1 });
        assert_eq!(queue.depth(ChatType::Text), 2);
    }

    #[test]
    fn test_same_auth_never_matches() {
        let mut queue = MatchQueue::default();
        let a = ticket(ChatType::Text, &[]).with_auth_id(Some("u1".into()));
        let b = ticket(ChatType::Text, &[]).with_auth_id(Some("u1".into()));
        queue.enqueue(a);

        assert!(matches!(queue.enqueue(b), EnqueueOutcome::Queued { .. }));
    }

    #[test]
    fn test_same_ip_rule() {
        let mut strict = MatchQueue::new(false);
        strict.enqueue(ticket(ChatType::Text, &[]));
        assert!(matches!(strict.enqueue(ticket(ChatType::Text, &[])), EnqueueOutcome::Queued { .. }));

        let mut other_ip = ticket(ChatType::Text, &[]);
        other_ip.remote_addr = ip(2);
        assert!(matches!(strict.enqueue(other_ip), EnqueueOutcome::Matched(_)));
    }

    #[test]
    fn test_cancel_removes_ticket_for_good() {
        let mut queue = MatchQueue::default();
        let a = ticket(ChatType::Text, &["music"]);
        queue.enqueue(a.clone());

        assert_eq!(queue.cancel(a.connection_id).map(|t| t.connection_id), Some(a.connection_id));
        assert!(queue.cancel(a.connection_id).is_none());
        assert!(queue.cancel(Uuid::new_v4()).is_none());

        let outcome = queue.enqueue(ticket(ChatType::Text, &["music"]));
        assert!(matches!(outcome, EnqueueOutcome::Queued { position: 0 }));
    }

    #[test]
    fn test_cancel_keeps_others_in_order() {
        let mut queue = MatchQueue::default();
        let a = ticket(ChatType::Text, &["a"]);
        let b = ticket(ChatType::Text, &["b"]);
        let c = ticket(ChatType::Text, &["c"]);
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());
        queue.enqueue(c.clone());

        queue.cancel(b.connection_id);
        assert_eq!(queue.position(a.connection_id), Some(0));
        assert_eq!(queue.position(c.connection_id), Some(1));
    }

    #[test]
    fn test_reenqueue_replaces_ticket() {
        let mut queue = MatchQueue::default();
        let mut a = ticket(ChatType::Text, &["a"]);
        queue.enqueue(a.clone());
        a.interests = normalize_interests(&["b"], 10, 32);
        queue.enqueue(a.clone());

        assert_eq!(queue.depth(ChatType::Text), 1);
        let details = queue.details(ChatType::Text, Utc::now());
        assert_eq!(details[0].interests, vec!["b"]);
    }

    #[test]
    fn test_requeue_front_takes_priority() {
        let mut queue = MatchQueue::default();
        let a = ticket(ChatType::Text, &["x"]);
        let survivor = ticket(ChatType::Text, &["y"]);
        queue.enqueue(a.clone());
        queue.requeue_front(survivor.clone());

        assert_eq!(queue.position(survivor.connection_id), Some(0));
        assert_eq!(queue.position(a.connection_id), Some(1));
    }

    #[test]
    fn test_queued_position_counts_front_requeues() {
        let mut queue = MatchQueue::default();
        queue.requeue_front(ticket(ChatType::Text, &["a"]));
        queue.enqueue(ticket(ChatType::Text, &["b"]));
        queue.requeue_front(ticket(ChatType::Text, &["c"]));

        let late = ticket(ChatType::Text, &["d"]);
        assert_eq!(queue.enqueue(late.clone()), EnqueueOutcome::Queued { position: 3 });
        assert_eq!(queue.position(late.connection_id), Some(3));

        // Cancelling ahead of it shifts it forward without renumbering
        let head = queue.details(ChatType::Text, Utc::now())[0].connection_id;
        queue.cancel(head);
        assert_eq!(queue.position(late.connection_id), Some(2));
    }

    #[test]
    fn test_run_matching_pairs_requeued_tickets() {
        let mut queue = MatchQueue::default();
        let a = ticket(ChatType::Video, &["music"]);
        let b = ticket(ChatType::Video, &["music"]);
        let lonely = ticket(ChatType::Video, &["chess"]);
        queue.requeue_front(b.clone());
        queue.requeue_front(a.clone());
        queue.requeue_front(lonely.clone());

        let pairs = queue.run_matching(ChatType::Video);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].waiting.connection_id, a.connection_id);
        assert_eq!(pairs[0].arriving.connection_id, b.connection_id);
        assert!(queue.contains(lonely.connection_id));
        assert_eq!(queue.depth(ChatType::Video), 1);
    }

    #[test]
    fn test_force_match_ignores_interests_and_auth() {
        let mut queue = MatchQueue::default();
        let a = ticket(ChatType::Text, &["art"]).with_auth_id(Some("same".into()));
        let b = ticket(ChatType::Text, &["music"]).with_auth_id(Some("same".into()));
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());
        queue.enqueue(ticket(ChatType::Text, &["chess"]));

        let pair = queue.force_match(ChatType::Text).unwrap();
        assert_eq!(pair.waiting.connection_id, a.connection_id);
        assert_eq!(pair.arriving.connection_id, b.connection_id);
        assert_eq!(queue.depth(ChatType::Text), 1);
    }

    #[test]
    fn test_force_match_needs_two() {
        let mut queue = MatchQueue::default();
        queue.enqueue(ticket(ChatType::Text, &[]));
        assert!(queue.force_match(ChatType::Text).is_none());
        assert_eq!(queue.depth(ChatType::Text), 1);
    }

    #[test]
    fn test_expire_old_tickets() {
        let mut queue = MatchQueue::default();
        let mut old = ticket(ChatType::Text, &["a"]);
        old.enqueued_at = Utc::now() - chrono::Duration::seconds(120);
        queue.enqueue(old.clone());
        queue.enqueue(ticket(ChatType::Text, &["b"]));

        let expired = queue.expire(Duration::from_secs(60), Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].connection_id, old.connection_id);
        assert_eq!(queue.depth(ChatType::Text), 1);
    }

    #[test]
    fn test_oldest_wait() {
        let mut queue = MatchQueue::default();
        let mut old = ticket(ChatType::Video, &["a"]);
        old.enqueued_at = Utc::now() - chrono::Duration::seconds(30);
        queue.enqueue(old);

        assert!(queue.oldest_wait_secs(ChatType::Video, Utc::now()) >= 30);
        assert_eq!(queue.oldest_wait_secs(ChatType::Text, Utc::now()), 0);
    }
}
