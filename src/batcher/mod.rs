//! Per-target outbound message batching
//!
//! Events for one connection are collected for a short window and handed to
//! the connection's writer as one ordered batch.

mod sink;

pub use sink::{BatchSink, DeliveryError, Undelivered};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::BatcherConfig;
use crate::metrics::BatcherMetrics;
use crate::websocket::ServerMessage;

#[derive(Debug)]
struct PendingMessage {
    message: ServerMessage,
    critical: bool,
}

/// Batcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherStats {
    pub enqueued: u64,
    pub batches_flushed: u64,
    pub messages_delivered: u64,
    /// Flushes put back because the writer was behind
    pub deferred: u64,
    pub dropped_backpressure: u64,
    pub dropped_delivery: u64,
    pub pending_targets: usize,
    pub pending_messages: usize,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    batches_flushed: AtomicU64,
    messages_delivered: AtomicU64,
    deferred: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_delivery: AtomicU64,
}

pub struct MessageBatcher {
    pending: DashMap<Uuid, VecDeque<PendingMessage>>,
    timers: DashMap<Uuid, JoinHandle<()>>,
    sink: Arc<dyn BatchSink>,
    flush_delay: Duration,
    max_pending: usize,
    accepting: AtomicBool,
    counters: Counters,
}

impl MessageBatcher {
    pub fn new(sink: Arc<dyn BatchSink>, config: &BatcherConfig) -> Self {
        Self {
            pending: DashMap::new(),
            timers: DashMap::new(),
            sink,
            flush_delay: Duration::from_millis(config.flush_delay_ms),
            max_pending: config.max_pending_per_target.max(1),
            accepting: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    /// Queue a message for `target` and schedule a flush if none is pending.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(self: &Arc<Self>, target: Uuid, message: ServerMessage) -> Result<(), DeliveryError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(DeliveryError::ShuttingDown);
        }

        let critical = message.is_critical();
        {
            let mut list = self.pending.entry(target).or_default();
            list.push_back(PendingMessage { message, critical });
            self.enforce_ceiling(target, &mut list);
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        self.schedule(target);
        Ok(())
    }

    /// Drop the oldest non-critical messages until `list` fits the ceiling
    fn enforce_ceiling(&self, target: Uuid, list: &mut VecDeque<PendingMessage>) {
        while list.len() > self.max_pending {
            let Some(idx) = list.iter().position(|m| !m.critical) else {
                tracing::warn!(
                    target_id = %target,
                    pending = list.len(),
                    "Pending list over ceiling with only critical messages"
                );
                return;
            };
            if let Some(dropped) = list.remove(idx) {
                self.counters.dropped_backpressure.fetch_add(1, Ordering::Relaxed);
                BatcherMetrics::record_backpressure_drop();
                tracing::warn!(
                    target_id = %target,
                    kind = dropped.message.kind(),
                    pending = list.len(),
                    "Pending list full, dropped oldest non-critical message"
                );
            }
        }
    }

    fn schedule(self: &Arc<Self>, target: Uuid) {
        if let dashmap::mapref::entry::Entry::Vacant(slot) = self.timers.entry(target) {
            let batcher = Arc::clone(self);
            let delay = self.flush_delay;
            slot.insert(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Deregister before draining so a concurrent enqueue schedules a fresh timer
                batcher.timers.remove(&target);
                batcher.flush(target);
            }));
        }
    }

    /// Drain `target`'s pending list and hand it over as one batch.
    /// Returns the number of messages delivered.
    ///
    /// A batch refused because the writer is behind goes back to the front of
    /// the pending list and another flush is scheduled. Only a batch for a
    /// target that is gone is dropped.
    pub fn flush(self: &Arc<Self>, target: Uuid) -> usize {
        let Some(mut list) = self.pending.get_mut(&target) else {
            return 0;
        };
        if list.is_empty() {
            drop(list);
            self.pending.remove_if(&target, |_, l| l.is_empty());
            return 0;
        }

        let batch: Vec<ServerMessage> = list.drain(..).map(|p| p.message).collect();
        let size = batch.len();
        // Delivery happens under the entry lock so flushes for one target never interleave
        let result = self.sink.deliver(target, batch);

        if let Err(Undelivered {
            error: DeliveryError::ChannelFull(_),
            batch,
        }) = result
        {
            for message in batch.into_iter().rev() {
                let critical = message.is_critical();
                list.push_front(PendingMessage { message, critical });
            }
            self.enforce_ceiling(target, &mut list);
            drop(list);

            self.counters.deferred.fetch_add(1, Ordering::Relaxed);
            BatcherMetrics::record_deferred();
            tracing::debug!(target_id = %target, size, "Outbound channel full, batch deferred");
            self.schedule(target);
            return 0;
        }

        drop(list);
        self.pending.remove_if(&target, |_, l| l.is_empty());

        match result {
            Ok(()) => {
                self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .messages_delivered
                    .fetch_add(size as u64, Ordering::Relaxed);
                BatcherMetrics::record_flushed(size);
                size
            }
            Err(Undelivered { error, .. }) => {
                self.counters
                    .dropped_delivery
                    .fetch_add(size as u64, Ordering::Relaxed);
                BatcherMetrics::record_delivery_drop(size);
                tracing::debug!(target_id = %target, size, error = %error, "Batch dropped");
                0
            }
        }
    }

    /// Cancel the scheduled flush and deliver immediately
    pub fn flush_now(self: &Arc<Self>, target: Uuid) -> usize {
        self.cancel_timer(target);
        self.flush(target)
    }

    /// Cancel the scheduled flush and drop everything pending for `target`
    pub fn discard(&self, target: Uuid) -> usize {
        self.cancel_timer(target);
        let dropped = self
            .pending
            .remove(&target)
            .map(|(_, list)| list.len())
            .unwrap_or(0);
        if dropped > 0 {
            tracing::debug!(target_id = %target, dropped, "Discarded pending messages");
        }
        dropped
    }

    /// Flush every pending batch now and refuse further enqueues
    pub fn shutdown(self: &Arc<Self>) -> usize {
        self.accepting.store(false, Ordering::Release);
        let targets: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        let delivered = targets.into_iter().map(|t| self.flush_now(t)).sum();
        tracing::info!(delivered, "Message batcher stopped");
        delivered
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn pending_count(&self, target: Uuid) -> usize {
        self.pending.get(&target).map(|l| l.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            batches_flushed: self.counters.batches_flushed.load(Ordering::Relaxed),
            messages_delivered: self.counters.messages_delivered.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            dropped_backpressure: self.counters.dropped_backpressure.load(Ordering::Relaxed),
            dropped_delivery: self.counters.dropped_delivery.load(Ordering::Relaxed),
            pending_targets: self.pending.len(),
            pending_messages: self.pending.iter().map(|e| e.value().len()).sum(),
        }
    }

    fn cancel_timer(&self, target: Uuid) {
        if let Some((_, timer)) = self.timers.remove(&target) {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for MessageBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBatcher")
            .field("flush_delay", &self.flush_delay)
            .field("max_pending", &self.max_pending)
            .field("pending_targets", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::{ConnectionHandle, ConnectionManager, ConnectionMeta};
    use crate::websocket::OutboundMessage;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<(Uuid, Vec<ServerMessage>)>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<(Uuid, Vec<ServerMessage>)> {
            self.batches.lock().clone()
        }
    }

    impl BatchSink for RecordingSink {
        fn deliver(&self, target: Uuid, batch: Vec<ServerMessage>) -> Result<(), Undelivered> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Undelivered {
                    error: DeliveryError::TargetGone(target),
                    batch,
                });
            }
            self.batches.lock().push((target, batch));
            Ok(())
        }
    }

    fn batcher(max_pending: usize) -> (Arc<MessageBatcher>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = BatcherConfig {
            flush_delay_ms: 16,
            max_pending_per_target: max_pending,
        };
        (Arc::new(MessageBatcher::new(sink.clone(), &config)), sink)
    }

    fn msg(n: i64) -> ServerMessage {
        ServerMessage::Heartbeat { timestamp: n }
    }

    fn relayed(n: i64) -> ServerMessage {
        ServerMessage::PartnerMessage {
            room_id: Uuid::nil(),
            payload: serde_json::json!(n),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_within_window_form_one_ordered_batch() {
        let (batcher, sink) = batcher(256);
        let target = Uuid::new_v4();

        batcher.enqueue(target, msg(1)).unwrap();
        batcher.enqueue(target, msg(2)).unwrap();
        batcher.enqueue(target, msg(3)).unwrap();
        assert!(sink.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, vec![msg(1), msg(2), msg(3)]);
        assert_eq!(batcher.pending_count(target), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_preserved_across_batches() {
        let (batcher, sink) = batcher(256);
        let target = Uuid::new_v4();

        batcher.enqueue(target, msg(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        batcher.enqueue(target, msg(2)).unwrap();
        batcher.enqueue(target, msg(3)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let delivered: Vec<ServerMessage> = sink
            .batches()
            .into_iter()
            .flat_map(|(_, batch)| batch)
            .collect();
        assert_eq!(delivered, vec![msg(1), msg(2), msg(3)]);
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(batcher.stats().batches_flushed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_are_batched_separately() {
        let (batcher, sink) = batcher(256);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        batcher.enqueue(a, msg(1)).unwrap();
        batcher.enqueue(b, msg(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut batches = sink.batches();
        batches.sort_by_key(|(t, _)| *t == b);
        assert_eq!(batches, vec![(a, vec![msg(1)]), (b, vec![msg(2)])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_delivers_immediately_and_cancels_timer() {
        let (batcher, sink) = batcher(256);
        let target = Uuid::new_v4();

        batcher.enqueue(target, ServerMessage::Pong).unwrap();
        assert_eq!(batcher.flush_now(target), 1);
        assert_eq!(sink.batches().len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_drops_pending() {
        let (batcher, sink) = batcher(256);
        let target = Uuid::new_v4();

        batcher.enqueue(target, msg(1)).unwrap();
        batcher.enqueue(target, msg(2)).unwrap();
        assert_eq!(batcher.discard(target), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_drops_oldest_non_critical() {
        let (batcher, sink) = batcher(3);
        let target = Uuid::new_v4();

        batcher.enqueue(target, ServerMessage::Pong).unwrap();
        batcher.enqueue(target, relayed(1)).unwrap();
        batcher.enqueue(target, relayed(2)).unwrap();
        batcher.enqueue(target, relayed(3)).unwrap();
        assert_eq!(batcher.pending_count(target), 3);

        batcher.flush_now(target);
        let batches = sink.batches();
        assert_eq!(batches[0].1, vec![ServerMessage::Pong, relayed(2), relayed(3)]);
        assert_eq!(batcher.stats().dropped_backpressure, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_messages_survive_backpressure() {
        let (batcher, _sink) = batcher(2);
        let target = Uuid::new_v4();

        for _ in 0..4 {
            batcher.enqueue(target, ServerMessage::Pong).unwrap();
        }
        assert_eq!(batcher.pending_count(target), 4);
        assert_eq!(batcher.stats().dropped_backpressure, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_drops_batch() {
        let (batcher, sink) = batcher(256);
        sink.fail.store(true, Ordering::Relaxed);
        let target = Uuid::new_v4();

        batcher.enqueue(target, msg(1)).unwrap();
        assert_eq!(batcher.flush_now(target), 0);

        let stats = batcher.stats();
        assert_eq!(stats.dropped_delivery, 1);
        assert_eq!(stats.pending_messages, 0);
    }

    fn connection_batcher(
        channel_capacity: usize,
    ) -> (
        Arc<MessageBatcher>,
        Arc<ConnectionHandle>,
        mpsc::Receiver<OutboundMessage>,
    ) {
        let manager = Arc::new(ConnectionManager::default());
        let (tx, rx) = mpsc::channel(channel_capacity);
        let handle = manager
            .register(ConnectionMeta::new(IpAddr::V4(Ipv4Addr::LOCALHOST)), tx)
            .unwrap();
        let config = BatcherConfig {
            flush_delay_ms: 16,
            max_pending_per_target: 256,
        };
        (Arc::new(MessageBatcher::new(manager, &config)), handle, rx)
    }

    fn received(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(OutboundMessage::Batch(batch)) = rx.try_recv() {
            messages.extend(batch);
        }
        messages
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_keeps_critical_messages_for_retry() {
        let (batcher, handle, mut rx) = connection_batcher(1);
        let left = ServerMessage::PartnerLeft { room_id: Uuid::nil() };

        // Writer is one frame behind
        handle.try_deliver(vec![ServerMessage::Pong]).unwrap();
        batcher.enqueue(handle.id, left.clone()).unwrap();
        assert_eq!(batcher.flush_now(handle.id), 0);

        let stats = batcher.stats();
        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.dropped_delivery, 0);
        assert_eq!(batcher.pending_count(handle.id), 1);

        assert_eq!(received(&mut rx), vec![ServerMessage::Pong]);
        assert_eq!(batcher.flush_now(handle.id), 1);
        assert_eq!(received(&mut rx), vec![left]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_batch_retried_by_timer_in_order() {
        let (batcher, handle, mut rx) = connection_batcher(1);

        handle.try_deliver(vec![ServerMessage::Pong]).unwrap();
        batcher.enqueue(handle.id, msg(1)).unwrap();
        batcher.enqueue(handle.id, ServerMessage::SearchCancelled).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(batcher.pending_count(handle.id), 2);

        // Newer messages queue behind the deferred ones
        batcher.enqueue(handle.id, msg(3)).unwrap();
        assert_eq!(received(&mut rx), vec![ServerMessage::Pong]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            received(&mut rx),
            vec![msg(1), ServerMessage::SearchCancelled, msg(3)]
        );
        assert_eq!(batcher.pending_count(handle.id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_drops_batch() {
        let (batcher, handle, rx) = connection_batcher(1);
        drop(rx);

        batcher.enqueue(handle.id, ServerMessage::Pong).unwrap();
        assert_eq!(batcher.flush_now(handle.id), 0);

        let stats = batcher.stats();
        assert_eq!(stats.dropped_delivery, 1);
        assert_eq!(stats.deferred, 0);
        assert_eq!(stats.pending_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_then_refuses() {
        let (batcher, sink) = batcher(256);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        batcher.enqueue(a, msg(1)).unwrap();
        batcher.enqueue(b, msg(2)).unwrap();

        assert_eq!(batcher.shutdown(), 2);
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(batcher.enqueue(a, msg(3)), Err(DeliveryError::ShuttingDown));
        assert!(!batcher.is_accepting());
    }
}
