// Connection registry - live upstream channels and inbound demultiplexing

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::queue::{MessageQueue, MessageQueues};
use super::{cancel_frame, parse_envelope, InboundMessage};
use crate::error::{QueueError, RegistryError};

pub type ChannelId = u64;

#[derive(Debug)]
struct ChannelHandle {
    id: ChannelId,
    tx: mpsc::UnboundedSender<String>,
}

/// Holds the live upstream channels and the per-request queues they feed.
///
/// One channel is expected in steady state. During a handover a second one
/// may register briefly; outbound traffic always goes to the oldest.
#[derive(Debug)]
pub struct ConnectionRegistry {
    channels: Mutex<Vec<ChannelHandle>>,
    queues: MessageQueues,
    next_id: AtomicU64,
    live_count: watch::Sender<usize>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (live_count, _) = watch::channel(0);
        Self {
            channels: Mutex::new(Vec::new()),
            queues: MessageQueues::new(),
            next_id: AtomicU64::new(1),
            live_count,
        }
    }

    /// Register a channel; frames for it are delivered on `tx`.
    pub fn add_channel(&self, tx: mpsc::UnboundedSender<String>) -> ChannelId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut channels = self.channels.lock();
            channels.push(ChannelHandle { id, tx });
            channels.len()
        };
        self.live_count.send_replace(count);
        tracing::info!("Upstream channel {} connected ({} live)", id, count);
        id
    }

    pub fn remove_channel(&self, id: ChannelId) {
        let (removed, count) = {
            let mut channels = self.channels.lock();
            let before = channels.len();
            channels.retain(|c| c.id != id);
            (before != channels.len(), channels.len())
        };
        if removed {
            self.live_count.send_replace(count);
            tracing::info!("Upstream channel {} disconnected ({} live)", id, count);
        }
    }

    /// Drop every channel. Their writer tasks see the sender go away and close.
    pub fn close_all(&self) {
        let drained: Vec<ChannelHandle> = std::mem::take(&mut *self.channels.lock());
        self.live_count.send_replace(0);
        if !drained.is_empty() {
            tracing::info!("Closed {} upstream channel(s)", drained.len());
        }
    }

    pub fn has_live_channel(&self) -> bool {
        self.channels.lock().iter().any(|c| !c.tx.is_closed())
    }

    pub fn live_channel_count(&self) -> usize {
        self.channels.lock().iter().filter(|c| !c.tx.is_closed()).count()
    }

    /// Wait until at least one channel is registered.
    pub async fn wait_for_channel(&self, timeout: Duration) -> bool {
        let mut rx = self.live_count.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|count| *count > 0)).await,
            Ok(Ok(_))
        );
        ready
    }

    pub fn send_to_first_live(&self, frame: String) -> Result<(), RegistryError> {
        let mut channels = self.channels.lock();
        let mut frame = frame;
        let mut pruned = false;
        let result = loop {
            let Some(first) = channels.first() else {
                break Err(RegistryError::NoChannel);
            };
            match first.tx.send(frame) {
                Ok(()) => break Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    tracing::warn!("Dropping dead upstream channel {}", first.id);
                    channels.remove(0);
                    pruned = true;
                    frame = returned;
                }
            }
        };
        if pruned {
            self.live_count.send_replace(channels.len());
        }
        result
    }

    /// Best-effort advisory cancel for a request whose client went away.
    pub fn send_cancel(&self, request_id: &str) {
        if let Err(e) = self.send_to_first_live(cancel_frame(request_id)) {
            tracing::debug!("[{}] Cancel notice not sent: {}", request_id, e);
        }
    }

    /// Demultiplex one inbound frame into the queue for its request id.
    pub fn route_inbound(&self, text: &str) {
        let (request_id, message) = match parse_envelope(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Ignoring malformed upstream frame: {}", e);
                return;
            }
        };
        if let Err(e) = self.queues.enqueue(&request_id, message) {
            tracing::warn!("[{}] Dropping upstream message: {}", request_id, e);
        }
    }

    pub fn create_queue(&self, request_id: &str) -> Result<MessageQueue, QueueError> {
        self.queues.create(request_id)
    }

    pub fn enqueue(&self, request_id: &str, message: InboundMessage) -> Result<(), QueueError> {
        self.queues.enqueue(request_id, message)
    }

    pub fn destroy_queue(&self, request_id: &str) {
        self.queues.destroy(request_id);
    }

    pub fn pending_requests(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk_frame(id: &str, data: &str) -> String {
        serde_json::json!({"request_id": id, "event_type": "chunk", "data": data}).to_string()
    }

    #[test]
    fn send_without_channel_fails() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.has_live_channel());
        assert_eq!(
            registry.send_to_first_live("x".to_string()),
            Err(RegistryError::NoChannel)
        );
    }

    #[test]
    fn skips_dead_channels() {
        let registry = ConnectionRegistry::new();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        registry.add_channel(dead_tx);
        registry.add_channel(live_tx);
        drop(dead_rx);

        registry.send_to_first_live("hello".to_string()).unwrap();
        assert_eq!(live_rx.try_recv().unwrap(), "hello");
        assert_eq!(registry.live_channel_count(), 1);
        assert_eq!(*registry.live_count.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pruning_the_last_channel_resets_the_live_count() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add_channel(tx);
        drop(rx);

        assert_eq!(
            registry.send_to_first_live("x".to_string()),
            Err(RegistryError::NoChannel)
        );
        assert_eq!(*registry.live_count.borrow(), 0);
        assert!(!registry.wait_for_channel(Duration::from_millis(50)).await);
    }

    #[test]
    fn remove_and_close_channels() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.add_channel(tx);
        registry.remove_channel(id);
        assert!(!registry.has_live_channel());

        let (tx, _rx) = mpsc::unbounded_channel();
        registry.add_channel(tx);
        registry.close_all();
        assert!(!registry.has_live_channel());
    }

    #[tokio::test]
    async fn no_cross_delivery_between_requests() {
        let registry = Arc::new(ConnectionRegistry::new());
        let ids: Vec<String> = (0..8).map(|i| format!("req-{}", i)).collect();
        let mut queues: Vec<_> = ids.iter().map(|id| registry.create_queue(id).unwrap()).collect();

        // Interleave: round-robin over ids, three chunks each.
        for round in 0..3 {
            for id in &ids {
                registry.route_inbound(&chunk_frame(id, &format!("{}:{}", id, round)));
            }
        }
        for id in &ids {
            registry.route_inbound(
                &serde_json::json!({"request_id": id, "event_type": "stream_close"}).to_string(),
            );
        }

        for (id, queue) in ids.iter().zip(queues.iter_mut()) {
            for round in 0..3 {
                let msg = queue.dequeue(Some(Duration::from_secs(1))).await.unwrap();
                assert_eq!(
                    msg,
                    InboundMessage::Chunk {
                        data: format!("{}:{}", id, round)
                    }
                );
            }
            assert_eq!(
                queue.dequeue(Some(Duration::from_secs(1))).await.unwrap(),
                InboundMessage::StreamEnd
            );
        }
    }

    #[test]
    fn unknown_request_ids_are_dropped() {
        let registry = ConnectionRegistry::new();
        registry.route_inbound(&chunk_frame("gone", "late"));
        registry.route_inbound("not json at all");
        assert_eq!(registry.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_channel_sees_registration() {
        let registry = Arc::new(ConnectionRegistry::new());
        assert!(!registry.wait_for_channel(Duration::from_millis(50)).await);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for_channel(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.add_channel(tx);
        assert!(waiter.await.unwrap());
    }
}
