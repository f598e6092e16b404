// Per-request message queues

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use super::InboundMessage;
use crate::error::QueueError;

/// Consumer side of one request's queue.
///
/// Unbounded FIFO; dropping the handle does not remove the producer side, call
/// [`MessageQueues::destroy`] for that.
#[derive(Debug)]
pub struct MessageQueue {
    request_id: String,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl MessageQueue {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the next message, failing with [`QueueError::Timeout`] once
    /// `timeout` elapses.
    pub async fn dequeue(&mut self, timeout: Option<Duration>) -> Result<InboundMessage, QueueError> {
        let next = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx.recv())
                .await
                .map_err(|_| QueueError::Timeout)?,
            None => self.rx.recv().await,
        };
        next.ok_or(QueueError::Closed)
    }
}

/// Producer side of all live queues, keyed by request id.
#[derive(Debug, Default)]
pub struct MessageQueues {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<InboundMessage>>>,
}

impl MessageQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, request_id: &str) -> Result<MessageQueue, QueueError> {
        let mut senders = self.senders.lock();
        if senders.contains_key(request_id) {
            return Err(QueueError::AlreadyExists(request_id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        senders.insert(request_id.to_string(), tx);
        Ok(MessageQueue {
            request_id: request_id.to_string(),
            rx,
        })
    }

    /// Append a message; never blocks.
    pub fn enqueue(&self, request_id: &str, message: InboundMessage) -> Result<(), QueueError> {
        let senders = self.senders.lock();
        let tx = senders
            .get(request_id)
            .ok_or_else(|| QueueError::NotFound(request_id.to_string()))?;
        tx.send(message).map_err(|_| QueueError::Closed)
    }

    /// Remove a queue, dropping anything still buffered in it.
    pub fn destroy(&self, request_id: &str) -> bool {
        self.senders.lock().remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.senders.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &str) -> InboundMessage {
        InboundMessage::Chunk {
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queues = MessageQueues::new();
        let mut queue = queues.create("a").unwrap();
        queues.enqueue("a", chunk("1")).unwrap();
        queues.enqueue("a", chunk("2")).unwrap();
        queues.enqueue("a", InboundMessage::StreamEnd).unwrap();

        assert_eq!(queue.dequeue(None).await.unwrap(), chunk("1"));
        assert_eq!(queue.dequeue(None).await.unwrap(), chunk("2"));
        assert_eq!(queue.dequeue(None).await.unwrap(), InboundMessage::StreamEnd);
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let queues = MessageQueues::new();
        let _queue = queues.create("a").unwrap();
        assert_eq!(
            queues.create("a").unwrap_err(),
            QueueError::AlreadyExists("a".to_string())
        );
    }

    #[tokio::test]
    async fn enqueue_without_queue_is_rejected() {
        let queues = MessageQueues::new();
        assert!(matches!(
            queues.enqueue("ghost", chunk("x")),
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_times_out() {
        let queues = MessageQueues::new();
        let mut queue = queues.create("a").unwrap();
        let result = queue.dequeue(Some(Duration::from_secs(30))).await;
        assert_eq!(result.unwrap_err(), QueueError::Timeout);
    }

    #[tokio::test]
    async fn destroyed_queue_rejects_late_messages() {
        let queues = MessageQueues::new();
        let queue = queues.create("a").unwrap();
        queues.enqueue("a", chunk("lost")).unwrap();
        assert!(queues.destroy("a"));
        drop(queue);
        assert!(!queues.contains("a"));
        assert!(queues.is_empty());
        assert!(queues.enqueue("a", chunk("late")).is_err());
    }
}
