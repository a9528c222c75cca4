//! In-memory visibility-timeout queue for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use ingestflow_core::{Clock, MessageId};

use super::{
    MAX_RECEIVE_BATCH, MessageQueue, OutgoingMessage, QueueDepth, QueueError, QueueMessage,
    ReceiptHandle,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    body: String,
    attributes: BTreeMap<String, String>,
    receive_count: u32,
    sent_timestamp: DateTime<Utc>,
    first_receive_timestamp: Option<DateTime<Utc>>,
    visible_at: DateTime<Utc>,
    /// Set while a received copy is outstanding.
    receipt: Option<ReceiptHandle>,
}

impl StoredMessage {
    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }
}

#[derive(Debug)]
struct DeadLetterTarget {
    queue: Arc<InMemoryQueue>,
    max_receive_count: u32,
}

/// In-memory queue.
///
/// - Receive order is send order among visible messages
/// - Time comes from the injected clock, so visibility and delays are driven
///   by advancing a `ManualClock` in tests
/// - Can be switched offline to exercise transport failures
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    clock: Arc<dyn Clock>,
    messages: Mutex<Vec<StoredMessage>>,
    dead_letter: Option<DeadLetterTarget>,
    available: AtomicBool,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            messages: Mutex::new(Vec::new()),
            dead_letter: None,
            available: AtomicBool::new(true),
        }
    }

    /// Move messages to `queue` once their receive count reaches
    /// `max_receive_count`.
    pub fn with_dead_letter(mut self, queue: Arc<InMemoryQueue>, max_receive_count: u32) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            queue,
            max_receive_count: max_receive_count.max(1),
        });
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored messages regardless of visibility.
    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<StoredMessage>>, QueueError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(self.unavailable("queue switched offline"));
        }
        self.messages
            .lock()
            .map_err(|_| self.unavailable("queue lock poisoned"))
    }

    fn unavailable(&self, reason: &str) -> QueueError {
        QueueError::Unavailable {
            queue: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutgoingMessage) -> Result<MessageId, QueueError> {
        let mut messages = self.lock()?;
        let now = self.clock.now();
        let id = MessageId::new();

        messages.push(StoredMessage {
            id,
            body: message.body,
            attributes: message.attributes,
            receive_count: 0,
            sent_timestamp: now,
            first_receive_timestamp: None,
            visible_at: now + to_chrono(message.delay.min(super::MAX_DELAY)),
            receipt: None,
        });

        debug!(queue = %self.name, message_id = %id, "message sent");
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let limit = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let now = self.clock.now();
        let hidden_until = now + to_chrono(visibility_timeout);

        let mut messages = self.lock()?;
        // Taken lazily, primary before dead-letter, so a move is a single
        // critical section and a message is never held by neither queue.
        let mut dead_letters: Option<MutexGuard<'_, Vec<StoredMessage>>> = None;
        let mut dead_letter_offline = false;
        let mut received = Vec::new();

        let mut i = 0;
        while i < messages.len() && received.len() < limit {
            if !messages[i].is_visible(now) {
                i += 1;
                continue;
            }

            if let Some(target) = &self.dead_letter {
                if messages[i].receive_count >= target.max_receive_count {
                    if dead_letters.is_none() && !dead_letter_offline {
                        match target.queue.lock() {
                            Ok(guard) => dead_letters = Some(guard),
                            Err(err) => {
                                warn!(
                                    queue = %self.name,
                                    dead_letter_queue = %target.queue.name,
                                    error = %err,
                                    "dead-letter queue unavailable; keeping exhausted messages"
                                );
                                dead_letter_offline = true;
                            }
                        }
                    }

                    let Some(dlq) = dead_letters.as_mut() else {
                        i += 1;
                        continue;
                    };

                    let mut message = messages.remove(i);
                    warn!(
                        queue = %self.name,
                        dead_letter_queue = %target.queue.name,
                        message_id = %message.id,
                        receive_count = message.receive_count,
                        "max receive count reached; moving message to dead-letter queue"
                    );
                    message.visible_at = now;
                    message.receipt = None;
                    dlq.push(message);
                    continue;
                }
            }

            let message = &mut messages[i];
            let receipt = ReceiptHandle::new(Uuid::now_v7().to_string());
            message.receive_count += 1;
            message.first_receive_timestamp.get_or_insert(now);
            message.visible_at = hidden_until;
            message.receipt = Some(receipt.clone());

            received.push(QueueMessage {
                id: message.id,
                body: message.body.clone(),
                attributes: message.attributes.clone(),
                receive_count: message.receive_count,
                sent_timestamp: message.sent_timestamp,
                first_receive_timestamp: message.first_receive_timestamp,
                receipt_handle: receipt,
            });
            i += 1;
        }

        Ok(received)
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut messages = self.lock()?;
        let index = messages
            .iter()
            .position(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::InvalidReceipt(receipt.clone()))?;
        let removed = messages.remove(index);

        debug!(queue = %self.name, message_id = %removed.id, "message deleted");
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt: &ReceiptHandle,
        visibility_timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut messages = self.lock()?;
        let now = self.clock.now();
        let message = messages
            .iter_mut()
            .find(|m| m.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| QueueError::InvalidReceipt(receipt.clone()))?;

        message.visible_at = now + to_chrono(visibility_timeout);
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let messages = self.lock()?;
        let now = self.clock.now();

        Ok(messages.iter().fold(QueueDepth::default(), |mut depth, m| {
            if m.is_visible(now) {
                depth.available += 1;
            } else if m.receipt.is_some() {
                depth.in_flight += 1;
            } else {
                depth.delayed += 1;
            }
            depth
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestflow_core::ManualClock;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn queue_with_clock() -> (Arc<ManualClock>, InMemoryQueue) {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = InMemoryQueue::new("primary", clock.clone());
        (clock, queue)
    }

    #[tokio::test]
    async fn received_message_is_hidden_until_visibility_lapses() {
        let (clock, queue) = queue_with_clock();
        let id = queue.send(OutgoingMessage::new("{}")).await.unwrap();

        let first = queue.receive(10, VISIBILITY).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, id);
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.receive(10, VISIBILITY).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(31));
        let second = queue.receive(10, VISIBILITY).await.unwrap();
        assert_eq!(second[0].receive_count, 2);
        assert_eq!(second[0].first_receive_timestamp, first[0].first_receive_timestamp);
    }

    #[tokio::test]
    async fn delete_requires_latest_receipt() {
        let (clock, queue) = queue_with_clock();
        queue.send(OutgoingMessage::new("{}")).await.unwrap();

        let stale = queue.receive(1, VISIBILITY).await.unwrap().remove(0);
        clock.advance(chrono::Duration::seconds(31));
        let fresh = queue.receive(1, VISIBILITY).await.unwrap().remove(0);

        assert!(matches!(
            queue.delete(&stale.receipt_handle).await,
            Err(QueueError::InvalidReceipt(_))
        ));
        queue.delete(&fresh.receipt_handle).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn zero_visibility_releases_immediately() {
        let (_clock, queue) = queue_with_clock();
        queue.send(OutgoingMessage::new("{}")).await.unwrap();

        let m = queue.receive(1, VISIBILITY).await.unwrap().remove(0);
        queue.change_visibility(&m.receipt_handle, Duration::ZERO).await.unwrap();

        assert_eq!(queue.receive(1, VISIBILITY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delayed_message_counts_as_delayed_until_due() {
        let (clock, queue) = queue_with_clock();
        queue
            .send(OutgoingMessage::new("{}").with_delay(Duration::from_secs(60)))
            .await
            .unwrap();

        let depth = queue.depth().await.unwrap();
        assert_eq!((depth.available, depth.in_flight, depth.delayed), (0, 0, 1));
        assert!(queue.receive(10, VISIBILITY).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(queue.depth().await.unwrap().available, 1);
    }

    #[tokio::test]
    async fn exhausted_message_moves_to_dead_letter_queue() {
        let clock = Arc::new(ManualClock::starting_now());
        let dlq = Arc::new(InMemoryQueue::new("dlq", clock.clone()));
        let queue = InMemoryQueue::new("primary", clock.clone()).with_dead_letter(dlq.clone(), 2);

        let id = queue
            .send(OutgoingMessage::new("{}").with_attribute("idempotencyKey", "k"))
            .await
            .unwrap();

        for _ in 0..2 {
            assert_eq!(queue.receive(1, VISIBILITY).await.unwrap().len(), 1);
            clock.advance(chrono::Duration::seconds(31));
        }

        assert!(queue.receive(1, VISIBILITY).await.unwrap().is_empty());
        assert!(queue.is_empty());

        let dead = dlq.receive(1, VISIBILITY).await.unwrap().remove(0);
        assert_eq!(dead.id, id);
        assert_eq!(dead.attribute("idempotencyKey"), Some("k"));
        assert_eq!(dead.receive_count, 3);
    }

    #[tokio::test]
    async fn exhausted_message_stays_put_while_dead_letter_queue_is_offline() {
        let clock = Arc::new(ManualClock::starting_now());
        let dlq = Arc::new(InMemoryQueue::new("dlq", clock.clone()));
        let queue = InMemoryQueue::new("primary", clock.clone()).with_dead_letter(dlq.clone(), 1);

        let id = queue.send(OutgoingMessage::new("{}")).await.unwrap();
        assert_eq!(queue.receive(1, VISIBILITY).await.unwrap().len(), 1);
        clock.advance(chrono::Duration::seconds(31));

        dlq.set_available(false);
        assert!(queue.receive(1, VISIBILITY).await.unwrap().is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(dlq.len(), 0);

        dlq.set_available(true);
        assert!(queue.receive(1, VISIBILITY).await.unwrap().is_empty());
        assert!(queue.is_empty());
        let dead = dlq.receive(1, VISIBILITY).await.unwrap().remove(0);
        assert_eq!(dead.id, id);
    }

    #[tokio::test]
    async fn offline_queue_reports_unavailable() {
        let (_clock, queue) = queue_with_clock();
        queue.set_available(false);
        assert!(queue.depth().await.unwrap_err().is_unavailable());
    }
}
