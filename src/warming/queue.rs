//! Warming job queue
//!
//! Retry and dead-letter policy belong to the queue: a message that has been
//! handed out `max_attempts` times without an ack is moved to the
//! dead-letter list instead of being redelivered.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::WarmingJob;
use crate::error::{Error, Result};

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deliveries before a message is dead-lettered
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// A delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: Uuid,
    /// JSON job body
    pub body: String,
    /// Deliveries so far, including this one
    pub attempts: u32,
}

impl QueueMessage {
    pub fn job(&self) -> Result<WarmingJob> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[async_trait]
pub trait WarmingQueue: Send + Sync {
    /// Enqueue jobs in order
    async fn send_batch(&self, jobs: &[WarmingJob]) -> Result<()>;

    /// Wait for at least one message and return up to `max`
    ///
    /// Returns `QueueClosed` once the queue is closed and drained.
    async fn receive_batch(&self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Acknowledge a processed message
    async fn ack(&self, id: Uuid) -> Result<()>;

    /// Return a message for redelivery. `false` if it was dead-lettered.
    async fn retry(&self, id: Uuid) -> Result<bool>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<Uuid, QueueMessage>,
    dead_letter: Vec<QueueMessage>,
}

/// In-process queue with at-least-once delivery
pub struct InMemoryWarmingQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

impl InMemoryWarmingQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Stop accepting jobs and wake idle receivers
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Messages waiting for delivery
    pub fn pending(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Messages delivered but not yet acked or retried
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<QueueMessage> {
        self.state.lock().dead_letter.clone()
    }

    fn take_ready(&self, max: usize) -> Vec<QueueMessage> {
        let mut state = self.state.lock();
        let count = max.min(state.ready.len());
        let mut batch: Vec<QueueMessage> = state.ready.drain(..count).collect();
        for message in &mut batch {
            message.attempts += 1;
            state.in_flight.insert(message.id, message.clone());
        }
        batch
    }
}

impl Default for InMemoryWarmingQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl WarmingQueue for InMemoryWarmingQueue {
    async fn send_batch(&self, jobs: &[WarmingJob]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::QueueClosed);
        }

        let mut messages = Vec::with_capacity(jobs.len());
        for job in jobs {
            messages.push(QueueMessage {
                id: Uuid::new_v4(),
                body: serde_json::to_string(job)?,
                attempts: 0,
            });
        }

        self.state.lock().ready.extend(messages);
        self.notify.notify_waiters();
        debug!(count = jobs.len(), "Enqueued warming jobs");
        Ok(())
    }

    async fn receive_batch(&self, max: usize) -> Result<Vec<QueueMessage>> {
        let max = max.max(1);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_ready(max);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if self.is_closed() {
                return Err(Error::QueueClosed);
            }

            notified.await;
        }
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        self.state.lock().in_flight.remove(&id);
        Ok(())
    }

    async fn retry(&self, id: Uuid) -> Result<bool> {
        let requeued = {
            let mut state = self.state.lock();
            let Some(message) = state.in_flight.remove(&id) else {
                return Ok(false);
            };

            if message.attempts >= self.config.max_attempts {
                warn!(id = %id, attempts = message.attempts, "Warming job dead-lettered");
                state.dead_letter.push(message);
                false
            } else {
                state.ready.push_back(message);
                true
            }
        };

        if requeued {
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Category;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(query: &str) -> WarmingJob {
        WarmingJob {
            query: query.into(),
            category: Category::Author,
            priority: 1,
        }
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let queue = InMemoryWarmingQueue::default();
        queue
            .send_batch(&[job("a"), job("b"), job("c")])
            .await
            .unwrap();

        let first = queue.receive_batch(2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].job().unwrap().query, "a");
        assert_eq!(first[1].job().unwrap().query, "b");
        assert_eq!(first[0].attempts, 1);

        let second = queue.receive_batch(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(queue.in_flight(), 3);

        for message in first.iter().chain(second.iter()) {
            queue.ack(message.id).await.unwrap();
        }
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let queue = InMemoryWarmingQueue::default();
        queue.send_batch(&[job("flaky")]).await.unwrap();

        for attempt in 1..=3 {
            let batch = queue.receive_batch(1).await.unwrap();
            assert_eq!(batch[0].attempts, attempt);
            let requeued = queue.retry(batch[0].id).await.unwrap();
            assert_eq!(requeued, attempt < 3);
        }

        assert_eq!(queue.pending(), 0);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job().unwrap().query, "flaky");
    }

    #[tokio::test]
    async fn test_receiver_wakes_on_send() {
        let queue = Arc::new(InMemoryWarmingQueue::default());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive_batch(10).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.send_batch(&[job("late")]).await.unwrap();

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let queue = InMemoryWarmingQueue::default();
        queue.send_batch(&[job("last")]).await.unwrap();
        queue.close();

        assert_eq!(queue.receive_batch(10).await.unwrap().len(), 1);
        assert!(matches!(queue.receive_batch(10).await, Err(Error::QueueClosed)));
        assert!(matches!(queue.send_batch(&[job("x")]).await, Err(Error::QueueClosed)));
    }
}
