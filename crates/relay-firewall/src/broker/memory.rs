//! In-process broker used by tests and the embedded development mode.

use super::{Broker, Delivery};
use async_trait::async_trait;
use relay_core::{Envelope, RelayError, RelayResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
    notify: Arc<Notify>,
}

/// Broker keeping every queue in memory.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    next_id: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting to be consumed.
    pub async fn depth(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages handed out and not yet settled.
    pub async fn unacked(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Copy of the waiting messages, head first.
    pub async fn snapshot(&self, queue: &str) -> Vec<Envelope> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|q| q.ready.iter().map(|d| d.envelope.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn create_queue(&self, queue: &str) -> RelayResult<()> {
        let mut queues = self.queues.lock().await;
        if !queues.contains_key(queue) {
            debug!(queue = %queue, "queue created");
            queues.insert(queue.to_string(), QueueState::default());
        }
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> RelayResult<bool> {
        Ok(self.queues.lock().await.contains_key(queue))
    }

    async fn list_queues(&self, prefix: &str) -> RelayResult<Vec<String>> {
        let queues = self.queues.lock().await;
        let mut names: Vec<String> = queues
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> RelayResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| RelayError::QueueNotFound(queue.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        state.ready.push_back(Delivery {
            id,
            envelope,
            redelivered: false,
        });
        state.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> RelayResult<Delivery> {
        loop {
            let notify = {
                let mut queues = self.queues.lock().await;
                let state = queues
                    .get_mut(queue)
                    .ok_or_else(|| RelayError::QueueNotFound(queue.to_string()))?;
                if let Some(delivery) = state.ready.pop_front() {
                    state.unacked.insert(delivery.id, delivery.clone());
                    // Wake the next waiter if more work is queued.
                    if !state.ready.is_empty() {
                        state.notify.notify_one();
                    }
                    return Ok(delivery);
                }
                state.notify.clone()
            };
            notify.notified().await;
        }
    }

    async fn ack(&self, queue: &str, delivery_id: u64) -> RelayResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| RelayError::QueueNotFound(queue.to_string()))?;
        state
            .unacked
            .remove(&delivery_id)
            .map(|_| ())
            .ok_or_else(|| RelayError::Broker(format!("unknown delivery {delivery_id} on {queue}")))
    }

    async fn release(&self, queue: &str, delivery_id: u64) -> RelayResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| RelayError::QueueNotFound(queue.to_string()))?;
        let mut delivery = state
            .unacked
            .remove(&delivery_id)
            .ok_or_else(|| RelayError::Broker(format!("unknown delivery {delivery_id} on {queue}")))?;
        delivery.redelivered = true;
        state.ready.push_front(delivery);
        state.notify.notify_one();
        Ok(())
    }
}
