//! Broker seam: the queues the relay consumes from and publishes to.
//!
//! The broker's storage and clustering live outside this process. The
//! relay only relies on at-least-once delivery: a consumed message stays
//! owned by the consumer until it is acked, and a released message is
//! handed out again before anything queued behind it.

pub mod memory;

pub use memory::InMemoryBroker;

use async_trait::async_trait;
use relay_core::{Envelope, RelayResult};

/// A message handed to a consumer and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub envelope: Envelope,
    /// True when the message was released before and handed out again.
    pub redelivered: bool,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn create_queue(&self, queue: &str) -> RelayResult<()>;

    async fn queue_exists(&self, queue: &str) -> RelayResult<bool>;

    async fn list_queues(&self, prefix: &str) -> RelayResult<Vec<String>>;

    /// Append a message. Fails with `QueueNotFound` for unknown queues.
    async fn publish(&self, queue: &str, envelope: Envelope) -> RelayResult<()>;

    /// Wait for the next message on `queue`. Dropping the future before it
    /// completes must not lose a message.
    async fn consume(&self, queue: &str) -> RelayResult<Delivery>;

    async fn ack(&self, queue: &str, delivery_id: u64) -> RelayResult<()>;

    /// Return an unacked message to the head of its queue.
    async fn release(&self, queue: &str, delivery_id: u64) -> RelayResult<()>;
}
