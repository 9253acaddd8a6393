//! Task queue abstraction.
//!
//! The queue's contract: FIFO per routing key, at-least-once delivery with
//! a visibility timeout, explicit ack/nack, bounded redelivery, and
//! dead-lettering once the redelivery budget is spent. Enqueue is durable:
//! an enqueued item survives a process restart.
//!
//! Backends are addressed by a connection URL. The default `embedded`
//! backend runs in-process and persists through the result store, which is
//! the right shape for single-host deployments; a network backend slots in
//! behind the same trait for multi-host.

pub mod embedded;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bespoke_core::{StoreBackend, TaskId};

use crate::error::{Error, Result};
use crate::task::RoutingKey;

/// One unit of ready work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// The task to execute.
    pub task_id: TaskId,
    /// Pool the item is routed to.
    pub routing_key: RoutingKey,
    /// When the item was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempt count (1 on first delivery).
    pub attempt: u32,
}

impl QueueItem {
    /// Creates a fresh queue item for a task.
    #[must_use]
    pub fn new(task_id: TaskId, routing_key: RoutingKey) -> Self {
        Self {
            task_id,
            routing_key,
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }
}

/// Opaque receipt identifying one delivery, required to ack or nack it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub(crate) u64);

/// A claimed item together with its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The claimed item (attempt already incremented for this delivery).
    pub item: QueueItem,
    /// Receipt for ack/nack.
    pub tag: DeliveryTag,
    /// When the item becomes visible to other claimants again.
    pub visibility_deadline: DateTime<Utc>,
}

/// Queue contract used by orchestrators (enqueue) and workers (claim).
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Durably enqueues an item at the tail of its routing key's queue.
    async fn enqueue(&self, item: QueueItem) -> Result<()>;

    /// Claims one item matching any of the given routing keys.
    ///
    /// Long-polls up to `wait`; returns `None` when nothing became
    /// available. The claimed item is invisible to other claimants until
    /// `visibility` elapses, after which it is redelivered.
    async fn claim(
        &self,
        routing_keys: &[RoutingKey],
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>>;

    /// Acknowledges a delivery, removing the item permanently.
    async fn ack(&self, tag: &DeliveryTag) -> Result<()>;

    /// Negatively acknowledges a delivery.
    ///
    /// With `requeue` the item returns to the head of its queue (counted
    /// against the redelivery budget); without it the item is discarded,
    /// for callers that have already settled the task's fate.
    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<()>;

    /// Extends the visibility deadline of an in-flight delivery.
    async fn extend_visibility(&self, tag: &DeliveryTag, visibility: Duration) -> Result<()>;

    /// Approximate number of items queued or in flight for a routing key.
    async fn depth(&self, routing_key: RoutingKey) -> Result<usize>;

    /// Drains items that exhausted their redelivery budget.
    ///
    /// The coordinator sweeps these and fails the owning tasks.
    async fn drain_dead_letters(&self) -> Result<Vec<QueueItem>>;
}

/// Connects to a queue backend by URL.
///
/// `embedded` is the in-process, store-backed default. Anything else is
/// reported as unavailable rather than guessed at.
///
/// # Errors
///
/// Returns `Error::QueueUnavailable` for unknown URLs and storage errors
/// while rebuilding the embedded queue from persisted items.
pub async fn connect(
    url: &str,
    backend: Arc<dyn StoreBackend>,
    retry_limits: HashMap<RoutingKey, u32>,
) -> Result<Arc<dyn TaskQueue>> {
    match url {
        "embedded" => {
            let queue = embedded::EmbeddedQueue::open(backend, retry_limits).await?;
            Ok(Arc::new(queue))
        }
        other => Err(Error::QueueUnavailable {
            message: format!("unsupported queue backend url: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bespoke_core::MemoryBackend;

    #[tokio::test]
    async fn connect_embedded() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let queue = connect("embedded", backend, HashMap::new()).await;
        assert!(queue.is_ok());
    }

    #[tokio::test]
    async fn connect_rejects_unknown_backend() {
        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
        let err = connect("amqp://broker", backend, HashMap::new())
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, Error::QueueUnavailable { .. }));
    }
}
