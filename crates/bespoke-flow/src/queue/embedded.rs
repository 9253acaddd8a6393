//! Embedded store-backed task queue.
//!
//! The default backend for single-host deployments. Items are persisted
//! through the result store before `enqueue` returns, so the queue's
//! contents survive a process restart; the in-memory index (ready deques,
//! in-flight deadlines) is rebuilt from the store on open.
//!
//! Redelivery: a claimed item whose visibility deadline passes, or that is
//! nacked with requeue, returns to the *head* of its routing key's deque so
//! per-key FIFO order is preserved. Each redelivery consumes one unit of
//! the routing key's budget; exhaustion moves the item to the dead-letter
//! shelf for the coordinator to sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use bespoke_core::{keys, StoreBackend, WritePrecondition};

use super::{Delivery, DeliveryTag, QueueItem, TaskQueue};
use crate::error::{Error, Result};
use crate::task::RoutingKey;

/// How long a single long-poll sleep lasts before re-checking deadlines.
const POLL_GRANULARITY: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct InFlightEntry {
    routing_key: RoutingKey,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    next_sequence: u64,
    ready: HashMap<RoutingKey, VecDeque<u64>>,
    in_flight: HashMap<u64, InFlightEntry>,
    items: HashMap<u64, QueueItem>,
    dead: Vec<QueueItem>,
}

/// In-process queue persisted through the result store.
pub struct EmbeddedQueue {
    backend: Arc<dyn StoreBackend>,
    retry_limits: HashMap<RoutingKey, u32>,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl std::fmt::Debug for EmbeddedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedQueue")
            .field("retry_limits", &self.retry_limits)
            .finish()
    }
}

impl EmbeddedQueue {
    /// Opens the queue, rebuilding the ready index from persisted items.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub async fn open(
        backend: Arc<dyn StoreBackend>,
        retry_limits: HashMap<RoutingKey, u32>,
    ) -> Result<Self> {
        let mut inner = Inner::default();

        let metas = backend.list(keys::QUEUE_PREFIX).await?;
        let mut recovered: Vec<(u64, QueueItem)> = Vec::with_capacity(metas.len());
        for meta in metas {
            let Some(sequence) = meta
                .key
                .rsplit('/')
                .next()
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            let bytes = backend.get(&meta.key).await?;
            let item: QueueItem =
                serde_json::from_slice(&bytes).map_err(bespoke_core::Error::from)?;
            recovered.push((sequence, item));
        }
        recovered.sort_by_key(|(sequence, _)| *sequence);

        for (sequence, item) in recovered {
            inner.next_sequence = inner.next_sequence.max(sequence + 1);
            inner
                .ready
                .entry(item.routing_key)
                .or_default()
                .push_back(sequence);
            inner.items.insert(sequence, item);
        }

        Ok(Self {
            backend,
            retry_limits,
            inner: Mutex::new(inner),
            notify: Notify::new(),
        })
    }

    fn allowed_attempts(&self, routing_key: RoutingKey) -> u32 {
        self.retry_limits.get(&routing_key).copied().unwrap_or(0) + 1
    }

    async fn persist(&self, sequence: u64, item: &QueueItem) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(item).map_err(bespoke_core::Error::from)?);
        self.backend
            .put(
                &keys::queue_item(item.routing_key.as_str(), sequence),
                bytes,
                WritePrecondition::None,
            )
            .await?;
        Ok(())
    }

    async fn unpersist(&self, sequence: u64, routing_key: RoutingKey) -> Result<()> {
        self.backend
            .delete(&keys::queue_item(routing_key.as_str(), sequence))
            .await?;
        Ok(())
    }

    /// Returns expired in-flight items to their queues (or the dead-letter
    /// shelf). Called opportunistically under the lock.
    async fn requeue_expired(&self, inner: &mut Inner) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<u64> = inner
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(sequence, _)| *sequence)
            .collect();

        for sequence in expired {
            inner.in_flight.remove(&sequence);
            self.return_to_queue(inner, sequence, true).await?;
        }
        Ok(())
    }

    /// Moves a claimed item back to its queue head or dead-letters it.
    async fn return_to_queue(
        &self,
        inner: &mut Inner,
        sequence: u64,
        count_attempt: bool,
    ) -> Result<()> {
        let Some(item) = inner.items.get(&sequence).cloned() else {
            return Ok(());
        };
        let routing_key = item.routing_key;

        if count_attempt && item.attempt >= self.allowed_attempts(routing_key) {
            tracing::warn!(
                task_id = %item.task_id,
                routing_key = %routing_key,
                attempt = item.attempt,
                "redelivery budget exhausted; dead-lettering"
            );
            inner.items.remove(&sequence);
            inner.dead.push(item.clone());
            self.unpersist(sequence, routing_key).await?;
        } else {
            inner
                .ready
                .entry(routing_key)
                .or_default()
                .push_front(sequence);
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Pops the oldest ready sequence across the requested keys.
    fn pop_ready(inner: &mut Inner, routing_keys: &[RoutingKey]) -> Option<u64> {
        let mut best: Option<(u64, RoutingKey)> = None;
        for key in routing_keys {
            if let Some(front) = inner.ready.get(key).and_then(VecDeque::front) {
                if best.is_none_or(|(seq, _)| *front < seq) {
                    best = Some((*front, *key));
                }
            }
        }
        let (sequence, key) = best?;
        inner.ready.get_mut(&key)?.pop_front();
        Some(sequence)
    }
}

#[async_trait]
impl TaskQueue for EmbeddedQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        // Durable before visible: a crash after this write redelivers the
        // item on restart instead of losing it.
        self.persist(sequence, &item).await?;

        inner
            .ready
            .entry(item.routing_key)
            .or_default()
            .push_back(sequence);
        inner.items.insert(sequence, item);
        drop(inner);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn claim(
        &self,
        routing_keys: &[RoutingKey],
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let wait_deadline = Instant::now() + wait;

        loop {
            {
                let mut inner = self.inner.lock().await;
                self.requeue_expired(&mut inner).await?;

                if let Some(sequence) = Self::pop_ready(&mut inner, routing_keys) {
                    let item = {
                        let entry = inner.items.get_mut(&sequence).ok_or_else(|| {
                            Error::internal(format!("queue index missing item {sequence}"))
                        })?;
                        entry.attempt += 1;
                        entry.clone()
                    };
                    self.persist(sequence, &item).await?;

                    inner.in_flight.insert(
                        sequence,
                        InFlightEntry {
                            routing_key: item.routing_key,
                            deadline: Instant::now() + visibility,
                        },
                    );

                    let visibility_deadline = Utc::now()
                        + chrono::Duration::from_std(visibility)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    return Ok(Some(Delivery {
                        item,
                        tag: DeliveryTag(sequence),
                        visibility_deadline,
                    }));
                }
            }

            let now = Instant::now();
            if now >= wait_deadline {
                return Ok(None);
            }
            let sleep = POLL_GRANULARITY.min(wait_deadline - now);
            let _ = tokio::time::timeout(sleep, self.notify.notified()).await;
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&tag.0);
        if let Some(item) = inner.items.remove(&tag.0) {
            self.unpersist(tag.0, item.routing_key).await?;
        }
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&tag.0);
        if requeue {
            self.return_to_queue(&mut inner, tag.0, true).await?;
        } else if let Some(item) = inner.items.remove(&tag.0) {
            self.unpersist(tag.0, item.routing_key).await?;
        }
        Ok(())
    }

    async fn extend_visibility(&self, tag: &DeliveryTag, visibility: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner.in_flight.get_mut(&tag.0).ok_or_else(|| {
            Error::internal(format!("delivery {} is not in flight", tag.0))
        })?;
        entry.deadline = Instant::now() + visibility;
        Ok(())
    }

    async fn depth(&self, routing_key: RoutingKey) -> Result<usize> {
        let inner = self.inner.lock().await;
        let ready = inner.ready.get(&routing_key).map_or(0, VecDeque::len);
        let in_flight = inner
            .in_flight
            .values()
            .filter(|entry| entry.routing_key == routing_key)
            .count();
        Ok(ready + in_flight)
    }

    async fn drain_dead_letters(&self) -> Result<Vec<QueueItem>> {
        let mut inner = self.inner.lock().await;
        Ok(std::mem::take(&mut inner.dead))
    }
}
