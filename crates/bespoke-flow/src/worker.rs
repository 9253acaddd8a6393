//! Worker loop: claim, heartbeat, execute, publish.
//!
//! Each worker serves one set of routing keys with a configured core and
//! memory budget. The loop:
//!
//! 1. Claim one queue item (visibility = expected duration × 2)
//! 2. Heartbeat the cache lease (and extend queue visibility) every third
//!    of the lease TTL
//! 3. Invoke the external executor with the input document and budget
//! 4. Publish to the cache and ack, or release the lease and nack
//!
//! Workers never mutate submission, stage, or task records; they report
//! outcomes through the completion channel and the owning orchestrator
//! applies them. The queue and the cache are the only shared state a
//! worker touches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use bespoke_core::{SubmissionId, TaskId, WorkerId};

use crate::cache::CacheManager;
use crate::error::Result;
use crate::executor::{CancellationRegistry, ExecutionBudget, ExecutorOutcome, ExecutorSet};
use crate::queue::{Delivery, TaskQueue};
use crate::store::StateStore;
use crate::task::{RoutingKey, TaskErrorKind, TaskFailure};

/// Outcome a worker reports for one task.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// The result was published to the cache.
    Succeeded,
    /// The executor reported a structured failure (carried here).
    Failed(TaskFailure),
    /// The task observed cancellation and stopped.
    Cancelled,
}

/// Completion event sent to the coordinator.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    /// The submission owning the task.
    pub submission_id: SubmissionId,
    /// The completed task.
    pub task_id: TaskId,
    /// What happened.
    pub outcome: CompletionOutcome,
}

/// Static configuration of one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Routing keys this worker claims.
    pub routing_keys: Vec<RoutingKey>,
    /// Core/memory budget passed to the executor.
    pub budget: ExecutionBudget,
    /// Long-poll duration per claim attempt.
    pub claim_wait: Duration,
    /// Expected task duration; the visibility timeout is twice this.
    pub expected_duration: Duration,
}

impl WorkerConfig {
    /// A single-routing-key config with defaults.
    #[must_use]
    pub fn for_routing_key(routing_key: RoutingKey) -> Self {
        Self {
            routing_keys: vec![routing_key],
            budget: ExecutionBudget::default(),
            claim_wait: Duration::from_millis(500),
            expected_duration: Duration::from_secs(60),
        }
    }

    /// Overrides the execution budget.
    #[must_use]
    pub fn with_budget(mut self, budget: ExecutionBudget) -> Self {
        self.budget = budget;
        self
    }

    /// The visibility timeout used when claiming.
    #[must_use]
    pub fn visibility(&self) -> Duration {
        self.expected_duration * 2
    }
}

/// A single-tenant worker process.
pub struct Worker {
    id: WorkerId,
    config: WorkerConfig,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<CacheManager>,
    store: StateStore,
    executors: ExecutorSet,
    cancellations: Arc<CancellationRegistry>,
    completions: mpsc::Sender<TaskCompletion>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<CacheManager>,
        store: StateStore,
        executors: ExecutorSet,
        cancellations: Arc<CancellationRegistry>,
        completions: mpsc::Sender<TaskCompletion>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: WorkerId::generate(),
            config,
            queue,
            cache,
            store,
            executors,
            cancellations,
            completions,
            shutdown,
        }
    }

    /// Returns this worker's id.
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Runs the claim loop until shutdown is signalled.
    ///
    /// In-flight work finishes before the loop exits; the supervisor
    /// bounds the wait with its grace period.
    pub async fn run(self) {
        tracing::info!(
            worker_id = %self.id,
            routing_keys = ?self.config.routing_keys,
            n_cores = self.config.budget.n_cores,
            "worker started"
        );

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = tokio::select! {
                claimed = self.queue.claim(
                    &self.config.routing_keys,
                    self.config.visibility(),
                    self.config.claim_wait,
                ) => claimed,
                _ = shutdown.changed() => continue,
            };

            match claimed {
                Ok(Some(delivery)) => {
                    let span = bespoke_core::observability::worker_span(
                        delivery.item.routing_key.as_str(),
                        &delivery.item.task_id.to_string(),
                        delivery.item.attempt,
                    );
                    if let Err(error) = self.process(delivery).instrument(span).await {
                        tracing::error!(worker_id = %self.id, %error, "task processing failed");
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(worker_id = %self.id, %error, "claim failed; backing off");
                    tokio::time::sleep(self.config.claim_wait).await;
                }
            }
        }

        tracing::info!(worker_id = %self.id, "worker drained");
    }

    async fn process(&self, delivery: Delivery) -> Result<()> {
        let task_id = delivery.item.task_id;

        let task = match self.store.load_task(task_id).await {
            Ok(task) => task,
            Err(error) => {
                // Record gone (e.g. purged store); drop the orphan item.
                tracing::warn!(%task_id, %error, "claimed item has no task record");
                return self.queue.ack(&delivery.tag).await;
            }
        };
        let fingerprint = task.fingerprint.clone();

        if self.cancellations.is_cancelled(&task_id) {
            self.cache.release(&fingerprint, &task_id).await?;
            self.queue.nack(&delivery.tag, false).await?;
            self.send_completion(task.submission_id, task_id, CompletionOutcome::Cancelled)
                .await;
            return Ok(());
        }

        // Keep the lease and the queue item alive while the executor runs.
        let heartbeat = {
            let cache = Arc::clone(&self.cache);
            let queue = Arc::clone(&self.queue);
            let tag = delivery.tag.clone();
            let fingerprint = fingerprint.clone();
            let visibility = self.config.visibility();
            let interval = self.cache.heartbeat_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(error) = cache.heartbeat(&fingerprint, &task_id).await {
                        tracing::warn!(%task_id, %error, "lease heartbeat failed; stopping");
                        break;
                    }
                    if let Err(error) = queue.extend_visibility(&tag, visibility).await {
                        tracing::warn!(%task_id, %error, "visibility extension failed");
                        break;
                    }
                }
            })
        };

        let executor = self.executors.for_routing_key(task.routing_key);
        let token = self.cancellations.token(task_id);
        let outcome = executor
            .execute(&task.input, &self.config.budget, &token)
            .await;
        heartbeat.abort();

        match outcome {
            Ok(ExecutorOutcome::Success(output)) => {
                if self.cancellations.is_cancelled(&task_id) {
                    // Cancelled while executing: the result is discarded,
                    // the fingerprint stays cacheable for future work.
                    self.cache.release(&fingerprint, &task_id).await?;
                    self.queue.nack(&delivery.tag, false).await?;
                    self.send_completion(task.submission_id, task_id, CompletionOutcome::Cancelled)
                        .await;
                    return Ok(());
                }

                let published = self
                    .cache
                    .publish(&fingerprint, &task_id, output, self.id)
                    .await?;
                self.queue.ack(&delivery.tag).await?;

                let outcome = if published {
                    CompletionOutcome::Succeeded
                } else {
                    CompletionOutcome::Failed(TaskFailure::new(
                        TaskErrorKind::Timeout,
                        "lease expired before the result could be published",
                    ))
                };
                self.send_completion(task.submission_id, task_id, outcome)
                    .await;
            }
            Ok(ExecutorOutcome::Failure { message }) => {
                // Reported failure: recorded off the cache path so the
                // fingerprint stays computable on retry.
                self.cache.release(&fingerprint, &task_id).await?;
                self.queue.ack(&delivery.tag).await?;
                self.send_completion(
                    task.submission_id,
                    task_id,
                    CompletionOutcome::Failed(TaskFailure::new(
                        TaskErrorKind::ExecutorError,
                        message,
                    )),
                )
                .await;
            }
            Ok(ExecutorOutcome::Cancelled) => {
                self.cache.release(&fingerprint, &task_id).await?;
                self.queue.nack(&delivery.tag, false).await?;
                self.send_completion(task.submission_id, task_id, CompletionOutcome::Cancelled)
                    .await;
            }
            Err(error) => {
                // Transient failure: redelivery retries it; past the
                // budget the dead-letter sweep fails the task.
                tracing::warn!(%task_id, %error, "transient executor failure; requeueing");
                self.cache.release(&fingerprint, &task_id).await?;
                self.queue.nack(&delivery.tag, true).await?;
            }
        }

        Ok(())
    }

    async fn send_completion(
        &self,
        submission_id: SubmissionId,
        task_id: TaskId,
        outcome: CompletionOutcome,
    ) {
        let completion = TaskCompletion {
            submission_id,
            task_id,
            outcome,
        };
        if self.completions.send(completion).await.is_err() {
            tracing::warn!(%task_id, "completion channel closed; coordinator is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_is_twice_expected_duration() {
        let config = WorkerConfig::for_routing_key(RoutingKey::Qc);
        assert_eq!(config.visibility(), config.expected_duration * 2);
    }

    #[test]
    fn config_builder_sets_budget() {
        let config = WorkerConfig::for_routing_key(RoutingKey::Qc).with_budget(ExecutionBudget {
            n_cores: 8,
            max_memory_gib_per_core: Some(4.0),
        });
        assert_eq!(config.budget.n_cores, 8);
    }
}
