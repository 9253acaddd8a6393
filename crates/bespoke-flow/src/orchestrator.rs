//! Per-submission stage orchestration.
//!
//! One orchestrator exists per submission and is the only mutator of its
//! stage and task records. It reacts to three event kinds: *advance*
//! (after a task completes), *cancel*, and *restart* (at boot for
//! non-terminal submissions). All transitions for one submission are
//! serialized by the coordinator holding the orchestrator behind a mutex.
//!
//! The advance protocol:
//!
//! 1. Find the earliest non-terminal stage.
//! 2. Materialize its task records from the workflow document if it has
//!    none (QC fan-out comes from the fragmentation output; the
//!    optimization input gathers the QC records).
//! 3. For each pending task, consult the cache: hit resolves the task as
//!    `cached`; a granted lease enqueues it; a lease held elsewhere parks
//!    the task until the owner publishes or releases.
//! 4. Once every task is terminal, apply the stage acceptance rule and
//!    either continue with the next stage or fail the submission.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;

use bespoke_core::{SubmissionId, TaskId};

use crate::cache::{AcquireOutcome, CacheManager};
use crate::documents::{
    CalculationKind, FragmentationInput, OptimizationInput, QcOutput, QcTaskInput, StageInput,
    StageOutput,
};
use crate::error::{Error, Result};
use crate::executor::CancellationRegistry;
use crate::fingerprint::{self, Fingerprint};
use crate::queue::{QueueItem, TaskQueue};
use crate::stage::{evaluate_acceptance, StageKind, StageRecord, StageState, StageVerdict};
use crate::store::StateStore;
use crate::submission::{Submission, SubmissionStatus};
use crate::task::{RoutingKey, TaskErrorKind, TaskFailure, TaskRecord, TaskState};
use crate::worker::CompletionOutcome;

/// The per-submission state machine.
pub struct Orchestrator {
    submission: Submission,
    stages: Vec<StageRecord>,
    tasks: HashMap<TaskId, TaskRecord>,
    /// Tasks currently parked on another owner's lease (waiter spawned).
    parked: HashSet<TaskId>,
    store: StateStore,
    cache: Arc<CacheManager>,
    queue: Arc<dyn TaskQueue>,
    cancellations: Arc<CancellationRegistry>,
    /// Wakeup channel back to the coordinator's event loop, used by
    /// lease-wait subscriptions.
    wakeups: mpsc::Sender<SubmissionId>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("submission_id", &self.submission.id)
            .field("status", &self.submission.status)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator for a freshly persisted submission.
    #[must_use]
    pub fn new(
        submission: Submission,
        stages: Vec<StageRecord>,
        store: StateStore,
        cache: Arc<CacheManager>,
        queue: Arc<dyn TaskQueue>,
        cancellations: Arc<CancellationRegistry>,
        wakeups: mpsc::Sender<SubmissionId>,
    ) -> Self {
        Self {
            submission,
            stages,
            tasks: HashMap::new(),
            parked: HashSet::new(),
            store,
            cache,
            queue,
            cancellations,
            wakeups,
        }
    }

    /// Restores an orchestrator from persisted state at boot.
    ///
    /// # Errors
    ///
    /// Returns a storage error if task records cannot be loaded.
    pub async fn restore(
        submission: Submission,
        stages: Vec<StageRecord>,
        store: StateStore,
        cache: Arc<CacheManager>,
        queue: Arc<dyn TaskQueue>,
        cancellations: Arc<CancellationRegistry>,
        wakeups: mpsc::Sender<SubmissionId>,
    ) -> Result<Self> {
        let mut tasks = HashMap::new();
        for stage in &stages {
            for task_id in &stage.task_ids {
                let task = store.load_task(*task_id).await?;
                tasks.insert(*task_id, task);
            }
        }
        Ok(Self {
            submission,
            stages,
            tasks,
            parked: HashSet::new(),
            store,
            cache,
            queue,
            cancellations,
            wakeups,
        })
    }

    /// Returns the submission id this orchestrator owns.
    #[must_use]
    pub const fn submission_id(&self) -> SubmissionId {
        self.submission.id
    }

    /// Returns the current aggregate status.
    #[must_use]
    pub const fn status(&self) -> SubmissionStatus {
        self.submission.status
    }

    /// Normalizes state after a restart, then advances.
    ///
    /// Tasks that were in flight when the process died are re-resolved:
    /// a published fingerprint resolves them as `cached`; anything else
    /// returns to `pending` and re-runs the cache consultation (the lease
    /// and the persisted queue item handle the task that is genuinely
    /// still executing elsewhere).
    ///
    /// # Errors
    ///
    /// Returns storage errors from the write-through persistence.
    pub async fn restart(&mut self) -> Result<()> {
        let in_flight: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::InFlight)
            .map(|t| t.id)
            .collect();

        for task_id in in_flight {
            let fingerprint = match self.tasks.get(&task_id) {
                Some(task) => task.fingerprint.clone(),
                None => continue,
            };
            let resolved = self.cache.lookup(&fingerprint).await?.is_some();
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if resolved {
                    task.resolve_cached()?;
                } else {
                    task.transition_to(TaskState::Pending)?;
                }
                self.store.save_task(task).await?;
            }
        }

        self.advance().await
    }

    /// Applies a worker completion to the owning task record, then
    /// advances the state machine.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the write-through persistence.
    pub async fn on_completion(
        &mut self,
        task_id: TaskId,
        outcome: CompletionOutcome,
    ) -> Result<()> {
        let cancelled = self.submission.status == SubmissionStatus::Cancelled;
        let Some(task) = self.tasks.get_mut(&task_id) else {
            tracing::warn!(%task_id, "completion for unknown task ignored");
            return Ok(());
        };
        if task.is_terminal() {
            // Late or duplicate completion; the record already settled.
            return Ok(());
        }

        if cancelled {
            // Results of cancelled submissions are discarded on return.
            task.fail(TaskFailure::new(TaskErrorKind::Cancelled, "submission cancelled"))?;
            self.cancellations.acknowledge(&task_id);
            let task = task.clone();
            self.store.save_task(&task).await?;
            return Ok(());
        }

        match outcome {
            CompletionOutcome::Succeeded => {
                task.succeed()?;
            }
            CompletionOutcome::Failed(failure) => {
                let retryable = task.routing_key == RoutingKey::Qc
                    && failure.kind == TaskErrorKind::ExecutorError;
                if retryable && task.has_retry_budget() {
                    tracing::info!(
                        %task_id,
                        attempt = task.attempt,
                        "qc task failed; retrying within budget"
                    );
                    task.retry(failure)?;
                } else {
                    task.fail(failure)?;
                }
            }
            CompletionOutcome::Cancelled => {
                task.fail(TaskFailure::new(TaskErrorKind::Cancelled, "task cancelled"))?;
                self.cancellations.acknowledge(&task_id);
            }
        }

        let task = task.clone();
        self.store.save_task(&task).await?;
        self.advance().await
    }

    /// Cooperatively cancels the submission.
    ///
    /// Returns `false` when the submission was already terminal (the
    /// operation is an idempotent no-op in that case).
    ///
    /// # Errors
    ///
    /// Returns storage errors from the write-through persistence.
    pub async fn cancel(&mut self) -> Result<bool> {
        if self.submission.status.is_terminal() {
            return Ok(false);
        }

        self.submission.apply_status(SubmissionStatus::Cancelled)?;
        self.store.save_submission(&self.submission).await?;

        // Flag in-flight work first so workers observe cancellation while
        // the records are being settled.
        for task in self.tasks.values() {
            if task.state == TaskState::InFlight {
                self.cancellations.cancel(task.id);
            }
        }

        let pending: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.id)
            .collect();
        for task_id in pending {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.fail(TaskFailure::new(TaskErrorKind::Cancelled, "submission cancelled"))?;
                let task = task.clone();
                self.store.save_task(&task).await?;
            }
        }

        for ordinal in 0..self.stages.len() {
            let stage = &mut self.stages[ordinal];
            match stage.state {
                StageState::Pending => {
                    stage.transition_to(StageState::Skipped)?;
                }
                StageState::Running => {
                    stage.error = Some("cancelled".to_string());
                    stage.transition_to(StageState::Errored)?;
                }
                _ => continue,
            }
            let stage = stage.clone();
            self.store.save_stage(self.submission.id, ordinal, &stage).await?;
        }

        tracing::info!(submission_id = %self.submission.id, "submission cancelled");
        Ok(true)
    }

    /// Drives the state machine as far as it can go without waiting.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the write-through persistence.
    pub async fn advance(&mut self) -> Result<()> {
        if self.submission.status.is_terminal() {
            return Ok(());
        }

        loop {
            let Some(ordinal) = self.stages.iter().position(|s| !s.is_terminal()) else {
                self.submission.apply_status(SubmissionStatus::Success)?;
                self.store.save_submission(&self.submission).await?;
                tracing::info!(submission_id = %self.submission.id, "submission succeeded");
                return Ok(());
            };

            if self.stages[ordinal].state == StageState::Pending {
                if let Err(error) = self.enter_stage(ordinal).await {
                    // Materialization failure is a stage failure, not a
                    // process failure.
                    self.fail_stage(ordinal, format!("failed to materialize tasks: {error}"))
                        .await?;
                    return Ok(());
                }
            }

            self.dispatch_pending(ordinal).await?;

            let stage = &self.stages[ordinal];
            let tasks: Vec<&TaskRecord> = stage
                .task_ids
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .collect();
            match evaluate_acceptance(
                stage.kind,
                self.submission.workflow.qc_failure_tolerance,
                &tasks,
            ) {
                StageVerdict::Incomplete => return Ok(()),
                StageVerdict::Accepted => {
                    self.complete_stage(ordinal).await?;
                    // Fall through: the next iteration enters stage k+1.
                }
                StageVerdict::Rejected { reason } => {
                    self.fail_stage(ordinal, reason).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Materializes task records for a stage and marks it running.
    async fn enter_stage(&mut self, ordinal: usize) -> Result<()> {
        let kind = self.stages[ordinal].kind;
        let decimals = self.submission.workflow.fingerprint_decimals;
        let workflow = &self.submission.workflow;

        let specs: Vec<(Fingerprint, StageInput, u32)> = match kind {
            StageKind::Fragmentation => {
                let input = FragmentationInput {
                    smiles: workflow.smiles.clone(),
                    fragmenter: workflow.fragmenter.clone(),
                };
                let fingerprint = fingerprint::fragmentation_fingerprint(
                    &input.smiles,
                    &input.fragmenter,
                    decimals,
                )?;
                vec![(fingerprint, StageInput::Fragmentation(input), 1)]
            }
            StageKind::QcGeneration => {
                let fragments = self.stages[ordinal - 1]
                    .output
                    .as_ref()
                    .and_then(StageOutput::as_fragmentation)
                    .ok_or_else(|| {
                        Error::internal("qc-generation entered without a fragmentation output")
                    })?
                    .fragments
                    .clone();

                let mut seen = HashSet::new();
                let mut specs = Vec::new();
                for target in &workflow.targets {
                    for fragment in &fragments {
                        let input = QcTaskInput {
                            fragment: fragment.clone(),
                            qc_spec: target.qc_spec().clone(),
                            calculation: CalculationKind::Torsion1d,
                        };
                        let fingerprint = fingerprint::qc_fingerprint(&input, decimals)?;
                        // Two targets sharing a level of theory collapse
                        // to one computation.
                        if seen.insert(fingerprint.clone()) {
                            specs.push((
                                fingerprint,
                                StageInput::QcCompute(input),
                                workflow.qc_max_retries + 1,
                            ));
                        }
                    }
                }
                specs
            }
            StageKind::Optimization => {
                let qc_results = self.collect_qc_outputs(ordinal - 1).await?;
                let qc_fingerprints: Vec<Fingerprint> = qc_results
                    .iter()
                    .map(|r| fingerprint::qc_fingerprint(&r.input, decimals))
                    .collect::<Result<_>>()?;
                let fingerprint =
                    fingerprint::optimization_fingerprint(workflow, &qc_fingerprints)?;
                let input = OptimizationInput {
                    initial_force_field: workflow.initial_force_field.clone(),
                    optimizer: workflow.optimizer.clone(),
                    targets: serde_json::to_value(&workflow.targets)
                        .map_err(bespoke_core::Error::from)?,
                    qc_results,
                };
                vec![(fingerprint, StageInput::Optimization(Box::new(input)), 1)]
            }
        };

        let routing_key = kind.routing_key();
        let mut task_ids = Vec::with_capacity(specs.len());
        for (fingerprint, input, max_attempts) in specs {
            let task = TaskRecord::new(
                self.submission.id,
                ordinal,
                fingerprint,
                routing_key,
                input,
                max_attempts,
            );
            task_ids.push(task.id);
            self.store.save_task(&task).await?;
            self.tasks.insert(task.id, task);
        }

        let stage = &mut self.stages[ordinal];
        stage.task_ids = task_ids;
        stage.transition_to(StageState::Running)?;
        let stage = stage.clone();
        self.store.save_stage(self.submission.id, ordinal, &stage).await?;

        if self.submission.status == SubmissionStatus::Waiting {
            self.submission.apply_status(SubmissionStatus::Running)?;
            self.store.save_submission(&self.submission).await?;
        }

        tracing::info!(
            submission_id = %self.submission.id,
            stage = %kind,
            n_tasks = stage.task_ids.len(),
            "stage entered"
        );
        Ok(())
    }

    /// Runs the cache consultation for every pending task of a stage.
    async fn dispatch_pending(&mut self, ordinal: usize) -> Result<()> {
        let pending: Vec<TaskId> = self.stages[ordinal]
            .task_ids
            .iter()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| t.state == TaskState::Pending)
            })
            .copied()
            .collect();

        for task_id in pending {
            self.consult_cache(task_id).await?;
        }
        Ok(())
    }

    /// Cache consultation for one task: hit, acquire, or park.
    async fn consult_cache(&mut self, task_id: TaskId) -> Result<()> {
        let (fingerprint, routing_key) = match self.tasks.get(&task_id) {
            Some(task) => (task.fingerprint.clone(), task.routing_key),
            None => return Ok(()),
        };

        if self.cache.lookup(&fingerprint).await?.is_some() {
            self.resolve_cached(task_id).await?;
            return Ok(());
        }

        match self.cache.acquire(&fingerprint, &task_id).await? {
            AcquireOutcome::Hit(_) => {
                self.resolve_cached(task_id).await?;
            }
            AcquireOutcome::Granted => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.transition_to(TaskState::InFlight)?;
                    let task = task.clone();
                    self.store.save_task(&task).await?;
                }
                self.parked.remove(&task_id);
                if let Err(error) = self
                    .queue
                    .enqueue(QueueItem::new(task_id, routing_key))
                    .await
                {
                    tracing::error!(%task_id, %error, "enqueue failed; failing task");
                    self.cache.release(&fingerprint, &task_id).await?;
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.fail(TaskFailure::new(
                            TaskErrorKind::QueueUnavailable,
                            error.to_string(),
                        ))?;
                        let task = task.clone();
                        self.store.save_task(&task).await?;
                    }
                }
            }
            AcquireOutcome::HeldBy { owner } => {
                if owner == task_id.to_string() {
                    // Our own lease survived a restart; the persisted
                    // queue item redelivers the work.
                    if let Some(task) = self.tasks.get_mut(&task_id) {
                        task.transition_to(TaskState::InFlight)?;
                        let task = task.clone();
                        self.store.save_task(&task).await?;
                    }
                } else if self.parked.insert(task_id) {
                    self.spawn_lease_waiter(fingerprint);
                }
            }
        }
        Ok(())
    }

    /// Parks a waiter on another owner's lease. The waiter re-checks the
    /// store on every wake (the notification is a hint, not the truth)
    /// and nudges the coordinator to re-advance once the fingerprint
    /// resolves or the lease disappears.
    fn spawn_lease_waiter(&self, fingerprint: Fingerprint) {
        let cache = Arc::clone(&self.cache);
        let wakeups = self.wakeups.clone();
        let submission_id = self.submission.id;
        let poll = cache.heartbeat_interval().min(std::time::Duration::from_secs(1));

        tokio::spawn(async move {
            loop {
                let notify = cache.subscribe(&fingerprint);
                match cache.lookup(&fingerprint).await {
                    Ok(Some(_)) => break,
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(%fingerprint, %error, "lease waiter lookup failed");
                        break;
                    }
                }
                let _ = tokio::time::timeout(poll, notify.notified()).await;
            }
            let _ = wakeups.send(submission_id).await;
        });
    }

    async fn resolve_cached(&mut self, task_id: TaskId) -> Result<()> {
        self.parked.remove(&task_id);
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.resolve_cached()?;
            let task = task.clone();
            self.store.save_task(&task).await?;
            tracing::debug!(%task_id, "task resolved from cache");
        }
        Ok(())
    }

    /// Gathers the QC outputs of a completed qc-generation stage from the
    /// cache, in task order.
    async fn collect_qc_outputs(&self, ordinal: usize) -> Result<Vec<QcOutput>> {
        let stage = &self.stages[ordinal];
        let mut outputs = Vec::new();
        for task_id in &stage.task_ids {
            let Some(task) = self.tasks.get(task_id) else {
                continue;
            };
            if !matches!(task.state, TaskState::Succeeded | TaskState::Cached) {
                continue;
            }
            let entry = self.cache.lookup(&task.fingerprint).await?.ok_or_else(|| {
                Error::internal(format!(
                    "cache entry missing for settled task {task_id} ({})",
                    task.fingerprint
                ))
            })?;
            if let Some(qc) = entry.output.as_qc() {
                outputs.push(qc.clone());
            }
        }
        Ok(outputs)
    }

    /// Builds the stage output document and marks the stage successful.
    async fn complete_stage(&mut self, ordinal: usize) -> Result<()> {
        let kind = self.stages[ordinal].kind;
        let output = match kind {
            StageKind::Fragmentation | StageKind::Optimization => {
                let task_id = self.stages[ordinal]
                    .task_ids
                    .first()
                    .ok_or_else(|| Error::internal("accepted stage has no tasks"))?;
                let task = self
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| Error::TaskNotFound { id: *task_id })?;
                let entry = self.cache.lookup(&task.fingerprint).await?.ok_or_else(|| {
                    Error::internal(format!(
                        "cache entry missing for settled task {task_id} ({})",
                        task.fingerprint
                    ))
                })?;
                entry.output
            }
            StageKind::QcGeneration => {
                StageOutput::QcGeneration(self.collect_qc_outputs(ordinal).await?)
            }
        };

        let stage = &mut self.stages[ordinal];
        stage.output = Some(output);
        stage.transition_to(StageState::Success)?;
        let stage = stage.clone();
        self.store.save_stage(self.submission.id, ordinal, &stage).await?;

        tracing::info!(
            submission_id = %self.submission.id,
            stage = %kind,
            "stage succeeded"
        );
        Ok(())
    }

    /// Fails a stage, skips everything after it, and errors the
    /// submission.
    async fn fail_stage(&mut self, ordinal: usize, reason: String) -> Result<()> {
        tracing::warn!(
            submission_id = %self.submission.id,
            stage = %self.stages[ordinal].kind,
            %reason,
            "stage failed"
        );

        {
            let stage = &mut self.stages[ordinal];
            stage.error = Some(reason);
            if stage.state == StageState::Pending {
                stage.transition_to(StageState::Running)?;
            }
            stage.transition_to(StageState::Errored)?;
            let stage = stage.clone();
            self.store.save_stage(self.submission.id, ordinal, &stage).await?;
        }

        for later in (ordinal + 1)..self.stages.len() {
            let stage = &mut self.stages[later];
            if !stage.is_terminal() {
                stage.transition_to(StageState::Skipped)?;
                let stage = stage.clone();
                self.store.save_stage(self.submission.id, later, &stage).await?;
            }
        }

        self.submission.apply_status(SubmissionStatus::Errored)?;
        self.store.save_submission(&self.submission).await?;
        Ok(())
    }

    /// Read access for assembling status responses.
    #[must_use]
    pub fn snapshot(&self) -> (&Submission, &[StageRecord], &HashMap<TaskId, TaskRecord>) {
        (&self.submission, &self.stages, &self.tasks)
    }
}
