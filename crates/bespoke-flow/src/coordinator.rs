//! Coordinator core: submission intake, status assembly, cancellation,
//! recovery, and the completion event loop.
//!
//! The coordinator owns the store, queue, cache, cancellation registry,
//! and one orchestrator per live submission. Orchestrators sit behind a
//! mutex so all state transitions for one submission are serialized while
//! many submissions advance concurrently.
//!
//! Durability contract: `submit` persists the submission and its stage
//! records *before* returning ids, so a crash after the write is a client
//! timeout, not a lost submission. `resume` re-creates orchestrators for
//! every non-terminal submission found at boot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};

use bespoke_core::{SubmissionId, TaskId};

use crate::cache::CacheManager;
use crate::documents::{OptimizationOutput, StageOutput};
use crate::error::{Error, Result};
use crate::executor::CancellationRegistry;
use crate::orchestrator::Orchestrator;
use crate::queue::TaskQueue;
use crate::stage::{StageKind, StageRecord, StageState};
use crate::store::StateStore;
use crate::submission::{Submission, SubmissionStatus};
use crate::task::{TaskErrorKind, TaskFailure, TaskRecord, TaskState};
use crate::worker::{CompletionOutcome, TaskCompletion};
use crate::workflow::BespokeWorkflow;

/// How often the dead-letter shelf is swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Buffered capacity of the completion and wakeup channels.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The submission transitioned to `cancelled`.
    Cancelled,
    /// The submission was already terminal; the request was a no-op.
    AlreadyTerminal,
}

/// Assembled task view for status responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    /// Task id.
    pub id: TaskId,
    /// The cache key.
    pub fingerprint: String,
    /// Task state.
    pub status: TaskState,
    /// Attempt count.
    pub attempt: u32,
    /// The last failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

/// Assembled stage view for status responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDetail {
    /// Stage name (`fragmentation`, `qc-generation`, `optimization`).
    pub name: StageKind,
    /// Stage state.
    pub status: StageState,
    /// Task views, in materialization order.
    pub tasks: Vec<TaskDetail>,
    /// Stage output document, when successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StageOutput>,
    /// Stage error document, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Assembled submission view for status responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionDetail {
    /// Submission id.
    pub id: SubmissionId,
    /// Aggregate status.
    pub status: SubmissionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Stage views in declared order.
    pub stages: Vec<StageDetail>,
    /// The final optimization result, when the submission succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OptimizationOutput>,
}

/// One page of the submission listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionPage {
    /// Submissions on this page, in id order.
    pub items: Vec<SubmissionSummary>,
    /// Cursor to pass for the next page, when more remain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<u64>,
}

/// Summary row of the submission listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSummary {
    /// Submission id.
    pub id: SubmissionId,
    /// Aggregate status.
    pub status: SubmissionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Receiver ends of the coordinator's event channels, consumed by
/// [`Coordinator::run_event_loop`].
pub struct EventStreams {
    completions: mpsc::Receiver<TaskCompletion>,
    wakeups: mpsc::Receiver<SubmissionId>,
}

/// The coordinator service core.
pub struct Coordinator {
    store: StateStore,
    cache: Arc<CacheManager>,
    queue: Arc<dyn TaskQueue>,
    cancellations: Arc<CancellationRegistry>,
    orchestrators: Mutex<HashMap<SubmissionId, Arc<Mutex<Orchestrator>>>>,
    completions_tx: mpsc::Sender<TaskCompletion>,
    wakeups_tx: mpsc::Sender<SubmissionId>,
    accepting: AtomicBool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates a coordinator and the event streams its loop consumes.
    #[must_use]
    pub fn new(
        store: StateStore,
        cache: Arc<CacheManager>,
        queue: Arc<dyn TaskQueue>,
        cancellations: Arc<CancellationRegistry>,
    ) -> (Arc<Self>, EventStreams) {
        let (completions_tx, completions) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (wakeups_tx, wakeups) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let coordinator = Arc::new(Self {
            store,
            cache,
            queue,
            cancellations,
            orchestrators: Mutex::new(HashMap::new()),
            completions_tx,
            wakeups_tx,
            accepting: AtomicBool::new(true),
        });
        (coordinator, EventStreams { completions, wakeups })
    }

    /// The sender workers report completions through.
    #[must_use]
    pub fn completion_sender(&self) -> mpsc::Sender<TaskCompletion> {
        self.completions_tx.clone()
    }

    /// Stops accepting new submissions (shutdown drain).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Validates and persists workflows, creating one submission each.
    ///
    /// Every document is validated before any is persisted: a request
    /// with one invalid workflow allocates no ids at all.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidWorkflow` on validation failure and storage
    /// errors from persistence.
    pub async fn submit(&self, workflows: Vec<BespokeWorkflow>) -> Result<Vec<SubmissionId>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::internal("coordinator is shutting down"));
        }
        if workflows.is_empty() {
            return Err(Error::invalid_workflow(vec![
                "at least one workflow is required".to_string(),
            ]));
        }
        for workflow in &workflows {
            workflow.validate()?;
        }

        let mut ids = Vec::with_capacity(workflows.len());
        for workflow in workflows {
            let id = self.store.allocate_submission_id().await?;
            let submission = Submission::new(id, workflow);
            let stages = Submission::materialize_stages();

            // Persist before responding: a crash after this point resumes
            // the submission instead of losing it.
            self.store.save_submission(&submission).await?;
            for (ordinal, stage) in stages.iter().enumerate() {
                self.store.save_stage(id, ordinal, stage).await?;
            }

            let orchestrator = Orchestrator::new(
                submission,
                stages,
                self.store.clone(),
                Arc::clone(&self.cache),
                Arc::clone(&self.queue),
                Arc::clone(&self.cancellations),
                self.wakeups_tx.clone(),
            );
            self.orchestrators
                .lock()
                .await
                .insert(id, Arc::new(Mutex::new(orchestrator)));

            // Nudge the event loop to run the first advance.
            let _ = self.wakeups_tx.send(id).await;

            tracing::info!(submission_id = %id, "submission accepted");
            ids.push(id);
        }
        Ok(ids)
    }

    /// Assembles the full state document for one submission.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubmissionNotFound` for unknown ids.
    pub async fn get_detail(&self, id: SubmissionId) -> Result<SubmissionDetail> {
        if let Some(orchestrator) = self.orchestrator(id).await {
            let orchestrator = orchestrator.lock().await;
            let (submission, stages, tasks) = orchestrator.snapshot();
            return Ok(Self::assemble(submission, stages, |task_id| {
                tasks.get(task_id).cloned()
            }));
        }

        // Not live (terminal before this process started): read the
        // persisted records.
        let submission = self.store.load_submission(id).await?;
        let stages = self.store.load_stages(id).await?;
        let mut tasks = HashMap::new();
        for stage in &stages {
            for task_id in &stage.task_ids {
                if let Ok(task) = self.store.load_task(*task_id).await {
                    tasks.insert(*task_id, task);
                }
            }
        }
        Ok(Self::assemble(&submission, &stages, |task_id| {
            tasks.get(task_id).cloned()
        }))
    }

    fn assemble(
        submission: &Submission,
        stages: &[StageRecord],
        task_lookup: impl Fn(&TaskId) -> Option<TaskRecord>,
    ) -> SubmissionDetail {
        let stage_details: Vec<StageDetail> = stages
            .iter()
            .map(|stage| StageDetail {
                name: stage.kind,
                status: stage.state,
                tasks: stage
                    .task_ids
                    .iter()
                    .filter_map(|id| task_lookup(id))
                    .map(|task| TaskDetail {
                        id: task.id,
                        fingerprint: task.fingerprint.to_string(),
                        status: task.state,
                        attempt: task.attempt,
                        error: task.error,
                    })
                    .collect(),
                result: stage.output.clone(),
                error: stage.error.clone(),
            })
            .collect();

        let result = stages
            .iter()
            .find(|s| s.kind == StageKind::Optimization)
            .and_then(|s| s.output.as_ref())
            .and_then(StageOutput::as_optimization)
            .cloned();

        SubmissionDetail {
            id: submission.id,
            status: submission.status,
            created_at: submission.created_at,
            stages: stage_details,
            result,
        }
    }

    /// Lists submissions with optional status filter and cursor paging.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the scan.
    pub async fn list(
        &self,
        status: Option<SubmissionStatus>,
        cursor: Option<u64>,
        limit: usize,
    ) -> Result<SubmissionPage> {
        let (submissions, next) = self.store.list_submissions(status, cursor, limit).await?;
        Ok(SubmissionPage {
            items: submissions
                .into_iter()
                .map(|s| SubmissionSummary {
                    id: s.id,
                    status: s.status,
                    created_at: s.created_at,
                })
                .collect(),
            next,
        })
    }

    /// Cooperatively cancels a submission. Idempotent: repeating the call
    /// on a terminal submission reports `AlreadyTerminal`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubmissionNotFound` for unknown ids.
    pub async fn cancel(&self, id: SubmissionId) -> Result<CancelOutcome> {
        if let Some(orchestrator) = self.orchestrator(id).await {
            let mut orchestrator = orchestrator.lock().await;
            return if orchestrator.cancel().await? {
                Ok(CancelOutcome::Cancelled)
            } else {
                Ok(CancelOutcome::AlreadyTerminal)
            };
        }

        // No live orchestrator: the submission is either unknown or
        // already settled in the store.
        let submission = self.store.load_submission(id).await?;
        if submission.status.is_terminal() {
            Ok(CancelOutcome::AlreadyTerminal)
        } else {
            Err(Error::internal(format!(
                "submission {id} has no orchestrator but is not terminal"
            )))
        }
    }

    /// Re-creates orchestrators for non-terminal submissions at boot and
    /// restarts them. Returns how many submissions resumed.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the recovery scan.
    pub async fn resume(&self) -> Result<usize> {
        let submissions = self.store.non_terminal_submissions().await?;
        let mut resumed = 0;

        for submission in submissions {
            let id = submission.id;
            let stages = self.store.load_stages(id).await?;
            let orchestrator = Orchestrator::restore(
                submission,
                stages,
                self.store.clone(),
                Arc::clone(&self.cache),
                Arc::clone(&self.queue),
                Arc::clone(&self.cancellations),
                self.wakeups_tx.clone(),
            )
            .await?;

            let orchestrator = Arc::new(Mutex::new(orchestrator));
            self.orchestrators
                .lock()
                .await
                .insert(id, Arc::clone(&orchestrator));

            let restart_result = orchestrator.lock().await.restart().await;
            if let Err(error) = restart_result {
                tracing::error!(submission_id = %id, %error, "restart failed");
            } else {
                resumed += 1;
                tracing::info!(submission_id = %id, "submission resumed");
            }
        }
        Ok(resumed)
    }

    /// Consumes completion and wakeup events until shutdown.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut streams: EventStreams,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(completion) = streams.completions.recv() => {
                    self.handle_completion(completion).await;
                }
                Some(id) = streams.wakeups.recv() => {
                    self.handle_advance(id).await;
                }
                _ = sweep.tick() => {
                    self.sweep_dead_letters().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("coordinator event loop stopped");
    }

    async fn handle_completion(&self, completion: TaskCompletion) {
        let Some(orchestrator) = self.orchestrator(completion.submission_id).await else {
            tracing::warn!(
                submission_id = %completion.submission_id,
                task_id = %completion.task_id,
                "completion for unknown submission dropped"
            );
            return;
        };

        let mut orchestrator = orchestrator.lock().await;
        if let Err(error) = orchestrator
            .on_completion(completion.task_id, completion.outcome)
            .await
        {
            tracing::error!(
                submission_id = %completion.submission_id,
                task_id = %completion.task_id,
                %error,
                "completion handling failed"
            );
        }
    }

    async fn handle_advance(&self, id: SubmissionId) {
        let Some(orchestrator) = self.orchestrator(id).await else {
            return;
        };
        let mut orchestrator = orchestrator.lock().await;
        if let Err(error) = orchestrator.advance().await {
            tracing::error!(submission_id = %id, %error, "advance failed");
        }
    }

    /// Fails tasks whose queue items exhausted their redelivery budget.
    async fn sweep_dead_letters(&self) {
        let dead = match self.queue.drain_dead_letters().await {
            Ok(dead) => dead,
            Err(error) => {
                tracing::warn!(%error, "dead-letter sweep failed");
                return;
            }
        };

        for item in dead {
            let submission_id = match self.store.load_task(item.task_id).await {
                Ok(task) => task.submission_id,
                Err(error) => {
                    tracing::warn!(task_id = %item.task_id, %error, "dead letter has no task");
                    continue;
                }
            };

            let failure = TaskFailure::new(
                TaskErrorKind::WorkerCrashed,
                format!(
                    "worker died {} times before acknowledging",
                    item.attempt
                ),
            );
            self.handle_completion(TaskCompletion {
                submission_id,
                task_id: item.task_id,
                outcome: CompletionOutcome::Failed(failure),
            })
            .await;
        }
    }

    async fn orchestrator(&self, id: SubmissionId) -> Option<Arc<Mutex<Orchestrator>>> {
        self.orchestrators.lock().await.get(&id).cloned()
    }
}
