//! Task records and their state machine.
//!
//! A task is the smallest unit of work handed to a worker. Its lifecycle:
//!
//! ```text
//! ┌─────────┐  lease granted,  ┌───────────┐  worker done  ┌───────────┐
//! │ PENDING │─────────────────►│ IN-FLIGHT │──────────────►│ SUCCEEDED │
//! └─────────┘     enqueued     └───────────┘               └───────────┘
//!      │                            │      │
//!      │ cache hit                  │      │ reported error (retry budget left)
//!      ▼                            │      ▼
//! ┌─────────┐                       │  ┌─────────┐
//! │ CACHED  │                       └─►│ PENDING │  (attempt += 1)
//! └─────────┘      exhausted /         └─────────┘
//!                  cancelled │
//!                            ▼
//!                       ┌────────┐
//!                       │ FAILED │
//!                       └────────┘
//! ```
//!
//! Terminal states are sticky. The invariant the cache enforces on top of
//! this machine: at most one task per fingerprint is IN-FLIGHT system-wide.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bespoke_core::{SubmissionId, TaskId, WorkerId};

use crate::documents::StageInput;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Routing key used by the queue to deliver compatible tasks to a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKey {
    /// Fragmentation work.
    Fragment,
    /// QC computation work.
    Qc,
    /// Parameter optimization work.
    Optimize,
}

impl RoutingKey {
    /// All routing keys, in stage order.
    pub const ALL: [Self; 3] = [Self::Fragment, Self::Qc, Self::Optimize];

    /// Returns the wire label for this routing key.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fragment => "fragment",
            Self::Qc => "qc",
            Self::Optimize => "optimize",
        }
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RoutingKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fragment" => Ok(Self::Fragment),
            "qc" => Ok(Self::Qc),
            "optimize" => Ok(Self::Optimize),
            other => Err(Error::internal(format!("unknown routing key: {other}"))),
        }
    }
}

/// Task execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Materialized, not yet dispatched.
    Pending,
    /// Lease granted and queued or executing on a worker.
    InFlight,
    /// The executor produced a result and it was published to the cache.
    Succeeded,
    /// Failed terminally (reported error with no budget left, crash cap,
    /// timeout, or cancellation).
    Failed,
    /// Resolved from the cache without invoking an executor.
    Cached,
}

impl TaskState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cached)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::InFlight | Self::Cached | Self::Failed),
            Self::InFlight => {
                matches!(target, Self::Succeeded | Self::Failed | Self::Cached | Self::Pending)
            }
            Self::Succeeded | Self::Failed | Self::Cached => false,
        }
    }

    /// Returns a lowercase label suitable for logs and responses.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cached => "cached",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Category of a task failure, matching the surfaced error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskErrorKind {
    /// The worker died before acknowledging; redelivery budget exhausted.
    WorkerCrashed,
    /// The external executor returned a structured error.
    ExecutorError,
    /// A wall-clock budget expired.
    Timeout,
    /// The submission or task was explicitly cancelled.
    Cancelled,
    /// The queue backend was unreachable past its retry budget.
    QueueUnavailable,
    /// Any unexpected condition.
    Internal,
}

impl TaskErrorKind {
    /// Returns the wire label for this error kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerCrashed => "worker-crashed",
            Self::ExecutorError => "executor-error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::QueueUnavailable => "queue-unavailable",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured failure carried on a task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// The failure category.
    pub kind: TaskErrorKind,
    /// Human-readable message (safe for clients).
    pub message: String,
}

impl TaskFailure {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The record tracking one unit of dispatched work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task id.
    pub id: TaskId,
    /// The submission this task belongs to.
    pub submission_id: SubmissionId,
    /// Ordinal of the owning stage within the submission.
    pub stage_ordinal: usize,
    /// Content fingerprint of the input + method spec (the cache key).
    pub fingerprint: Fingerprint,
    /// Routing key the queue delivers this task under.
    pub routing_key: RoutingKey,
    /// The input document handed to the executor.
    pub input: StageInput,
    /// Attempt number (1-indexed; increments on reported-error retry).
    pub attempt: u32,
    /// Maximum attempts before a reported error becomes terminal.
    pub max_attempts: u32,
    /// Execution state.
    pub state: TaskState,
    /// The last failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    /// Worker that last executed this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    /// When the record was materialized.
    pub created_at: DateTime<Utc>,
    /// When the task reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Materializes a new pending task record.
    #[must_use]
    pub fn new(
        submission_id: SubmissionId,
        stage_ordinal: usize,
        fingerprint: Fingerprint,
        routing_key: RoutingKey,
        input: StageInput,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            submission_id,
            stage_ordinal,
            fingerprint,
            routing_key,
            input,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            state: TaskState::Pending,
            error: None,
            worker_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Returns true if the task is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if a reported error may still be retried.
    #[must_use]
    pub const fn has_retry_budget(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Transitions to a new state, validating the edge.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidStateTransition` if the edge does not exist
    /// in the state machine (terminal states are sticky).
    #[tracing::instrument(
        skip(self),
        fields(task_id = %self.id, from = %self.state, to = %target)
    )]
    pub fn transition_to(&mut self, target: TaskState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "edge not present in task state machine".to_string(),
            });
        }
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.state = target;
        Ok(())
    }

    /// Marks the task succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn succeed(&mut self) -> Result<()> {
        self.error = None;
        self.transition_to(TaskState::Succeeded)
    }

    /// Records which worker produced the task's result.
    pub fn record_worker(&mut self, worker_id: WorkerId) {
        self.worker_id = Some(worker_id);
    }

    /// Marks the task resolved from the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn resolve_cached(&mut self) -> Result<()> {
        self.error = None;
        self.transition_to(TaskState::Cached)
    }

    /// Marks the task terminally failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn fail(&mut self, failure: TaskFailure) -> Result<()> {
        self.error = Some(failure);
        self.transition_to(TaskState::Failed)
    }

    /// Resets an in-flight task back to pending for a retry, consuming one
    /// attempt from the budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is not in-flight or the budget is
    /// exhausted.
    pub fn retry(&mut self, failure: TaskFailure) -> Result<()> {
        if !self.has_retry_budget() {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: TaskState::Pending.to_string(),
                reason: format!("retry budget exhausted at attempt {}", self.attempt),
            });
        }
        self.error = Some(failure);
        self.transition_to(TaskState::Pending)?;
        self.attempt += 1;
        self.worker_id = None;
        Ok(())
    }
}
