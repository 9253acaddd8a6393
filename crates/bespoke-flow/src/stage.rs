//! Stage records, ordering, and acceptance rules.
//!
//! Every submission runs the same ordered stage sequence: fragmentation,
//! qc-generation, optimization. Stage *k+1* only leaves `pending` after
//! stage *k* is terminal, and once a stage is terminal its record is
//! immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bespoke_core::TaskId;

use crate::documents::StageOutput;
use crate::error::{Error, Result};
use crate::task::{RoutingKey, TaskRecord, TaskState};

/// The kind of one ordered step within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    /// Chemical fragmentation of the parent molecule.
    Fragmentation,
    /// Generation of quantum-chemical reference data.
    QcGeneration,
    /// Numerical optimization of parameters against the reference data.
    Optimization,
}

impl StageKind {
    /// The declared stage sequence, in execution order.
    pub const ORDERED: [Self; 3] = [Self::Fragmentation, Self::QcGeneration, Self::Optimization];

    /// Returns the wire label for this stage kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fragmentation => "fragmentation",
            Self::QcGeneration => "qc-generation",
            Self::Optimization => "optimization",
        }
    }

    /// Returns the routing key whose pool executes this stage's tasks.
    #[must_use]
    pub const fn routing_key(&self) -> RoutingKey {
        match self {
            Self::Fragmentation => RoutingKey::Fragment,
            Self::QcGeneration => RoutingKey::Qc,
            Self::Optimization => RoutingKey::Optimize,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stage execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    /// Waiting for the previous stage to finish.
    Pending,
    /// Tasks materialized and executing.
    Running,
    /// The acceptance rule was satisfied.
    Success,
    /// The acceptance rule was violated.
    Errored,
    /// Never ran because an earlier stage failed or the submission was
    /// cancelled.
    Skipped,
}

impl StageState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Errored | Self::Skipped)
    }

    /// Returns a lowercase label suitable for logs and responses.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Errored => "errored",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// The record of one stage within a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage kind.
    pub kind: StageKind,
    /// Execution state.
    pub state: StageState,
    /// Ids of the stage's task records, in materialization order.
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    /// The stage output document, populated on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StageOutput>,
    /// The error document, populated on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the stage left `pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    /// Creates a new pending stage record.
    #[must_use]
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            state: StageState::Pending,
            task_ids: Vec::new(),
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns true if the stage is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transitions the stage, enforcing terminal immutability.
    ///
    /// # Errors
    ///
    /// Returns an error when mutating a terminal stage or skipping the
    /// pending → running order.
    pub fn transition_to(&mut self, target: StageState) -> Result<()> {
        let valid = match self.state {
            StageState::Pending => matches!(
                target,
                StageState::Running | StageState::Skipped | StageState::Errored
            ),
            StageState::Running => matches!(target, StageState::Success | StageState::Errored),
            StageState::Success | StageState::Errored | StageState::Skipped => false,
        };
        if !valid {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "terminal stage records are immutable".to_string(),
            });
        }
        match target {
            StageState::Running => self.started_at = Some(Utc::now()),
            state if state.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.state = target;
        Ok(())
    }
}

/// Verdict of a stage acceptance evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageVerdict {
    /// Some tasks are still non-terminal.
    Incomplete,
    /// All tasks terminal and the acceptance rule is satisfied.
    Accepted,
    /// All tasks terminal and the acceptance rule is violated.
    Rejected {
        /// Description of the violation, persisted as the stage error.
        reason: String,
    },
}

/// Evaluates a stage's declared acceptance rule over its tasks.
///
/// - Fragmentation and optimization: the single task must succeed (or be
///   served from the cache).
/// - QC: failed tasks are tolerated while the failed fraction stays within
///   the workflow-declared tolerance; with no declared tolerance, any
///   failure rejects the stage.
#[must_use]
pub fn evaluate_acceptance(
    kind: StageKind,
    qc_failure_tolerance: Option<f64>,
    tasks: &[&TaskRecord],
) -> StageVerdict {
    if tasks.iter().any(|t| !t.is_terminal()) {
        return StageVerdict::Incomplete;
    }

    let failed: Vec<&&TaskRecord> = tasks
        .iter()
        .filter(|t| t.state == TaskState::Failed)
        .collect();

    if failed.is_empty() {
        return StageVerdict::Accepted;
    }

    match kind {
        StageKind::QcGeneration => {
            let tolerance = qc_failure_tolerance.unwrap_or(0.0);
            #[allow(clippy::cast_precision_loss)]
            let failed_fraction = failed.len() as f64 / tasks.len().max(1) as f64;
            if failed_fraction <= tolerance {
                StageVerdict::Accepted
            } else {
                StageVerdict::Rejected {
                    reason: format!(
                        "{} of {} qc tasks failed, exceeding the declared tolerance of {tolerance}",
                        failed.len(),
                        tasks.len()
                    ),
                }
            }
        }
        _ => {
            let first = failed[0];
            StageVerdict::Rejected {
                reason: first
                    .error
                    .as_ref()
                    .map_or_else(
                        || format!("{} task failed", kind),
                        |e| format!("{} task failed: {}", kind, e.message),
                    ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{FragmentationInput, StageInput};
    use crate::fingerprint::Fingerprint;
    use crate::task::{TaskErrorKind, TaskFailure};
    use crate::workflow::FragmenterSpec;
    use bespoke_core::SubmissionId;

    fn task_in_state(state: TaskState) -> TaskRecord {
        let mut task = TaskRecord::new(
            SubmissionId::from_u64(1),
            1,
            Fingerprint::from_hex("fp"),
            RoutingKey::Qc,
            StageInput::Fragmentation(FragmentationInput {
                smiles: "CC".into(),
                fragmenter: FragmenterSpec::Pfizer,
            }),
            1,
        );
        match state {
            TaskState::Pending => {}
            TaskState::InFlight => task.transition_to(TaskState::InFlight).unwrap(),
            TaskState::Succeeded => {
                task.transition_to(TaskState::InFlight).unwrap();
                task.succeed().unwrap();
            }
            TaskState::Failed => {
                task.transition_to(TaskState::InFlight).unwrap();
                task.fail(TaskFailure::new(TaskErrorKind::ExecutorError, "boom"))
                    .unwrap();
            }
            TaskState::Cached => task.resolve_cached().unwrap(),
        }
        task
    }

    #[test]
    fn stage_kinds_are_ordered() {
        assert_eq!(StageKind::ORDERED[0], StageKind::Fragmentation);
        assert_eq!(StageKind::ORDERED[1], StageKind::QcGeneration);
        assert_eq!(StageKind::ORDERED[2], StageKind::Optimization);
    }

    #[test]
    fn stage_routing_keys() {
        assert_eq!(StageKind::Fragmentation.routing_key(), RoutingKey::Fragment);
        assert_eq!(StageKind::QcGeneration.routing_key(), RoutingKey::Qc);
        assert_eq!(StageKind::Optimization.routing_key(), RoutingKey::Optimize);
    }

    #[test]
    fn terminal_stage_is_immutable() {
        let mut stage = StageRecord::new(StageKind::Fragmentation);
        stage.transition_to(StageState::Running).unwrap();
        stage.transition_to(StageState::Success).unwrap();

        assert!(stage.transition_to(StageState::Errored).is_err());
        assert_eq!(stage.state, StageState::Success);
    }

    #[test]
    fn pending_stage_can_be_skipped() {
        let mut stage = StageRecord::new(StageKind::Optimization);
        stage.transition_to(StageState::Skipped).unwrap();
        assert!(stage.is_terminal());
    }

    #[test]
    fn incomplete_while_tasks_run() {
        let running = task_in_state(TaskState::InFlight);
        let done = task_in_state(TaskState::Succeeded);
        let verdict =
            evaluate_acceptance(StageKind::QcGeneration, None, &[&running, &done]);
        assert_eq!(verdict, StageVerdict::Incomplete);
    }

    #[test]
    fn fragmentation_rejects_on_failure() {
        let failed = task_in_state(TaskState::Failed);
        let verdict = evaluate_acceptance(StageKind::Fragmentation, None, &[&failed]);
        assert!(matches!(verdict, StageVerdict::Rejected { .. }));
    }

    #[test]
    fn cached_tasks_count_as_success() {
        let cached = task_in_state(TaskState::Cached);
        let verdict = evaluate_acceptance(StageKind::Optimization, None, &[&cached]);
        assert_eq!(verdict, StageVerdict::Accepted);
    }

    #[test]
    fn qc_without_tolerance_rejects_any_failure() {
        let ok = task_in_state(TaskState::Succeeded);
        let failed = task_in_state(TaskState::Failed);
        let verdict = evaluate_acceptance(StageKind::QcGeneration, None, &[&ok, &failed]);
        assert!(matches!(verdict, StageVerdict::Rejected { .. }));
    }

    #[test]
    fn qc_tolerance_absorbs_failures_within_budget() {
        let tasks = [
            task_in_state(TaskState::Succeeded),
            task_in_state(TaskState::Succeeded),
            task_in_state(TaskState::Failed),
            task_in_state(TaskState::Failed),
        ];
        let refs: Vec<&TaskRecord> = tasks.iter().collect();

        // Half failed, half tolerated.
        let verdict = evaluate_acceptance(StageKind::QcGeneration, Some(0.5), &refs);
        assert_eq!(verdict, StageVerdict::Accepted);

        // A tighter tolerance rejects the same outcome.
        let verdict = evaluate_acceptance(StageKind::QcGeneration, Some(0.25), &refs);
        assert!(matches!(verdict, StageVerdict::Rejected { .. }));
    }
}
