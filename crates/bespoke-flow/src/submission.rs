//! Submission documents and aggregate status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bespoke_core::SubmissionId;

use crate::error::{Error, Result};
use crate::stage::{StageKind, StageRecord, StageState};
use crate::workflow::BespokeWorkflow;

/// Aggregate submission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Accepted, no stage has started yet.
    Waiting,
    /// At least one stage is running or still pending.
    Running,
    /// All stages succeeded.
    Success,
    /// A stage failed; later stages were skipped.
    Errored,
    /// Explicitly cancelled.
    Cancelled,
}

impl SubmissionStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Errored | Self::Cancelled)
    }

    /// Returns a lowercase label suitable for logs and responses.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

impl std::str::FromStr for SubmissionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "errored" => Ok(Self::Errored),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::internal(format!("unknown status: {other}"))),
        }
    }
}

/// A persisted submission: the workflow plus its lifecycle state.
///
/// Stage records are persisted separately (`stage/<id>/<ordinal>`) so a
/// stage transition does not rewrite the whole submission document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Monotonically assigned integer id.
    pub id: SubmissionId,
    /// The full fitting plan.
    pub workflow: BespokeWorkflow,
    /// Aggregate status. Terminal states are sticky.
    pub status: SubmissionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When the submission reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// Creates a new waiting submission.
    #[must_use]
    pub fn new(id: SubmissionId, workflow: BespokeWorkflow) -> Self {
        Self {
            id,
            workflow,
            status: SubmissionStatus::Waiting,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Builds the declared stage sequence for this submission.
    #[must_use]
    pub fn materialize_stages() -> Vec<StageRecord> {
        StageKind::ORDERED.into_iter().map(StageRecord::new).collect()
    }

    /// Applies a new aggregate status, keeping terminal states sticky.
    ///
    /// # Errors
    ///
    /// Returns an error when moving a terminal submission to a different
    /// state; re-applying the same terminal state is an idempotent no-op.
    pub fn apply_status(&mut self, status: SubmissionStatus) -> Result<()> {
        if self.status.is_terminal() {
            if self.status == status {
                return Ok(());
            }
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
                reason: "terminal submission status is sticky".to_string(),
            });
        }
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = status;
        Ok(())
    }

    /// Derives the aggregate status from the stage records.
    ///
    /// Cancellation never derives from stages; it is applied explicitly
    /// and stickiness keeps it in place.
    #[must_use]
    pub fn derive_status(stages: &[StageRecord]) -> SubmissionStatus {
        if stages.iter().any(|s| s.state == StageState::Errored) {
            return SubmissionStatus::Errored;
        }
        if stages.iter().all(|s| s.state == StageState::Success) {
            return SubmissionStatus::Success;
        }
        if stages.iter().all(|s| s.state == StageState::Pending) {
            return SubmissionStatus::Waiting;
        }
        SubmissionStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tests::minimal_workflow;

    #[test]
    fn new_submission_is_waiting() {
        let sub = Submission::new(SubmissionId::from_u64(1), minimal_workflow());
        assert_eq!(sub.status, SubmissionStatus::Waiting);
        assert!(sub.completed_at.is_none());
    }

    #[test]
    fn stages_materialize_in_declared_order() {
        let stages = Submission::materialize_stages();
        let kinds: Vec<StageKind> = stages.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Fragmentation,
                StageKind::QcGeneration,
                StageKind::Optimization
            ]
        );
        assert!(stages.iter().all(|s| s.state == StageState::Pending));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut sub = Submission::new(SubmissionId::from_u64(1), minimal_workflow());
        sub.apply_status(SubmissionStatus::Cancelled).unwrap();

        // Same terminal state: idempotent no-op.
        sub.apply_status(SubmissionStatus::Cancelled).unwrap();

        // Different state: rejected.
        assert!(sub.apply_status(SubmissionStatus::Success).is_err());
        assert_eq!(sub.status, SubmissionStatus::Cancelled);
    }

    #[test]
    fn derive_status_from_stages() {
        let mut stages = Submission::materialize_stages();
        assert_eq!(
            Submission::derive_status(&stages),
            SubmissionStatus::Waiting
        );

        stages[0].transition_to(StageState::Running).unwrap();
        assert_eq!(
            Submission::derive_status(&stages),
            SubmissionStatus::Running
        );

        stages[0].transition_to(StageState::Errored).unwrap();
        stages[1].transition_to(StageState::Skipped).unwrap();
        stages[2].transition_to(StageState::Skipped).unwrap();
        assert_eq!(
            Submission::derive_status(&stages),
            SubmissionStatus::Errored
        );
    }

    #[test]
    fn all_success_derives_success() {
        let mut stages = Submission::materialize_stages();
        for stage in &mut stages {
            stage.transition_to(StageState::Running).unwrap();
            stage.transition_to(StageState::Success).unwrap();
        }
        assert_eq!(
            Submission::derive_status(&stages),
            SubmissionStatus::Success
        );
    }

    #[test]
    fn submission_roundtrips_through_json() {
        let sub = Submission::new(SubmissionId::from_u64(9), minimal_workflow());
        let json = serde_json::to_string(&sub).unwrap();
        let parsed: Submission = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, sub.id);
        assert_eq!(parsed.status, sub.status);
        assert_eq!(parsed.workflow, sub.workflow);
    }
}
