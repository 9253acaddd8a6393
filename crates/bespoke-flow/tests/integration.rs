//! End-to-end scenarios driving the full deployment: supervisor,
//! coordinator, embedded queue, cache, and worker pools over stub
//! executors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use bespoke_core::{MemoryBackend, StoreBackend, SubmissionId};
use bespoke_flow::config::ExecutorConfig;
use bespoke_flow::coordinator::{CancelOutcome, Coordinator, SubmissionDetail};
use bespoke_flow::documents::StageInput;
use bespoke_flow::error::Result;
use bespoke_flow::executor::{
    CancelToken, ExecutionBudget, ExecutorOutcome, ExecutorSet, StageExecutor, StubFragmenter,
    StubOptimizer, StubQcEngine,
};
use bespoke_flow::stage::StageState;
use bespoke_flow::submission::SubmissionStatus;
use bespoke_flow::supervisor::Supervisor;
use bespoke_flow::task::{TaskErrorKind, TaskState};
use bespoke_flow::workflow::{
    BespokeWorkflow, FragmenterSpec, OptimizerSpec, QcSpec, TargetSpec,
};

fn workflow(smiles: &str) -> BespokeWorkflow {
    BespokeWorkflow {
        smiles: smiles.to_string(),
        initial_force_field: "openff-2.2.0.offxml".to_string(),
        fragmenter: FragmenterSpec::Wbo { wbo_threshold: 0.03 },
        targets: vec![TargetSpec::TorsionProfile {
            qc_spec: QcSpec {
                method: "gfn2xtb".to_string(),
                basis: None,
                program: "xtb".to_string(),
                keywords: BTreeMap::new(),
            },
            grid_spacing: 15,
            weight: None,
        }],
        optimizer: OptimizerSpec::ForceBalance {
            max_iterations: 50,
            hyperparameters: BTreeMap::new(),
        },
        qc_failure_tolerance: None,
        qc_max_retries: 2,
        fingerprint_decimals: 9,
    }
}

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        shutdown_grace: Duration::from_millis(500),
        ..ExecutorConfig::default()
    }
}

/// Counts invocations before delegating to an inner executor.
struct Counting {
    inner: Arc<dyn StageExecutor>,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl StageExecutor for Counting {
    async fn execute(
        &self,
        input: &StageInput,
        budget: &ExecutionBudget,
        cancel: &CancelToken,
    ) -> Result<ExecutorOutcome> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(input, budget, cancel).await
    }
}

fn counting_stubs() -> (ExecutorSet, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let set = ExecutorSet {
        fragment: Arc::new(Counting {
            inner: Arc::new(StubFragmenter),
            count: Arc::clone(&count),
        }),
        qc: Arc::new(Counting {
            inner: Arc::new(StubQcEngine::default()),
            count: Arc::clone(&count),
        }),
        optimize: Arc::new(Counting {
            inner: Arc::new(StubOptimizer),
            count: Arc::clone(&count),
        }),
    };
    (set, count)
}

async fn await_terminal(
    coordinator: &Coordinator,
    id: SubmissionId,
    timeout: Duration,
) -> SubmissionDetail {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let detail = coordinator.get_detail(id).await.expect("get detail");
        if detail.status.is_terminal() {
            return detail;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "submission {id} did not settle in time: {detail:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn single_bond_submission_runs_to_success() {
    let (executors, count) = counting_stubs();
    let supervisor = Supervisor::new(fast_config(), executors);
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let coordinator = supervisor.start_with_backend(backend).await.unwrap();

    let ids = coordinator.submit(vec![workflow("CC")]).await.unwrap();
    assert_eq!(ids.len(), 1);

    let detail = await_terminal(&coordinator, ids[0], Duration::from_secs(20)).await;
    assert_eq!(detail.status, SubmissionStatus::Success, "{detail:?}");

    // One rotatable bond: one fragment, one QC task, one optimization.
    assert_eq!(detail.stages.len(), 3);
    assert_eq!(detail.stages[0].tasks.len(), 1);
    assert_eq!(detail.stages[1].tasks.len(), 1);
    assert_eq!(detail.stages[2].tasks.len(), 1);
    assert!(detail
        .stages
        .iter()
        .all(|s| s.status == StageState::Success));
    assert!(detail.result.is_some(), "final force field missing");

    assert_eq!(count.load(Ordering::SeqCst), 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn warm_cache_resubmission_invokes_no_executors() {
    let (executors, count) = counting_stubs();
    let supervisor = Supervisor::new(fast_config(), executors);
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let coordinator = supervisor.start_with_backend(backend).await.unwrap();

    let first = coordinator.submit(vec![workflow("CC")]).await.unwrap()[0];
    let detail = await_terminal(&coordinator, first, Duration::from_secs(20)).await;
    assert_eq!(detail.status, SubmissionStatus::Success);
    let invocations_after_first = count.load(Ordering::SeqCst);

    let second = coordinator.submit(vec![workflow("CC")]).await.unwrap()[0];
    let detail = await_terminal(&coordinator, second, Duration::from_secs(20)).await;
    assert_eq!(detail.status, SubmissionStatus::Success);

    // Every task resolved from the cache; no executor ran again.
    for stage in &detail.stages {
        for task in &stage.tasks {
            assert_eq!(task.status, TaskState::Cached, "{task:?}");
        }
    }
    assert_eq!(count.load(Ordering::SeqCst), invocations_after_first);

    supervisor.shutdown().await;
}

/// Fails QC tasks whose central bond starts on an even map index;
/// everything else delegates to the stub engine.
struct SelectivelyFailingQc {
    inner: StubQcEngine,
}

#[async_trait]
impl StageExecutor for SelectivelyFailingQc {
    async fn execute(
        &self,
        input: &StageInput,
        budget: &ExecutionBudget,
        cancel: &CancelToken,
    ) -> Result<ExecutorOutcome> {
        if let StageInput::QcCompute(qc) = input {
            if qc.fragment.bond_indices.0 % 2 == 0 {
                return Ok(ExecutorOutcome::Failure {
                    message: "scf failed to converge".to_string(),
                });
            }
        }
        self.inner.execute(input, budget, cancel).await
    }
}

#[tokio::test]
async fn qc_failures_within_declared_tolerance_still_succeed() {
    let executors = ExecutorSet {
        fragment: Arc::new(StubFragmenter),
        qc: Arc::new(SelectivelyFailingQc {
            inner: StubQcEngine::default(),
        }),
        optimize: Arc::new(StubOptimizer),
    };
    let supervisor = Supervisor::new(fast_config(), executors);
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let coordinator = supervisor.start_with_backend(backend).await.unwrap();

    // Five heavy atoms: four fragments, four QC tasks, two of which fail
    // persistently. Half failed is within the declared tolerance.
    let mut plan = workflow("CCCCC");
    plan.qc_failure_tolerance = Some(0.5);
    let id = coordinator.submit(vec![plan]).await.unwrap()[0];

    let detail = await_terminal(&coordinator, id, Duration::from_secs(30)).await;
    assert_eq!(detail.status, SubmissionStatus::Success, "{detail:?}");

    let qc_stage = &detail.stages[1];
    assert_eq!(qc_stage.status, StageState::Success);
    assert_eq!(qc_stage.tasks.len(), 4);

    let failed: Vec<_> = qc_stage
        .tasks
        .iter()
        .filter(|t| t.status == TaskState::Failed)
        .collect();
    assert_eq!(failed.len(), 2, "{qc_stage:?}");
    for task in &failed {
        let error = task.error.as_ref().expect("failed task carries error");
        assert_eq!(error.kind, TaskErrorKind::ExecutorError);
        // Reported QC errors are retried up to the declared budget.
        assert_eq!(task.attempt, 3);
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn without_tolerance_any_qc_failure_fails_the_submission() {
    let executors = ExecutorSet {
        fragment: Arc::new(StubFragmenter),
        qc: Arc::new(SelectivelyFailingQc {
            inner: StubQcEngine::default(),
        }),
        optimize: Arc::new(StubOptimizer),
    };
    let supervisor = Supervisor::new(fast_config(), executors);
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let coordinator = supervisor.start_with_backend(backend).await.unwrap();

    let id = coordinator.submit(vec![workflow("CCCCC")]).await.unwrap()[0];
    let detail = await_terminal(&coordinator, id, Duration::from_secs(30)).await;

    assert_eq!(detail.status, SubmissionStatus::Errored, "{detail:?}");
    assert_eq!(detail.stages[1].status, StageState::Errored);
    // The optimization stage never materialized tasks.
    assert_eq!(detail.stages[2].status, StageState::Skipped);
    assert!(detail.stages[2].tasks.is_empty());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn cancellation_is_cooperative_and_idempotent() {
    let executors = ExecutorSet {
        fragment: Arc::new(StubFragmenter),
        qc: Arc::new(StubQcEngine::with_delay(Duration::from_millis(50))),
        optimize: Arc::new(StubOptimizer),
    };
    let supervisor = Supervisor::new(fast_config(), executors);
    let backend: Arc<dyn StoreBackend> = Arc::new(MemoryBackend::new());
    let coordinator = supervisor.start_with_backend(backend).await.unwrap();

    let id = coordinator.submit(vec![workflow("CC")]).await.unwrap()[0];

    // Wait until the long-running QC task is in flight.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let detail = coordinator.get_detail(id).await.unwrap();
        let qc_in_flight = detail.stages[1]
            .tasks
            .iter()
            .any(|t| t.status == TaskState::InFlight);
        if qc_in_flight {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "qc task never went in flight: {detail:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        coordinator.cancel(id).await.unwrap(),
        CancelOutcome::Cancelled
    );

    let detail = await_terminal(&coordinator, id, Duration::from_secs(10)).await;
    assert_eq!(detail.status, SubmissionStatus::Cancelled);

    // No optimization tasks were ever emitted.
    assert_eq!(detail.stages[2].status, StageState::Skipped);
    assert!(detail.stages[2].tasks.is_empty());

    // Repeated DELETE is a no-op with the same observable status.
    assert_eq!(
        coordinator.cancel(id).await.unwrap(),
        CancelOutcome::AlreadyTerminal
    );
    let detail = coordinator.get_detail(id).await.unwrap();
    assert_eq!(detail.status, SubmissionStatus::Cancelled);

    // The worker observes the flag and settles the in-flight task.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let detail = coordinator.get_detail(id).await.unwrap();
        if detail.stages[1].tasks.iter().all(|t| t.status.is_terminal()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "qc task never settled after cancel: {detail:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn coordinator_restart_resumes_in_flight_submissions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ExecutorConfig {
        directory: dir.path().to_path_buf(),
        shutdown_grace: Duration::from_millis(100),
        ..ExecutorConfig::default()
    };

    let id = {
        let executors = ExecutorSet {
            fragment: Arc::new(StubFragmenter),
            qc: Arc::new(StubQcEngine::with_delay(Duration::from_millis(50))),
            optimize: Arc::new(StubOptimizer),
        };
        let supervisor = Supervisor::new(config.clone(), executors);
        let coordinator = supervisor.start().await.unwrap();

        let id = coordinator.submit(vec![workflow("CC")]).await.unwrap()[0];

        // Wait for the slow QC task to go in flight, then die mid-task:
        // the short grace period aborts the worker.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let detail = coordinator.get_detail(id).await.unwrap();
            if detail.stages[1]
                .tasks
                .iter()
                .any(|t| t.status == TaskState::InFlight)
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "{detail:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        supervisor.shutdown().await;
        id
    };

    // A fresh process over the same state directory.
    let supervisor = Supervisor::new(config, ExecutorSet::stubs());
    let coordinator = supervisor.start().await.unwrap();

    let detail = await_terminal(&coordinator, id, Duration::from_secs(30)).await;
    assert_eq!(detail.status, SubmissionStatus::Success, "{detail:?}");
    assert!(detail.result.is_some());

    supervisor.shutdown().await;
}
