//! External executor contract and built-in stand-ins.
//!
//! The chemistry itself lives outside this crate: fragmenter, QC engine,
//! and optimizer are pluggable [`StageExecutor`] implementations invoked by
//! workers with the task's input document and a core/memory budget.
//!
//! The stub executors synthesize deterministic, plausibly-shaped outputs so
//! the full pipeline can be driven end-to-end in tests and local smoke
//! runs without a quantum-chemistry stack installed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use bespoke_core::TaskId;

use crate::documents::{
    Fragment, FragmentationOutput, OptimizationOutput, QcOutput, StageInput, StageOutput,
};
use crate::error::Result;
use crate::task::RoutingKey;
use crate::workflow::OptimizerSpec;

/// Core and memory budget handed to an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutionBudget {
    /// CPU cores the executor may parallelize across.
    pub n_cores: usize,
    /// Guideline for memory in GiB per core; `None` means best-effort.
    pub max_memory_gib_per_core: Option<f64>,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self {
            n_cores: 1,
            max_memory_gib_per_core: None,
        }
    }
}

/// Shared registry of cancelled task ids.
///
/// The coordinator flags tasks on submission cancellation; workers and
/// executors poll between chunks of work.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    cancelled: Mutex<HashSet<TaskId>>,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags a task as cancelled.
    pub fn cancel(&self, task_id: TaskId) {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id);
    }

    /// Returns true if the task has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self, task_id: &TaskId) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_id)
    }

    /// Clears a flag once the cancellation has been observed.
    pub fn acknowledge(&self, task_id: &TaskId) {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    /// Creates a token an executor can poll for one task.
    #[must_use]
    pub fn token(self: &Arc<Self>, task_id: TaskId) -> CancelToken {
        CancelToken {
            registry: Arc::clone(self),
            task_id,
        }
    }
}

/// Cancellation probe scoped to one task.
#[derive(Debug, Clone)]
pub struct CancelToken {
    registry: Arc<CancellationRegistry>,
    task_id: TaskId,
}

impl CancelToken {
    /// Returns true once the task has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.task_id)
    }
}

/// What an executor invocation produced.
#[derive(Debug)]
pub enum ExecutorOutcome {
    /// The stage computed a result.
    Success(StageOutput),
    /// The executor returned a structured error (a *reported* failure,
    /// eligible for retry only where the stage allows it).
    Failure {
        /// The executor's error message.
        message: String,
    },
    /// The executor observed cancellation and stopped.
    Cancelled,
}

/// Pluggable execution of one stage kind.
///
/// An `Err` return is a *transient* failure (subprocess crash, I/O error):
/// the worker nacks and the queue redelivers. Reported scientific failures
/// come back as `ExecutorOutcome::Failure`.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes the stage input within the given budget.
    async fn execute(
        &self,
        input: &StageInput,
        budget: &ExecutionBudget,
        cancel: &CancelToken,
    ) -> Result<ExecutorOutcome>;
}

/// The executors backing each worker pool.
#[derive(Clone)]
pub struct ExecutorSet {
    /// Fragmentation engine.
    pub fragment: Arc<dyn StageExecutor>,
    /// QC engine.
    pub qc: Arc<dyn StageExecutor>,
    /// Parameter optimizer.
    pub optimize: Arc<dyn StageExecutor>,
}

impl std::fmt::Debug for ExecutorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSet").finish_non_exhaustive()
    }
}

impl ExecutorSet {
    /// A full stub set, suitable for tests and local smoke runs.
    #[must_use]
    pub fn stubs() -> Self {
        Self {
            fragment: Arc::new(StubFragmenter),
            qc: Arc::new(StubQcEngine::default()),
            optimize: Arc::new(StubOptimizer),
        }
    }

    /// Returns the executor serving a routing key.
    #[must_use]
    pub fn for_routing_key(&self, routing_key: RoutingKey) -> Arc<dyn StageExecutor> {
        match routing_key {
            RoutingKey::Fragment => Arc::clone(&self.fragment),
            RoutingKey::Qc => Arc::clone(&self.qc),
            RoutingKey::Optimize => Arc::clone(&self.optimize),
        }
    }
}

// ============================================================================
// Stub executors
// ============================================================================

/// Counts heavy atoms in a SMILES string, the crude way: one per uppercase
/// element symbol, two-letter halogens folded into one.
fn heavy_atom_count(smiles: &str) -> usize {
    let bytes = smiles.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_uppercase() {
            count += 1;
            // Cl and Br consume their lowercase partner.
            if (c == 'C' && bytes.get(i + 1) == Some(&b'l'))
                || (c == 'B' && bytes.get(i + 1) == Some(&b'r'))
            {
                i += 1;
            }
        }
        i += 1;
    }
    count
}

/// Deterministic stand-in for a fragmentation engine.
///
/// Produces one fragment per interior heavy-atom bond of the parent, which
/// matches the fan-out a real fragmenter produces for simple chains (one
/// fragment per rotatable central bond).
#[derive(Debug, Default)]
pub struct StubFragmenter;

#[async_trait]
impl StageExecutor for StubFragmenter {
    async fn execute(
        &self,
        input: &StageInput,
        _budget: &ExecutionBudget,
        cancel: &CancelToken,
    ) -> Result<ExecutorOutcome> {
        let StageInput::Fragmentation(frag) = input else {
            return Ok(ExecutorOutcome::Failure {
                message: "fragmenter received a non-fragmentation input".to_string(),
            });
        };
        if cancel.is_cancelled() {
            return Ok(ExecutorOutcome::Cancelled);
        }

        let atoms = heavy_atom_count(&frag.smiles);
        let fragments: Vec<Fragment> = (1..atoms)
            .map(|bond| Fragment {
                smiles: frag.smiles.clone(),
                #[allow(clippy::cast_possible_truncation)]
                bond_indices: (bond as u32, bond as u32 + 1),
            })
            .collect();

        Ok(ExecutorOutcome::Success(StageOutput::Fragmentation(
            FragmentationOutput {
                parent_smiles: frag.smiles.clone(),
                fragments,
            },
        )))
    }
}

/// Deterministic stand-in for a QC engine.
///
/// Synthesizes a three-fold torsion profile on a 15 degree grid. The
/// optional delay makes long-running-task scenarios (cancellation,
/// visibility expiry) reproducible in tests.
#[derive(Debug, Default)]
pub struct StubQcEngine {
    delay: Option<Duration>,
}

impl StubQcEngine {
    /// Adds an artificial per-chunk delay to simulate long calculations.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl StageExecutor for StubQcEngine {
    async fn execute(
        &self,
        input: &StageInput,
        _budget: &ExecutionBudget,
        cancel: &CancelToken,
    ) -> Result<ExecutorOutcome> {
        let StageInput::QcCompute(qc) = input else {
            return Ok(ExecutorOutcome::Failure {
                message: "qc engine received a non-qc input".to_string(),
            });
        };

        let mut energies = serde_json::Map::new();
        for step in 0..24 {
            if cancel.is_cancelled() {
                return Ok(ExecutorOutcome::Cancelled);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let angle = -180 + step * 15;
            let radians = f64::from(angle).to_radians();
            // Three-fold cosine profile, the shape an sp3-sp3 torsion scan
            // actually produces.
            let energy = 0.5 * (1.0 - (3.0 * radians).cos());
            energies.insert(angle.to_string(), json!(energy));
        }

        Ok(ExecutorOutcome::Success(StageOutput::QcCompute(QcOutput {
            input: qc.clone(),
            record: json!({
                "type": "torsion1d",
                "final_energies": energies,
                "provenance": {"program": qc.qc_spec.program, "method": qc.qc_spec.method},
            }),
        })))
    }
}

/// Deterministic stand-in for a parameter optimizer.
#[derive(Debug, Default)]
pub struct StubOptimizer;

#[async_trait]
impl StageExecutor for StubOptimizer {
    async fn execute(
        &self,
        input: &StageInput,
        _budget: &ExecutionBudget,
        cancel: &CancelToken,
    ) -> Result<ExecutorOutcome> {
        let StageInput::Optimization(opt) = input else {
            return Ok(ExecutorOutcome::Failure {
                message: "optimizer received a non-optimization input".to_string(),
            });
        };
        if cancel.is_cancelled() {
            return Ok(ExecutorOutcome::Cancelled);
        }

        let OptimizerSpec::ForceBalance { max_iterations, .. } = &opt.optimizer;
        let iterations = (*max_iterations).min(12);

        Ok(ExecutorOutcome::Success(StageOutput::Optimization(
            OptimizationOutput {
                refit_force_field: format!(
                    "{}\n<!-- refit against {} reference records -->",
                    opt.initial_force_field,
                    opt.qc_results.len()
                ),
                final_objective: Some(1.0 / f64::from(u32::try_from(iterations).unwrap_or(1) + 1)),
                record: json!({
                    "iterations": iterations,
                    "n_targets": opt.qc_results.len(),
                }),
            },
        )))
    }
}

/// An executor that always reports a structured failure. Test scaffolding
/// for the stage acceptance rules.
#[derive(Debug)]
pub struct FailingExecutor {
    message: String,
}

impl FailingExecutor {
    /// Creates a failing executor with the given error message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl StageExecutor for FailingExecutor {
    async fn execute(
        &self,
        _input: &StageInput,
        _budget: &ExecutionBudget,
        _cancel: &CancelToken,
    ) -> Result<ExecutorOutcome> {
        Ok(ExecutorOutcome::Failure {
            message: self.message.clone(),
        })
    }
}
