//! Stage input and output documents.
//!
//! These are the payloads that cross the queue to workers and come back
//! through the cache. The executor treats the scientific content as opaque
//! (`record` fields are raw JSON); what it relies on are the identity
//! fields that feed fingerprints and the fragment fan-out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{FragmenterSpec, OptimizerSpec, QcSpec};

/// A fragment produced by the fragmentation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Mapped SMILES of the fragment.
    pub smiles: String,
    /// Map indices of the central bond the fragment was grown around.
    pub bond_indices: (u32, u32),
}

/// The kind of QC calculation a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalculationKind {
    /// A one-dimensional torsion drive around the central bond.
    Torsion1d,
}

impl std::fmt::Display for CalculationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Torsion1d => write!(f, "torsion1d"),
        }
    }
}

/// Input document for the fragmentation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentationInput {
    /// Parent molecule SMILES.
    pub smiles: String,
    /// The fragmentation engine spec.
    pub fragmenter: FragmenterSpec,
}

/// Output document of the fragmentation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentationOutput {
    /// Parent molecule SMILES as understood by the fragmenter.
    pub parent_smiles: String,
    /// One fragment per unique rotatable central bond.
    pub fragments: Vec<Fragment>,
}

/// Input document for one QC computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcTaskInput {
    /// The fragment the calculation runs on.
    pub fragment: Fragment,
    /// Level of theory.
    pub qc_spec: QcSpec,
    /// The calculation kind.
    pub calculation: CalculationKind,
}

/// Output document of one QC computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcOutput {
    /// The canonical input the record was computed for.
    pub input: QcTaskInput,
    /// The raw result record (opaque to the executor).
    pub record: Value,
}

/// Input document for the optimization stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationInput {
    /// The starting force field document.
    pub initial_force_field: String,
    /// The optimizer spec.
    pub optimizer: OptimizerSpec,
    /// Target descriptions, serialized from the workflow.
    pub targets: Value,
    /// QC reference records gathered by the previous stage.
    pub qc_results: Vec<QcOutput>,
}

/// Output document of the optimization stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutput {
    /// The refit force field document.
    pub refit_force_field: String,
    /// Final objective value reported by the optimizer.
    pub final_objective: Option<f64>,
    /// The raw optimizer result record (opaque to the executor).
    pub record: Value,
}

/// Input to a dispatched task, tagged by stage kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StageInput {
    /// Fragmentation work.
    Fragmentation(FragmentationInput),
    /// One QC computation.
    QcCompute(QcTaskInput),
    /// The final parameter optimization.
    Optimization(Box<OptimizationInput>),
}

/// Output published by a completed task, tagged by stage kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum StageOutput {
    /// Fragmentation result.
    Fragmentation(FragmentationOutput),
    /// One QC record.
    QcCompute(QcOutput),
    /// All QC records gathered by a completed qc-generation stage.
    QcGeneration(Vec<QcOutput>),
    /// The optimization result.
    Optimization(OptimizationOutput),
}

impl StageOutput {
    /// Returns the fragmentation output, if that is what this is.
    #[must_use]
    pub fn as_fragmentation(&self) -> Option<&FragmentationOutput> {
        match self {
            Self::Fragmentation(output) => Some(output),
            _ => None,
        }
    }

    /// Returns the QC output, if that is what this is.
    #[must_use]
    pub fn as_qc(&self) -> Option<&QcOutput> {
        match self {
            Self::QcCompute(output) => Some(output),
            _ => None,
        }
    }

    /// Returns the gathered QC records, if that is what this is.
    #[must_use]
    pub fn as_qc_collection(&self) -> Option<&[QcOutput]> {
        match self {
            Self::QcGeneration(outputs) => Some(outputs),
            _ => None,
        }
    }

    /// Returns the optimization output, if that is what this is.
    #[must_use]
    pub fn as_optimization(&self) -> Option<&OptimizationOutput> {
        match self {
            Self::Optimization(output) => Some(output),
            _ => None,
        }
    }
}
