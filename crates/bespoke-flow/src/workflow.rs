//! Typed workflow documents and ingress validation.
//!
//! A workflow describes one bespoke parameterization plan: the parent
//! molecule, how to fragment it, what reference QC data to generate for the
//! fragments, and how to fit parameters against that data. The executor
//! treats the scientific payloads as opaque; what it validates and acts on
//! are the declared specs, the stage sequence, and the failure tolerances.
//!
//! Engines are tagged `(kind, spec)` variants rather than a class
//! hierarchy: the orchestrator switches on kind to pick a routing key and
//! an expected result shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bespoke_core::canonical::DEFAULT_FLOAT_DECIMALS;

use crate::error::{Error, Result};

/// Default per-QC-task retry cap for reported executor errors.
pub const DEFAULT_QC_MAX_RETRIES: u32 = 2;

/// A bespoke parameterization plan for one input molecule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BespokeWorkflow {
    /// SMILES of the parent molecule the parameters are generated for.
    pub smiles: String,

    /// The starting force field the optimization refines, carried as an
    /// opaque serialized document.
    pub initial_force_field: String,

    /// How to fragment the parent molecule.
    pub fragmenter: FragmenterSpec,

    /// Fitting targets; each declares the QC reference data it needs.
    pub targets: Vec<TargetSpec>,

    /// The parameter optimizer and its hyperparameters.
    pub optimizer: OptimizerSpec,

    /// Fraction of QC tasks allowed to fail before the qc-generation stage
    /// fails (`0.5` = half may fail). Absent means any failure fails the
    /// stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_failure_tolerance: Option<f64>,

    /// Reported-error retry cap for QC tasks.
    #[serde(default = "default_qc_max_retries")]
    pub qc_max_retries: u32,

    /// Decimal digits kept when canonicalizing floats for fingerprints.
    #[serde(default = "default_fingerprint_decimals")]
    pub fingerprint_decimals: u32,
}

fn default_qc_max_retries() -> u32 {
    DEFAULT_QC_MAX_RETRIES
}

fn default_fingerprint_decimals() -> u32 {
    DEFAULT_FLOAT_DECIMALS
}

impl BespokeWorkflow {
    /// Validates the document at ingress.
    ///
    /// Validation runs before a submission is persisted so a rejected
    /// workflow never allocates an id.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidWorkflow` listing every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut reasons = Vec::new();

        if self.smiles.trim().is_empty() {
            reasons.push("smiles must not be empty".to_string());
        }
        if self
            .smiles
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            reasons.push("smiles must not contain whitespace".to_string());
        }
        if self.initial_force_field.trim().is_empty() {
            reasons.push("initial_force_field must not be empty".to_string());
        }
        if self.targets.is_empty() {
            reasons.push("at least one target is required".to_string());
        }
        for (i, target) in self.targets.iter().enumerate() {
            let qc_spec = target.qc_spec();
            if qc_spec.method.trim().is_empty() {
                reasons.push(format!("target {i}: qc method must not be empty"));
            }
            if qc_spec.program.trim().is_empty() {
                reasons.push(format!("target {i}: qc program must not be empty"));
            }
        }
        if let Some(tolerance) = self.qc_failure_tolerance {
            if !(0.0..=1.0).contains(&tolerance) || !tolerance.is_finite() {
                reasons.push(format!(
                    "qc_failure_tolerance must be within [0, 1], got {tolerance}"
                ));
            }
        }
        match &self.fragmenter {
            FragmenterSpec::Wbo { wbo_threshold } => {
                if !wbo_threshold.is_finite() || *wbo_threshold <= 0.0 {
                    reasons.push(format!(
                        "wbo_threshold must be a positive finite number, got {wbo_threshold}"
                    ));
                }
            }
            FragmenterSpec::Pfizer => {}
        }
        match &self.optimizer {
            OptimizerSpec::ForceBalance { max_iterations, .. } => {
                if *max_iterations == 0 {
                    reasons.push("optimizer max_iterations must be at least 1".to_string());
                }
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_workflow(reasons))
        }
    }
}

/// Fragmentation engine selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FragmenterSpec {
    /// Wiberg bond order driven fragmentation.
    Wbo {
        /// Bond-order deviation threshold that stops fragment growth.
        wbo_threshold: f64,
    },
    /// Rule-based fragmentation.
    Pfizer,
}

/// A fitting target and the QC reference data it requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TargetSpec {
    /// Fit against one-dimensional torsion profiles.
    TorsionProfile {
        /// The QC level of theory used to generate the profile.
        qc_spec: QcSpec,
        /// Grid spacing in degrees.
        #[serde(default = "default_grid_spacing")]
        grid_spacing: i64,
        /// Relative weight of this target in the objective.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight: Option<f64>,
    },
    /// Fit against ab-initio energies along the same torsion grids.
    AbInitio {
        /// The QC level of theory used to generate reference energies.
        qc_spec: QcSpec,
        /// Relative weight of this target in the objective.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight: Option<f64>,
    },
}

fn default_grid_spacing() -> i64 {
    15
}

impl TargetSpec {
    /// Returns the QC spec this target computes reference data with.
    #[must_use]
    pub fn qc_spec(&self) -> &QcSpec {
        match self {
            Self::TorsionProfile { qc_spec, .. } | Self::AbInitio { qc_spec, .. } => qc_spec,
        }
    }
}

/// A quantum-chemistry level of theory.
///
/// Keywords use a sorted map so the serialized form (and therefore the
/// fingerprint) is independent of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcSpec {
    /// Method name (e.g. `b3lyp-d3bj`).
    pub method: String,
    /// Basis set, if the method requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<String>,
    /// The program expected to run the calculation (e.g. `psi4`).
    pub program: String,
    /// Auxiliary program keywords.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keywords: BTreeMap<String, Value>,
}

/// Parameter optimizer selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OptimizerSpec {
    /// ForceBalance-style least-squares fitting.
    ForceBalance {
        /// Maximum optimizer iterations.
        max_iterations: u64,
        /// Hyperparameters forwarded verbatim to the optimizer.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        hyperparameters: BTreeMap<String, Value>,
    },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn minimal_workflow() -> BespokeWorkflow {
        BespokeWorkflow {
            smiles: "CC".to_string(),
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
            qc_max_retries: DEFAULT_QC_MAX_RETRIES,
            fingerprint_decimals: DEFAULT_FLOAT_DECIMALS,
        }
    }

    #[test]
    fn minimal_workflow_validates() {
        minimal_workflow().validate().expect("valid");
    }

    #[test]
    fn empty_smiles_rejected() {
        let mut workflow = minimal_workflow();
        workflow.smiles = "  ".to_string();
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("smiles"));
    }

    #[test]
    fn missing_targets_rejected() {
        let mut workflow = minimal_workflow();
        workflow.targets.clear();
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn tolerance_out_of_range_rejected() {
        let mut workflow = minimal_workflow();
        workflow.qc_failure_tolerance = Some(1.5);
        assert!(workflow.validate().is_err());

        workflow.qc_failure_tolerance = Some(0.5);
        workflow.validate().expect("valid tolerance");
    }

    #[test]
    fn validation_collects_all_reasons() {
        let mut workflow = minimal_workflow();
        workflow.smiles = String::new();
        workflow.initial_force_field = String::new();
        workflow.targets.clear();

        let Err(Error::InvalidWorkflow { reasons }) = workflow.validate() else {
            panic!("expected invalid workflow");
        };
        assert!(reasons.len() >= 3);
    }

    #[test]
    fn workflow_json_roundtrip() {
        let workflow = minimal_workflow();
        let json = serde_json::to_value(&workflow).unwrap();
        assert_eq!(json["fragmenter"]["kind"], "wbo");
        assert_eq!(json["targets"][0]["kind"], "torsion-profile");

        let parsed: BespokeWorkflow = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, workflow);
    }

    #[test]
    fn defaults_fill_in_on_deserialize() {
        let parsed: BespokeWorkflow = serde_json::from_value(json!({
            "smiles": "CCO",
            "initial_force_field": "openff-2.2.0.offxml",
            "fragmenter": {"kind": "pfizer"},
            "targets": [{"kind": "torsion-profile", "qc_spec": {"method": "gfn2xtb", "program": "xtb"}}],
            "optimizer": {"kind": "force-balance", "max_iterations": 10},
        }))
        .unwrap();

        assert_eq!(parsed.qc_max_retries, DEFAULT_QC_MAX_RETRIES);
        assert_eq!(parsed.fingerprint_decimals, DEFAULT_FLOAT_DECIMALS);
        assert!(parsed.qc_failure_tolerance.is_none());
    }
}
