//! Stable fingerprints over scientific inputs.
//!
//! A fingerprint is the cache key for one unit of work: a content hash of
//! the task's input document plus the stage kind and method spec. Two
//! submissions that ask for the same computation produce the same
//! fingerprint, which is what lets the cache serve one to the other.
//!
//! Fingerprints must be stable cross-process, so everything is hashed in
//! canonical JSON form (sorted keys, quantized floats) and QC inputs are
//! canonicalized first: the central bond is reduced to its normal form so
//! that equivalent torsion drives collide.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::documents::{QcTaskInput, StageInput};
use crate::error::Result;
use crate::workflow::{BespokeWorkflow, FragmenterSpec};

/// A stable content hash identifying one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps a precomputed hex digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonicalizes a QC task input before hashing.
///
/// The central bond is stored sorted and the fragment's atom map rewritten
/// to the normal `(1, 2)` pair, so the direction the bond was traversed in
/// does not change the fingerprint.
#[must_use]
pub fn canonicalize_qc_input(input: &QcTaskInput) -> QcTaskInput {
    let mut canonical = input.clone();
    let (a, b) = canonical.fragment.bond_indices;
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    canonical.fragment.smiles = canonical
        .fragment
        .smiles
        .replace(&format!(":{low}]"), ":1]")
        .replace(&format!(":{high}]"), ":2]");
    canonical.fragment.bond_indices = (1, 2);
    canonical
}

/// Fingerprint of the fragmentation stage: `H(parent ∥ fragmenter-spec)`.
///
/// # Errors
///
/// Returns an error if the inputs cannot be canonicalized.
pub fn fragmentation_fingerprint(
    smiles: &str,
    fragmenter: &FragmenterSpec,
    float_decimals: u32,
) -> Result<Fingerprint> {
    let payload = json!({
        "stage": "fragmentation",
        "parent": smiles,
        "fragmenter": fragmenter,
    });
    let hex = bespoke_core::canonical::fingerprint_hex(&payload, float_decimals)?;
    Ok(Fingerprint(hex))
}

/// Fingerprint of one QC computation:
/// `H(fragment-canonical ∥ method ∥ basis ∥ program ∥ kind ∥ keywords)`.
///
/// # Errors
///
/// Returns an error if the inputs cannot be canonicalized.
pub fn qc_fingerprint(input: &QcTaskInput, float_decimals: u32) -> Result<Fingerprint> {
    let canonical = canonicalize_qc_input(input);
    let payload = json!({
        "stage": "qc",
        "fragment": canonical.fragment,
        "method": canonical.qc_spec.method,
        "basis": canonical.qc_spec.basis,
        "program": canonical.qc_spec.program,
        "calculation": canonical.calculation,
        "keywords": canonical.qc_spec.keywords,
    });
    let hex = bespoke_core::canonical::fingerprint_hex(&payload, float_decimals)?;
    Ok(Fingerprint(hex))
}

/// Fingerprint of the optimization stage:
/// `H(initial-ff ∥ hyperparameters ∥ sorted(targets + qc-results))`.
///
/// QC results participate through their own fingerprints, sorted, so the
/// completion order of the QC stage never changes the optimization key.
///
/// # Errors
///
/// Returns an error if the inputs cannot be canonicalized.
pub fn optimization_fingerprint(
    workflow: &BespokeWorkflow,
    qc_result_fingerprints: &[Fingerprint],
) -> Result<Fingerprint> {
    let mut sorted: Vec<&str> = qc_result_fingerprints
        .iter()
        .map(Fingerprint::as_str)
        .collect();
    sorted.sort_unstable();

    let payload = json!({
        "stage": "optimization",
        "initial_force_field": workflow.initial_force_field,
        "optimizer": workflow.optimizer,
        "targets": workflow.targets,
        "qc_results": sorted,
    });
    let hex = bespoke_core::canonical::fingerprint_hex(&payload, workflow.fingerprint_decimals)?;
    Ok(Fingerprint(hex))
}

/// Fingerprint for an arbitrary stage input document.
///
/// This is what the orchestrator calls when materializing task records;
/// the per-stage functions above are the building blocks.
///
/// # Errors
///
/// Returns an error if the input cannot be canonicalized.
pub fn input_fingerprint(input: &StageInput, float_decimals: u32) -> Result<Fingerprint> {
    match input {
        StageInput::Fragmentation(frag) => {
            fragmentation_fingerprint(&frag.smiles, &frag.fragmenter, float_decimals)
        }
        StageInput::QcCompute(qc) => qc_fingerprint(qc, float_decimals),
        StageInput::Optimization(opt) => {
            let payload = json!({
                "stage": "optimization",
                "initial_force_field": opt.initial_force_field,
                "optimizer": opt.optimizer,
                "targets": opt.targets,
                "qc_results": opt
                    .qc_results
                    .iter()
                    .map(|r| qc_fingerprint(&r.input, float_decimals).map(|f| f.0))
                    .collect::<Result<Vec<_>>>()
                    .map(|mut v| { v.sort_unstable(); v })?,
            });
            let hex = bespoke_core::canonical::fingerprint_hex(&payload, float_decimals)?;
            Ok(Fingerprint(hex))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{CalculationKind, Fragment};
    use crate::workflow::QcSpec;
    use std::collections::BTreeMap;

    fn qc_input(smiles: &str, bond: (u32, u32)) -> QcTaskInput {
        QcTaskInput {
            fragment: Fragment {
                smiles: smiles.to_string(),
                bond_indices: bond,
            },
            qc_spec: QcSpec {
                method: "gfn2xtb".into(),
                basis: None,
                program: "xtb".into(),
                keywords: BTreeMap::new(),
            },
            calculation: CalculationKind::Torsion1d,
        }
    }

    #[test]
    fn bond_direction_does_not_change_fingerprint() {
        let forward = qc_input("[CH3:1][CH3:2]", (1, 2));
        let reverse = qc_input("[CH3:2][CH3:1]", (2, 1));

        let a = qc_fingerprint(&forward, 9).unwrap();
        let b = qc_fingerprint(&reverse, 9).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn method_changes_fingerprint() {
        let input = qc_input("[CH3:1][CH3:2]", (1, 2));
        let mut other = input.clone();
        other.qc_spec.method = "b3lyp-d3bj".into();

        assert_ne!(
            qc_fingerprint(&input, 9).unwrap(),
            qc_fingerprint(&other, 9).unwrap()
        );
    }

    #[test]
    fn fragmenter_spec_changes_fragmentation_fingerprint() {
        let wbo = fragmentation_fingerprint(
            "CC",
            &FragmenterSpec::Wbo { wbo_threshold: 0.03 },
            9,
        )
        .unwrap();
        let pfizer = fragmentation_fingerprint("CC", &FragmenterSpec::Pfizer, 9).unwrap();
        assert_ne!(wbo, pfizer);
    }

    #[test]
    fn optimization_fingerprint_ignores_qc_order() {
        let workflow = crate::workflow::tests::minimal_workflow();
        let fp1 = Fingerprint::from_hex("aaa");
        let fp2 = Fingerprint::from_hex("bbb");

        let forward =
            optimization_fingerprint(&workflow, &[fp1.clone(), fp2.clone()]).unwrap();
        let reverse = optimization_fingerprint(&workflow, &[fp2, fp1]).unwrap();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn fingerprints_are_hex_sha256() {
        let fp = fragmentation_fingerprint("CC", &FragmenterSpec::Pfizer, 9).unwrap();
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
