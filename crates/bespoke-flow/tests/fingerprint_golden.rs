//! Golden tests pinning the canonical forms that feed fingerprints.
//!
//! A change to any assertion here invalidates every persisted cache entry
//! in every deployment, so it must be a deliberate decision.

use std::collections::BTreeMap;

use serde_json::json;

use bespoke_core::canonical::{to_canonical_string, DEFAULT_FLOAT_DECIMALS};
use bespoke_flow::documents::{CalculationKind, Fragment, QcTaskInput};
use bespoke_flow::fingerprint::{
    canonicalize_qc_input, fragmentation_fingerprint, qc_fingerprint,
};
use bespoke_flow::workflow::{FragmenterSpec, QcSpec};

#[test]
fn canonical_form_of_fragmentation_payload_is_pinned() {
    let payload = json!({
        "stage": "fragmentation",
        "parent": "CC",
        "fragmenter": FragmenterSpec::Pfizer,
    });
    let canonical = to_canonical_string(&payload, DEFAULT_FLOAT_DECIMALS).unwrap();
    assert_eq!(
        canonical,
        r#"{"fragmenter":{"kind":"pfizer"},"parent":"CC","stage":"fragmentation"}"#
    );
}

#[test]
fn canonical_form_sorts_wbo_spec_fields() {
    let payload = json!({
        "fragmenter": FragmenterSpec::Wbo { wbo_threshold: 0.03 },
    });
    let canonical = to_canonical_string(&payload, DEFAULT_FLOAT_DECIMALS).unwrap();
    assert_eq!(
        canonical,
        r#"{"fragmenter":{"kind":"wbo","wbo_threshold":0.03}}"#
    );
}

#[test]
fn fragmentation_fingerprints_are_stable_across_constructions() {
    let a = fragmentation_fingerprint("CC", &FragmenterSpec::Pfizer, DEFAULT_FLOAT_DECIMALS)
        .unwrap();
    let b = fragmentation_fingerprint("CC", &FragmenterSpec::Pfizer, DEFAULT_FLOAT_DECIMALS)
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str().len(), 64);
}

#[test]
fn qc_canonicalization_rewrites_central_bond_to_normal_form() {
    let input = QcTaskInput {
        fragment: Fragment {
            smiles: "[CH3:4][CH3:7]".to_string(),
            bond_indices: (7, 4),
        },
        qc_spec: QcSpec {
            method: "gfn2xtb".to_string(),
            basis: None,
            program: "xtb".to_string(),
            keywords: BTreeMap::new(),
        },
        calculation: CalculationKind::Torsion1d,
    };

    let canonical = canonicalize_qc_input(&input);
    assert_eq!(canonical.fragment.bond_indices, (1, 2));
    assert_eq!(canonical.fragment.smiles, "[CH3:1][CH3:2]");
}

#[test]
fn equivalent_qc_tasks_collide_regardless_of_bond_labeling() {
    let make = |smiles: &str, bond: (u32, u32)| QcTaskInput {
        fragment: Fragment {
            smiles: smiles.to_string(),
            bond_indices: bond,
        },
        qc_spec: QcSpec {
            method: "gfn2xtb".to_string(),
            basis: Some("dzvp".to_string()),
            program: "xtb".to_string(),
            keywords: BTreeMap::new(),
        },
        calculation: CalculationKind::Torsion1d,
    };

    let low = qc_fingerprint(&make("[CH3:1][CH3:2]", (1, 2)), DEFAULT_FLOAT_DECIMALS).unwrap();
    let high = qc_fingerprint(&make("[CH3:4][CH3:7]", (4, 7)), DEFAULT_FLOAT_DECIMALS).unwrap();
    let reversed =
        qc_fingerprint(&make("[CH3:7][CH3:4]", (7, 4)), DEFAULT_FLOAT_DECIMALS).unwrap();

    assert_eq!(low, high);
    assert_eq!(low, reversed);
}

#[test]
fn keyword_order_never_changes_a_fingerprint() {
    let mut forward = BTreeMap::new();
    forward.insert("maxiter".to_string(), json!(200));
    forward.insert("scf_type".to_string(), json!("df"));

    let mut reverse = BTreeMap::new();
    reverse.insert("scf_type".to_string(), json!("df"));
    reverse.insert("maxiter".to_string(), json!(200));

    let make = |keywords: BTreeMap<String, serde_json::Value>| QcTaskInput {
        fragment: Fragment {
            smiles: "[CH3:1][CH3:2]".to_string(),
            bond_indices: (1, 2),
        },
        qc_spec: QcSpec {
            method: "b3lyp-d3bj".to_string(),
            basis: Some("dzvp".to_string()),
            program: "psi4".to_string(),
            keywords,
        },
        calculation: CalculationKind::Torsion1d,
    };

    assert_eq!(
        qc_fingerprint(&make(forward), DEFAULT_FLOAT_DECIMALS).unwrap(),
        qc_fingerprint(&make(reverse), DEFAULT_FLOAT_DECIMALS).unwrap()
    );
}

#[test]
fn tolerance_quantization_applies_to_spec_floats() {
    let make = |threshold: f64| {
        fragmentation_fingerprint(
            "CC",
            &FragmenterSpec::Wbo {
                wbo_threshold: threshold,
            },
            DEFAULT_FLOAT_DECIMALS,
        )
        .unwrap()
    };

    // Differences below the declared tolerance collapse.
    assert_eq!(make(0.03), make(0.030_000_000_04));
    // Differences above it do not.
    assert_ne!(make(0.03), make(0.031));
}
