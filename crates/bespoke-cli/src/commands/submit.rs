//! Submit command - send a molecule for bespoke parameterization.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;

use bespoke_flow::workflow::{
    BespokeWorkflow, FragmenterSpec, OptimizerSpec, QcSpec, TargetSpec,
};

use crate::client::ApiClient;
use crate::exit::{CliError, CliResult};
use crate::Config;

/// Arguments for the submit command.
#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// File containing the molecule's SMILES (first non-empty line).
    #[arg(long, conflicts_with = "smiles")]
    pub file: Option<PathBuf>,

    /// Molecule SMILES, inline.
    #[arg(long)]
    pub smiles: Option<String>,

    /// Name of a built-in workflow (`default` or `debug`).
    #[arg(long, default_value = "default", conflicts_with = "workflow_file")]
    pub workflow: String,

    /// Path to a workflow document; its `smiles` field is replaced with
    /// the submitted molecule.
    #[arg(long)]
    pub workflow_file: Option<PathBuf>,
}

/// Builds one of the built-in workflow plans for a molecule.
///
/// # Errors
///
/// Returns a user error for unknown workflow names.
pub fn built_in_workflow(name: &str, smiles: &str) -> Result<BespokeWorkflow, CliError> {
    let (qc_spec, max_iterations) = match name {
        "default" => (
            QcSpec {
                method: "b3lyp-d3bj".to_string(),
                basis: Some("dzvp".to_string()),
                program: "psi4".to_string(),
                keywords: BTreeMap::new(),
            },
            50,
        ),
        "debug" => (
            QcSpec {
                method: "gfn2xtb".to_string(),
                basis: None,
                program: "xtb".to_string(),
                keywords: BTreeMap::new(),
            },
            5,
        ),
        other => {
            return Err(CliError::User(format!(
                "unknown workflow {other:?}; expected 'default' or 'debug'"
            )))
        }
    };

    Ok(BespokeWorkflow {
        smiles: smiles.to_string(),
        initial_force_field: "openff-2.2.0.offxml".to_string(),
        fragmenter: FragmenterSpec::Wbo { wbo_threshold: 0.03 },
        targets: vec![TargetSpec::TorsionProfile {
            qc_spec,
            grid_spacing: 15,
            weight: None,
        }],
        optimizer: OptimizerSpec::ForceBalance {
            max_iterations,
            hyperparameters: BTreeMap::new(),
        },
        qc_failure_tolerance: None,
        qc_max_retries: 2,
        fingerprint_decimals: 9,
    })
}

fn read_smiles(args: &SubmitArgs) -> Result<String, CliError> {
    if let Some(smiles) = &args.smiles {
        return Ok(smiles.clone());
    }
    let Some(path) = &args.file else {
        return Err(CliError::User(
            "either --smiles or --file is required".to_string(),
        ));
    };
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CliError::User(format!("failed to read {}: {e}", path.display())))?;
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CliError::User(format!("{} contains no molecule", path.display())))
}

fn build_workflow(args: &SubmitArgs, smiles: &str) -> Result<BespokeWorkflow, CliError> {
    let Some(path) = &args.workflow_file else {
        return built_in_workflow(&args.workflow, smiles);
    };

    let contents = std::fs::read_to_string(path)
        .map_err(|e| CliError::User(format!("failed to read {}: {e}", path.display())))?;
    let mut document: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| CliError::User(format!("{} is not valid JSON: {e}", path.display())))?;
    document["smiles"] = serde_json::Value::String(smiles.to_string());

    serde_json::from_value(document)
        .map_err(|e| CliError::User(format!("{} is not a valid workflow: {e}", path.display())))
}

/// Execute the submit command.
///
/// # Errors
///
/// User errors for bad input, unreachable errors for connection failures.
pub async fn execute(args: SubmitArgs, config: &Config) -> CliResult {
    let smiles = read_smiles(&args)?;
    let workflow = build_workflow(&args, &smiles)?;

    let client = ApiClient::new(config)?;
    let submissions = client.submit(vec![workflow]).await?;

    for submission in submissions {
        println!("submitted {} -> id {}", smiles, submission.id);
        println!("  {}", submission.self_url);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_workflows_validate() {
        for name in ["default", "debug"] {
            let workflow = built_in_workflow(name, "CC").unwrap();
            workflow.validate().expect("built-in workflow is valid");
        }
    }

    #[test]
    fn unknown_workflow_name_is_a_user_error() {
        let err = built_in_workflow("quantum-magic", "CC").unwrap_err();
        assert_eq!(err.code(), crate::exit::USER_ERROR);
    }

    #[test]
    fn smiles_read_from_file_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("molecule.smi");
        std::fs::write(&path, "\n  \nCCO\nCC\n").unwrap();

        let args = SubmitArgs {
            file: Some(path),
            smiles: None,
            workflow: "default".to_string(),
            workflow_file: None,
        };
        assert_eq!(read_smiles(&args).unwrap(), "CCO");
    }

    #[test]
    fn workflow_file_overrides_smiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        let document = serde_json::to_string(&built_in_workflow("debug", "XXX").unwrap()).unwrap();
        std::fs::write(&path, document).unwrap();

        let args = SubmitArgs {
            file: None,
            smiles: Some("CCO".to_string()),
            workflow: "default".to_string(),
            workflow_file: Some(path),
        };
        let workflow = build_workflow(&args, "CCO").unwrap();
        assert_eq!(workflow.smiles, "CCO");
    }
}
