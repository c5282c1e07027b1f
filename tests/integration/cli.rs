//! Integration tests for CLI routing

use clap::Parser;
use darkroom::cli::{Cli, RunContext};
use darkroom::error::ReductionError;
use std::fs;
use tempfile::TempDir;

fn run(workspace: &TempDir, args: &[&str]) -> Result<String, ReductionError> {
    let mut argv = vec!["darkroom", "--workspace"];
    let root = workspace.path().to_str().unwrap();
    argv.push(root);
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    let context = RunContext::new(cli.workspace.clone(), cli.config.clone())?;
    context.execute(&cli.command)
}

#[test]
fn test_storage_paths_resolve_against_workspace() {
    let workspace = TempDir::new().unwrap();
    let context = RunContext::new(workspace.path().to_path_buf(), None).unwrap();
    assert!(context.config().storage.db_path.starts_with(workspace.path()));
    assert!(context.config().storage.archive_root.starts_with(workspace.path()));
}

#[test]
fn test_add_instrument_then_list() {
    let workspace = TempDir::new().unwrap();
    let output = run(
        &workspace,
        &["add-instrument", "lsc/domb/1m0a/fa15", "--camera-type", "1m0-SciCam-Sinistro"],
    )
    .unwrap();
    assert!(output.contains("lsc/domb/1m0a/fa15"));

    let output = run(&workspace, &["list"]).unwrap();
    assert_eq!(output, "No calibration records");

    let output = run(&workspace, &["list", "--masters", "--format", "json"]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(value["count"], 0);
}

#[test]
fn test_invalid_list_format_is_rejected() {
    let workspace = TempDir::new().unwrap();
    let err = run(&workspace, &["list", "--format", "xml"]).unwrap_err();
    assert!(matches!(err, ReductionError::Config(_)));
}

#[test]
fn test_mark_unknown_frame_is_not_found() {
    let workspace = TempDir::new().unwrap();
    let err = run(&workspace, &["mark-good", "nope"]).unwrap_err();
    assert!(matches!(err, ReductionError::NotFound(_)));
}

#[test]
fn test_config_validate_reports_errors() {
    let workspace = TempDir::new().unwrap();
    let path = workspace.path().join("bad.toml");
    fs::write(&path, "[queue]\nframe_workers = 0\n").unwrap();

    let err = run(&workspace, &["--config", path.to_str().unwrap(), "config", "validate"]).unwrap_err();
    assert!(err.to_string().contains("each lane needs at least one worker"));

    let output = run(&workspace, &["config", "validate"]).unwrap();
    assert_eq!(output, "Configuration is valid");
}

#[test]
fn test_stack_requires_valid_timestamps() {
    let parsed = Cli::try_parse_from([
        "darkroom",
        "stack",
        "--instrument",
        "lsc/domb/1m0a/fa15",
        "--type",
        "BIAS",
        "--start",
        "yesterday",
        "--end",
        "2024-03-03T12:00:00",
    ]);
    assert!(parsed.is_err());
}
