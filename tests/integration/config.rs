//! Integration tests for layered configuration loading

use darkroom::config::{CombineMethod, ConfigLoader};
use darkroom::types::FrameType;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_workspace_file_overrides_defaults() {
    let workspace = TempDir::new().unwrap();
    fs::create_dir_all(workspace.path().join("config")).unwrap();
    fs::write(
        workspace.path().join("config").join("config.toml"),
        r#"
[stacking]
method = "median"
min_frames = 3

[stacking.min_frames_by_type]
FLAT = 5

[comparison.by_type.DARK]
min_agreement = 0.8

[selection]
exclude_camera_types = ["FLOYDS"]
"#,
    )
    .unwrap();

    let config = ConfigLoader::load(workspace.path()).unwrap();
    assert_eq!(config.stacking.method, CombineMethod::Median);
    assert_eq!(config.stacking.min_frames_for(FrameType::Bias), 3);
    assert_eq!(config.stacking.min_frames_for(FrameType::Flat), 5);
    assert_eq!(config.comparison.thresholds_for(FrameType::Dark).min_agreement, 0.8);
    assert_eq!(config.selection.exclude_camera_types, vec!["FLOYDS".to_string()]);
    // Untouched sections keep their defaults
    assert_eq!(config.queue.max_attempts, 3);
    assert!(config.validate().is_ok());
}

#[test]
fn test_explicit_file_is_used() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("night.toml");
    fs::write(
        &path,
        r#"
[storage]
db_path = "/data/darkroom/registry"

[pipeline]
best_effort = ["saturation_qc"]
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&path).unwrap();
    assert_eq!(
        config.storage.db_path,
        std::path::PathBuf::from("/data/darkroom/registry")
    );
    assert!(!config.pipeline.is_best_effort("qc_record"));
    assert!(config.pipeline.is_best_effort("saturation_qc"));
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(ConfigLoader::load_from_file(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_effective_config_renders_as_toml() {
    let config = ConfigLoader::default();
    let rendered = config.to_toml().unwrap();
    assert!(rendered.contains("[stacking]"));
    assert!(rendered.contains("sigma_clip"));
}
