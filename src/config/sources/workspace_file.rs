//! Workspace config files: `config/config.toml`, then `config/{DARKROOM_ENV}.toml`

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, File};
use std::path::{Path, PathBuf};
use tracing::debug;

const ENV_VAR: &str = "DARKROOM_ENV";
const DEFAULT_ENV: &str = "development";

/// Workspace config files in precedence order, whether or not they exist.
pub fn candidate_paths(workspace_root: &Path) -> Vec<PathBuf> {
    let env_name = std::env::var(ENV_VAR).unwrap_or_else(|_| DEFAULT_ENV.to_string());
    let dir = workspace_root.join("config");
    vec![dir.join("config.toml"), dir.join(format!("{}.toml", env_name))]
}

pub fn add_to_builder(
    builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Ok(candidate_paths(workspace_root)
        .into_iter()
        .fold(builder, |builder, path| {
            if path.is_file() {
                debug!(config_path = %path.display(), "Loading workspace configuration");
                builder.add_source(File::from(path).required(false))
            } else {
                builder
            }
        }))
}
