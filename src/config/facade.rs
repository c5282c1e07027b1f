//! Loader entry points.

use super::merge::merge_policy;
use super::sources::{environment, global_file, workspace_file};
use super::ReductionConfig;
use config::{ConfigError, File};
use std::path::{Path, PathBuf};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace.
    ///
    /// Precedence (lowest to highest): defaults, global file, workspace
    /// `config/config.toml`, `config/{DARKROOM_ENV}.toml`, `DARKROOM__*`
    /// environment variables.
    pub fn load(workspace_root: &Path) -> Result<ReductionConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = environment::add_to_builder(builder);
        builder.build()?.try_deserialize()
    }

    /// Load from a single explicit file (plus environment overrides).
    pub fn load_from_file(path: &Path) -> Result<ReductionConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true));
        let builder = environment::add_to_builder(builder);
        builder.build()?.try_deserialize()
    }

    /// Built-in defaults only
    pub fn default() -> ReductionConfig {
        ReductionConfig::default()
    }

    pub fn global_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }
}
