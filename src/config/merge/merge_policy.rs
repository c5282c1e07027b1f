//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Only scalar roots are seeded here; every section also carries serde
/// defaults, so a layer that sets one key leaves its siblings intact.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("storage.db_path", ".darkroom/registry")?
        .set_default("storage.archive_root", ".darkroom/archive")?
        .set_default("logging.level", "info")?
        .set_default("stacking.min_frames", 1)?
        .set_default("queue.max_attempts", 3)
}
