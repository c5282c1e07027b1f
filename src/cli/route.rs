//! CLI route: single route table and run context. Dispatches to the
//! orchestrator and registry, then to presentation.

use crate::cli::parse::{Commands, ConfigCommands};
use crate::cli::presentation::{
    format_frame_reports, format_night, format_records_json, format_records_text, format_stacking,
};
use crate::config::{ConfigLoader, ReductionConfig};
use crate::error::ReductionError;
use crate::instrument::Instrument;
use crate::orchestrator::Orchestrator;
use crate::registry::RecordFilter;
use crate::stacking::StackingJob;
use crate::types::{DateWindow, FrameId};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Runtime context for CLI execution: the effective configuration, with
/// storage paths resolved against the workspace root.
pub struct RunContext {
    config: ReductionConfig,
}

impl RunContext {
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ReductionError> {
        let mut config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        if config.storage.db_path.is_relative() {
            config.storage.db_path = workspace_root.join(&config.storage.db_path);
        }
        if config.storage.archive_root.is_relative() {
            config.storage.archive_root = workspace_root.join(&config.storage.archive_root);
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    pub fn execute(&self, command: &Commands) -> Result<String, ReductionError> {
        match command {
            Commands::Config { command } => self.handle_config(command),
            other => {
                let orchestrator = Arc::new(Orchestrator::open(self.config.clone())?);
                let output = self.handle(&orchestrator, other);
                orchestrator.flush()?;
                output
            }
        }
    }

    fn handle(&self, orchestrator: &Arc<Orchestrator>, command: &Commands) -> Result<String, ReductionError> {
        match command {
            Commands::Reduce { paths } => {
                let reports: Vec<_> = paths.iter().map(|p| orchestrator.reduce_isolated(p)).collect();
                Ok(format_frame_reports(&reports))
            }
            Commands::ReduceDir { dir, types } => {
                let reports = runtime()?.block_on(orchestrator.reduce_directory(dir, types));
                Ok(format_frame_reports(&reports))
            }
            Commands::ReduceNight {
                dir,
                instrument,
                start,
                end,
            } => {
                let window = DateWindow::new(*start, *end);
                let report = runtime()?.block_on(orchestrator.process_night(instrument, window, dir))?;
                Ok(format_night(&report))
            }
            Commands::Stack {
                instrument,
                frame_type,
                start,
                end,
                force,
            } => {
                let mut job = StackingJob::new(instrument.clone(), *frame_type, DateWindow::new(*start, *end));
                if *force {
                    job = job.forced();
                }
                let outcome = runtime()?.block_on(orchestrator.stack(&job))?;
                Ok(format_stacking(&outcome))
            }
            Commands::MarkGood { frame_id } => {
                orchestrator.registry().mark_good(&FrameId::new(frame_id.as_str()))?;
                Ok(format!("Marked {} good", frame_id))
            }
            Commands::MarkBad { frame_id } => {
                orchestrator.registry().mark_bad(&FrameId::new(frame_id.as_str()))?;
                Ok(format!("Marked {} bad", frame_id))
            }
            Commands::AddInstrument {
                instrument,
                camera_type,
                unschedulable,
            } => {
                let record = Instrument::new(instrument.clone(), camera_type.as_str(), !unschedulable);
                orchestrator.instruments().add(&record)?;
                info!(instrument = %instrument, camera_type = %camera_type, "Instrument registered");
                Ok(format!("Registered instrument {} ({})", instrument, camera_type))
            }
            Commands::List {
                frame_type,
                instrument,
                masters,
                status,
                format,
            } => {
                let filter = RecordFilter {
                    frame_type: *frame_type,
                    instrument: instrument.clone(),
                    masters_only: *masters,
                    status: *status,
                };
                let records = orchestrator.registry().list(&filter)?;
                match format.as_str() {
                    "json" => format_records_json(&records),
                    "text" => Ok(format_records_text(&records)),
                    other => Err(ReductionError::Config(format!(
                        "Invalid format: {} (must be 'text' or 'json')",
                        other
                    ))),
                }
            }
            Commands::Config { command } => self.handle_config(command),
        }
    }

    fn handle_config(&self, command: &ConfigCommands) -> Result<String, ReductionError> {
        match command {
            ConfigCommands::Show => self
                .config
                .to_toml()
                .map_err(|e| ReductionError::Config(format!("Failed to render configuration: {}", e))),
            ConfigCommands::Validate => match self.config.validate() {
                Ok(()) => Ok("Configuration is valid".to_string()),
                Err(errors) => {
                    let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
                    Err(ReductionError::Config(format!(
                        "Configuration is invalid:\n{}",
                        lines.join("\n")
                    )))
                }
            },
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, ReductionError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ReductionError::Config(format!("Failed to start async runtime: {}", e)))
}
