//! CLI parse: clap types for darkroom. No behavior; definitions only.

use crate::registry::CalibrationStatus;
use crate::types::{parse_timestamp, FrameType, InstrumentId, Timestamp};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Darkroom CLI - calibration lifecycle and frame reduction
#[derive(Parser)]
#[command(name = "darkroom")]
#[command(about = "Reduce observatory frames and manage master calibrations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory (relative storage paths resolve against it)
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reduce individual frame files
    Reduce {
        /// Raw frame files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Reduce every frame file under a directory
    ReduceDir {
        dir: PathBuf,
        /// Only these frame types (repeatable; default all)
        #[arg(long = "type")]
        types: Vec<FrameType>,
    },
    /// Reduce one night: calibrations in order, stacking each, then science
    ReduceNight {
        dir: PathBuf,
        /// Instrument as site/enclosure/telescope/camera
        #[arg(long)]
        instrument: InstrumentId,
        /// Window start (inclusive)
        #[arg(long, value_parser = parse_time)]
        start: Timestamp,
        /// Window end (exclusive)
        #[arg(long, value_parser = parse_time)]
        end: Timestamp,
    },
    /// Stack individual calibrations of one window into masters
    Stack {
        /// Instrument as site/enclosure/telescope/camera
        #[arg(long)]
        instrument: InstrumentId,
        /// Calibration type (BIAS, DARK, FLAT)
        #[arg(long = "type")]
        frame_type: FrameType,
        #[arg(long, value_parser = parse_time)]
        start: Timestamp,
        #[arg(long, value_parser = parse_time)]
        end: Timestamp,
        /// Restack even if a good master exists
        #[arg(long)]
        force: bool,
    },
    /// Mark a calibration good
    MarkGood { frame_id: String },
    /// Mark a calibration bad
    MarkBad { frame_id: String },
    /// Register or replace an instrument
    AddInstrument {
        /// Instrument as site/enclosure/telescope/camera
        instrument: InstrumentId,
        /// Camera type used by selection criteria
        #[arg(long)]
        camera_type: String,
        /// Register the instrument as not schedulable
        #[arg(long)]
        unschedulable: bool,
    },
    /// List calibration records
    List {
        #[arg(long = "type")]
        frame_type: Option<FrameType>,
        /// Instrument as site/enclosure/telescope/camera
        #[arg(long)]
        instrument: Option<InstrumentId>,
        /// Only master calibrations
        #[arg(long)]
        masters: bool,
        /// Only records with this status (pending, good, bad)
        #[arg(long)]
        status: Option<CalibrationStatus>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Configuration commands (show, validate)
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Validate,
}

fn parse_time(raw: &str) -> Result<Timestamp, String> {
    parse_timestamp(raw).ok_or_else(|| format!("invalid timestamp: {}", raw))
}
