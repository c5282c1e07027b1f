//! Configuration System
//!
//! Layered configuration for the reduction system: built-in defaults, the
//! global user file, workspace files and `DARKROOM__*` environment variables.
//! The loaded `ReductionConfig` is immutable and passed explicitly (as
//! `Arc<ReductionConfig>`) to everything that needs it.

use crate::frame::HeaderDefaults;
use crate::grouping::GroupingPolicy;
use crate::instrument::{InstrumentCriterion, InstrumentSelection};
use crate::logging::LoggingConfig;
use crate::types::FrameType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReductionConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub grouping: GroupingPolicy,

    #[serde(default)]
    pub stacking: StackingConfig,

    #[serde(default)]
    pub comparison: ComparisonConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub header_defaults: HeaderDefaults,

    #[serde(default)]
    pub pixels: PixelConfig,
}

/// Storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled database holding the registry, instrument table and ledger
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Root directory for reduced products
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".darkroom/registry")
}

fn default_archive_root() -> PathBuf {
    PathBuf::from(".darkroom/archive")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            archive_root: default_archive_root(),
        }
    }
}

/// Stage ordering.
///
/// A frame type runs `ordered_stages` up to and including its `last_stage`
/// (all of them when it has none), followed by its `extra_stages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_ordered_stages")]
    pub ordered_stages: Vec<String>,

    #[serde(default = "default_last_stage")]
    pub last_stage: BTreeMap<FrameType, String>,

    #[serde(default = "default_extra_stages")]
    pub extra_stages: BTreeMap<FrameType, Vec<String>>,

    /// Stages whose failure is logged and skipped instead of dropping the frame
    #[serde(default = "default_best_effort")]
    pub best_effort: Vec<String>,
}

fn default_ordered_stages() -> Vec<String> {
    [
        "header_sanity",
        "saturation_qc",
        "overscan",
        "trim",
        "bpm",
        "bias",
        "dark",
        "flat",
        "qc_record",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_last_stage() -> BTreeMap<FrameType, String> {
    let mut last = BTreeMap::new();
    last.insert(FrameType::Bias, "bpm".to_string());
    last.insert(FrameType::Dark, "bias".to_string());
    last.insert(FrameType::Flat, "dark".to_string());
    last.insert(FrameType::Bpm, "trim".to_string());
    last
}

fn default_extra_stages() -> BTreeMap<FrameType, Vec<String>> {
    let mut extra = BTreeMap::new();
    extra.insert(FrameType::Bias, vec!["bias_level".to_string()]);
    extra.insert(FrameType::Dark, vec!["dark_normalize".to_string()]);
    extra.insert(FrameType::Flat, vec!["flat_normalize".to_string()]);
    extra
}

fn default_best_effort() -> Vec<String> {
    vec!["saturation_qc".to_string(), "qc_record".to_string()]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ordered_stages: default_ordered_stages(),
            last_stage: default_last_stage(),
            extra_stages: default_extra_stages(),
            best_effort: default_best_effort(),
        }
    }
}

impl PipelineConfig {
    /// Stage names a frame of `frame_type` runs through, in order.
    pub fn plan_for(&self, frame_type: FrameType) -> Vec<String> {
        let mut plan = Vec::new();
        let last = self.last_stage.get(&frame_type);
        for stage in &self.ordered_stages {
            plan.push(stage.clone());
            if Some(stage) == last {
                break;
            }
        }
        if let Some(extra) = self.extra_stages.get(&frame_type) {
            plan.extend(extra.iter().cloned());
        }
        plan
    }

    pub fn is_best_effort(&self, stage: &str) -> bool {
        self.best_effort.iter().any(|s| s == stage)
    }

    fn validate(&self) -> Result<(), String> {
        if self.ordered_stages.is_empty() {
            return Err("ordered_stages cannot be empty".to_string());
        }
        let mut seen = BTreeSet::new();
        for stage in &self.ordered_stages {
            if !seen.insert(stage.as_str()) {
                return Err(format!("stage '{}' listed twice in ordered_stages", stage));
            }
        }
        for (frame_type, last) in &self.last_stage {
            if !seen.contains(last.as_str()) {
                return Err(format!(
                    "last stage '{}' for {} is not in ordered_stages",
                    last, frame_type
                ));
            }
        }
        Ok(())
    }
}

/// Pixel combination algorithm for masters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMethod {
    SigmaClip,
    Mean,
    Median,
}

/// Stacking policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackingConfig {
    /// Minimum usable frames for a master
    #[serde(default = "default_min_frames")]
    pub min_frames: usize,

    /// Per-type overrides of `min_frames`
    #[serde(default)]
    pub min_frames_by_type: BTreeMap<FrameType, usize>,

    #[serde(default = "default_combine_method")]
    pub method: CombineMethod,

    /// Rejection passes for sigma clipping
    #[serde(default = "default_clip_iterations")]
    pub clip_iterations: usize,

    /// Rejection threshold in standard deviations
    #[serde(default = "default_clip_sigma")]
    pub clip_sigma: f32,
}

fn default_min_frames() -> usize {
    1
}

fn default_combine_method() -> CombineMethod {
    CombineMethod::SigmaClip
}

fn default_clip_iterations() -> usize {
    2
}

fn default_clip_sigma() -> f32 {
    2.5
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            min_frames: default_min_frames(),
            min_frames_by_type: BTreeMap::new(),
            method: default_combine_method(),
            clip_iterations: default_clip_iterations(),
            clip_sigma: default_clip_sigma(),
        }
    }
}

impl StackingConfig {
    pub fn min_frames_for(&self, frame_type: FrameType) -> usize {
        self.min_frames_by_type
            .get(&frame_type)
            .copied()
            .unwrap_or(self.min_frames)
    }
}

/// Agreement thresholds for one frame type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Minimum agreement score (0..=1) for a GOOD verdict
    #[serde(default = "default_min_agreement")]
    pub min_agreement: f64,

    /// Absolute per-pixel tolerance
    #[serde(default = "default_abs_tolerance")]
    pub abs_tolerance: f64,

    /// Relative per-pixel tolerance, as a fraction of the baseline value
    #[serde(default = "default_rel_tolerance")]
    pub rel_tolerance: f64,
}

fn default_min_agreement() -> f64 {
    0.95
}

fn default_abs_tolerance() -> f64 {
    5.0
}

fn default_rel_tolerance() -> f64 {
    0.05
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_agreement: default_min_agreement(),
            abs_tolerance: default_abs_tolerance(),
            rel_tolerance: default_rel_tolerance(),
        }
    }
}

impl Thresholds {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_agreement) {
            return Err(format!(
                "min_agreement {} must be within 0..=1",
                self.min_agreement
            ));
        }
        if self.abs_tolerance < 0.0 || self.rel_tolerance < 0.0 {
            return Err("tolerances cannot be negative".to_string());
        }
        Ok(())
    }
}

/// Comparer thresholds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComparisonConfig {
    #[serde(default)]
    pub default: Thresholds,

    #[serde(default)]
    pub by_type: BTreeMap<FrameType, Thresholds>,
}

impl ComparisonConfig {
    pub fn thresholds_for(&self, frame_type: FrameType) -> Thresholds {
        self.by_type.get(&frame_type).copied().unwrap_or(self.default)
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_frame_workers")]
    pub frame_workers: usize,

    #[serde(default = "default_stacking_workers")]
    pub stacking_workers: usize,

    /// Attempts per task, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_frame_workers() -> usize {
    4
}

fn default_stacking_workers() -> usize {
    1
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_queue_size() -> usize {
    10_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            frame_workers: default_frame_workers(),
            stacking_workers: default_stacking_workers(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

/// Which frames and instruments are reduced, and with which calibrations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Camera types (substrings) that are never reduced
    #[serde(default = "default_excluded_camera_types")]
    pub exclude_camera_types: Vec<String>,

    /// Camera types (substrings) that must match, when non-empty
    #[serde(default)]
    pub require_camera_types: Vec<String>,

    #[serde(default)]
    pub ignore_schedulability: bool,

    /// Reduction attempts per raw file before it is left alone
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Only apply calibrations created before the frame was reduced
    #[serde(default)]
    pub use_only_older_calibrations: bool,

    /// Fail science/calibration reduction when no bad pixel mask exists
    #[serde(default)]
    pub require_bpm: bool,
}

fn default_excluded_camera_types() -> Vec<String> {
    vec!["FLOYDS".to_string(), "NRES".to_string()]
}

fn default_max_tries() -> u32 {
    5
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            exclude_camera_types: default_excluded_camera_types(),
            require_camera_types: Vec::new(),
            ignore_schedulability: false,
            max_tries: default_max_tries(),
            use_only_older_calibrations: false,
            require_bpm: false,
        }
    }
}

impl SelectionConfig {
    pub fn instrument_selection(&self) -> InstrumentSelection {
        let criteria = self
            .require_camera_types
            .iter()
            .map(|s| InstrumentCriterion::CameraTypeContains(s.clone()))
            .chain(
                self.exclude_camera_types
                    .iter()
                    .map(|s| InstrumentCriterion::CameraTypeExcludes(s.clone())),
            )
            .collect();
        InstrumentSelection {
            criteria,
            ignore_schedulability: self.ignore_schedulability,
        }
    }
}

/// Pixel-level parameters used by the built-in stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelConfig {
    /// Overscan columns at the right edge of raw frames (0 disables overscan)
    #[serde(default)]
    pub overscan_columns: usize,

    #[serde(default = "default_saturation_level")]
    pub saturation_level: f32,

    /// Fraction of saturated pixels above which a warning is logged
    #[serde(default = "default_saturation_warn_fraction")]
    pub saturation_warn_fraction: f64,
}

fn default_saturation_level() -> f32 {
    65_535.0
}

fn default_saturation_warn_fraction() -> f64 {
    0.05
}

impl Default for PixelConfig {
    fn default() -> Self {
        Self {
            overscan_columns: 0,
            saturation_level: default_saturation_level(),
            saturation_warn_fraction: default_saturation_warn_fraction(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Storage(String),
    Pipeline(String),
    Stacking(String),
    Comparison(String),
    Queue(String),
    Selection(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Pipeline(msg) => write!(f, "Pipeline: {}", msg),
            ValidationError::Stacking(msg) => write!(f, "Stacking: {}", msg),
            ValidationError::Comparison(msg) => write!(f, "Comparison: {}", msg),
            ValidationError::Queue(msg) => write!(f, "Queue: {}", msg),
            ValidationError::Selection(msg) => write!(f, "Selection: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl ReductionConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.storage.db_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("db_path cannot be empty".to_string()));
        }
        if self.storage.archive_root.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "archive_root cannot be empty".to_string(),
            ));
        }

        if let Err(e) = self.pipeline.validate() {
            errors.push(ValidationError::Pipeline(e));
        }

        if self.stacking.min_frames == 0
            || self.stacking.min_frames_by_type.values().any(|n| *n == 0)
        {
            errors.push(ValidationError::Stacking(
                "minimum frame counts must be at least 1".to_string(),
            ));
        }
        if !(self.stacking.clip_sigma > 0.0) {
            errors.push(ValidationError::Stacking(format!(
                "clip_sigma {} must be positive",
                self.stacking.clip_sigma
            )));
        }

        if let Err(e) = self.comparison.default.validate() {
            errors.push(ValidationError::Comparison(format!("default: {}", e)));
        }
        for (frame_type, thresholds) in &self.comparison.by_type {
            if let Err(e) = thresholds.validate() {
                errors.push(ValidationError::Comparison(format!("{}: {}", frame_type, e)));
            }
        }

        if self.queue.frame_workers == 0 || self.queue.stacking_workers == 0 {
            errors.push(ValidationError::Queue(
                "each lane needs at least one worker".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            errors.push(ValidationError::Queue(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.selection.max_tries == 0 {
            errors.push(ValidationError::Selection(
                "max_tries must be at least 1".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
