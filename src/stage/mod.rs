//! Stage model
//!
//! A stage is either single-frame (one frame in, one frame out) or
//! multi-frame (one attribute group in, zero or more frames out). Each stage
//! is declared critical or best-effort; per-type stage lists are data, built
//! by `StageCatalog::plan` from the pipeline configuration.

pub mod builtin;
pub mod pipeline;

pub use pipeline::{BatchOutcome, Pipeline, PlannedStage, StageFailure};

use crate::config::ReductionConfig;
use crate::error::ReductionError;
use crate::frame::{Frame, FrameStore};
use crate::grouping::select_attributes;
use crate::qc::QcSink;
use crate::registry::{CalibrationRecord, CalibrationRegistry, MasterQuery};
use crate::types::{FrameType, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Failure policy of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// A failure drops the frame
    Critical,
    /// A failure is logged and the frame continues unchanged
    BestEffort,
}

/// Consumes and produces exactly one frame
pub trait SingleFrameStage: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError>;
}

/// Consumes one attribute group
pub trait MultiFrameStage: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, frames: Vec<Frame>, ctx: &StageContext) -> Result<Vec<Frame>, ReductionError>;
}

#[derive(Clone)]
pub enum Stage {
    Single(Arc<dyn SingleFrameStage>),
    Multi(Arc<dyn MultiFrameStage>),
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Stage::Single(stage) => stage.name(),
            Stage::Multi(stage) => stage.name(),
        }
    }
}

/// Everything a stage may read while it runs
#[derive(Clone)]
pub struct StageContext {
    pub config: Arc<ReductionConfig>,
    pub registry: Arc<CalibrationRegistry>,
    pub frames: Arc<dyn FrameStore>,
    pub qc: Arc<dyn QcSink>,
    /// When the current reduction started (bounds calibration creation time
    /// under `use_only_older_calibrations`)
    pub started_at: Timestamp,
}

impl StageContext {
    /// Master calibration of `calibration_type` applicable to `frame`.
    ///
    /// Attributes are the calibration type's grouping keys evaluated on the
    /// frame; the frame's observation time bounds the master's. Returns
    /// `None` when no good master exists.
    pub fn find_master(
        &self,
        frame: &Frame,
        calibration_type: FrameType,
    ) -> Result<Option<CalibrationRecord>, ReductionError> {
        let keys = self.registry.grouping().keys_for(calibration_type);
        let attributes = select_attributes(frame.frame_id(), frame.descriptor.attributes(), keys)?;
        let created_before = if self.config.selection.use_only_older_calibrations {
            Some(self.started_at)
        } else {
            None
        };
        let query = MasterQuery::as_of(
            calibration_type,
            frame.descriptor.instrument().clone(),
            attributes,
            frame.descriptor.observed_at(),
        )
        .created_before(created_before);
        self.registry.query_master(&query)
    }

    /// Load the pixels of a calibration record.
    pub fn load_master(&self, record: &CalibrationRecord) -> Result<Frame, ReductionError> {
        debug!(frame_id = %record.frame_id, location = %record.location.display(), "Loading calibration");
        let raw = self.frames.read(&record.location)?;
        Frame::from_raw(raw, record.frame_id.as_str(), &self.config.header_defaults)
    }
}

struct CatalogEntry {
    stage: Stage,
    criticality: Criticality,
}

/// Registered stages by name
#[derive(Default)]
pub struct StageCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl StageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding every built-in stage.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        builtin::register_all(&mut catalog);
        catalog
    }

    /// Register (or replace) a stage under its own name.
    pub fn register(&mut self, stage: Stage, criticality: Criticality) {
        self.entries.insert(
            stage.name().to_string(),
            CatalogEntry { stage, criticality },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stage plan for `frame_type`.
    ///
    /// Stages listed as best-effort in the configuration are downgraded;
    /// an unregistered stage name is a configuration error.
    pub fn plan(&self, frame_type: FrameType, config: &ReductionConfig) -> Result<Pipeline, ReductionError> {
        let mut stages = Vec::new();
        for name in config.pipeline.plan_for(frame_type) {
            let entry = self.entries.get(&name).ok_or_else(|| {
                ReductionError::Config(format!(
                    "unknown stage '{}' in {} plan (registered: {})",
                    name,
                    frame_type,
                    self.names().join(", ")
                ))
            })?;
            let criticality = if config.pipeline.is_best_effort(&name) {
                Criticality::BestEffort
            } else {
                entry.criticality
            };
            stages.push(PlannedStage {
                name,
                stage: entry.stage.clone(),
                criticality,
            });
        }
        Ok(Pipeline::new(frame_type, stages))
    }
}
