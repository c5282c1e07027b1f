//! Pipeline execution
//!
//! Runs a fixed stage order over one frame or a batch. A critical failure
//! removes the affected frames from the output; nothing partial survives.
//! Best-effort stages run on a copy so a failure leaves the frame as it was
//! before the stage.

use crate::error::ReductionError;
use crate::frame::Frame;
use crate::grouping::{check_homogeneity, group_key, GroupKey};
use crate::stage::{Criticality, MultiFrameStage, SingleFrameStage, Stage, StageContext};
use crate::types::{FrameId, FrameType};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub struct PlannedStage {
    pub name: String,
    pub stage: Stage,
    pub criticality: Criticality,
}

/// Frames dropped by one stage
#[derive(Debug)]
pub struct StageFailure {
    pub stage: String,
    pub frame_ids: Vec<FrameId>,
    pub error: ReductionError,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub outputs: Vec<Frame>,
    pub failures: Vec<StageFailure>,
}

pub struct Pipeline {
    frame_type: FrameType,
    stages: Vec<PlannedStage>,
}

impl Pipeline {
    pub fn new(frame_type: FrameType, stages: Vec<PlannedStage>) -> Self {
        Self { frame_type, stages }
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one frame through every stage.
    pub fn run(&self, frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        let frame_id = frame.frame_id().clone();
        let mut outcome = self.run_batch(vec![frame], ctx);
        if let Some(failure) = outcome.failures.pop() {
            return Err(failure.error);
        }
        match outcome.outputs.len() {
            1 => Ok(outcome.outputs.remove(0)),
            n => Err(ReductionError::processing(
                "pipeline",
                format!("{} produced {} frames instead of one", frame_id, n),
            )),
        }
    }

    /// Run a batch of frames. Single-frame stages see each frame on its own;
    /// multi-frame stages see one attribute group at a time.
    pub fn run_batch(&self, frames: Vec<Frame>, ctx: &StageContext) -> BatchOutcome {
        let mut current = frames;
        let mut failures = Vec::new();

        for planned in &self.stages {
            current = match &planned.stage {
                Stage::Single(stage) => current
                    .into_iter()
                    .filter_map(|frame| match apply_single(planned, stage.as_ref(), frame, ctx) {
                        Ok(frame) => Some(frame),
                        Err(failure) => {
                            failures.push(failure);
                            None
                        }
                    })
                    .collect(),
                Stage::Multi(stage) => apply_multi(planned, stage.as_ref(), current, ctx, &mut failures),
            };
            if current.is_empty() {
                break;
            }
        }

        BatchOutcome {
            outputs: current,
            failures,
        }
    }
}

fn apply_single(
    planned: &PlannedStage,
    stage: &dyn SingleFrameStage,
    frame: Frame,
    ctx: &StageContext,
) -> Result<Frame, StageFailure> {
    let frame_id = frame.frame_id().clone();

    match planned.criticality {
        Criticality::Critical => match stage.apply(frame, ctx) {
            Ok(mut frame) => {
                frame.history.push(planned.name.clone());
                debug!(frame_id = %frame_id, stage = %planned.name, "Stage complete");
                Ok(frame)
            }
            Err(error) => {
                warn!(frame_id = %frame_id, stage = %planned.name, error = %error, "Stage failed; dropping frame");
                Err(StageFailure {
                    stage: planned.name.clone(),
                    frame_ids: vec![frame_id],
                    error,
                })
            }
        },
        Criticality::BestEffort => match stage.apply(frame.clone(), ctx) {
            Ok(mut updated) => {
                updated.history.push(planned.name.clone());
                Ok(updated)
            }
            Err(error) => {
                warn!(frame_id = %frame_id, stage = %planned.name, error = %error, "Best-effort stage failed; continuing");
                Ok(frame)
            }
        },
    }
}

fn apply_multi(
    planned: &PlannedStage,
    stage: &dyn MultiFrameStage,
    frames: Vec<Frame>,
    ctx: &StageContext,
    failures: &mut Vec<StageFailure>,
) -> Vec<Frame> {
    let mut groups: BTreeMap<GroupKey, Vec<Frame>> = BTreeMap::new();
    for frame in frames {
        let keys = ctx.registry.grouping().keys_for(frame.frame_type());
        match group_key(&frame, keys) {
            Ok(key) => groups.entry(key).or_default().push(frame),
            Err(error) => failures.push(StageFailure {
                stage: planned.name.clone(),
                frame_ids: vec![frame.frame_id().clone()],
                error,
            }),
        }
    }

    let mut outputs = Vec::new();
    for (key, group) in groups {
        let frame_ids: Vec<FrameId> = group.iter().map(|f| f.frame_id().clone()).collect();
        let keys = ctx.registry.grouping().keys_for(key.frame_type);
        let (input, fallback) = match planned.criticality {
            Criticality::Critical => (group, None),
            Criticality::BestEffort => (group.clone(), Some(group)),
        };
        let result = check_homogeneity(&input, keys).and_then(|_| stage.apply(input, ctx));

        match (result, planned.criticality) {
            (Ok(produced), _) => {
                debug!(group = %key, stage = %planned.name, produced = produced.len(), "Group stage complete");
                outputs.extend(produced.into_iter().map(|mut f| {
                    f.history.push(planned.name.clone());
                    f
                }));
            }
            (Err(error), Criticality::BestEffort) => {
                warn!(group = %key, stage = %planned.name, error = %error, "Best-effort stage failed; continuing");
                outputs.extend(fallback.unwrap_or_default());
            }
            (Err(error), Criticality::Critical) => {
                warn!(group = %key, stage = %planned.name, error = %error, "Group stage failed; dropping group");
                failures.push(StageFailure {
                    stage: planned.name.clone(),
                    frame_ids,
                    error,
                });
            }
        }
    }
    outputs
}
