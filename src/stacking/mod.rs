//! Stacking Scheduler
//!
//! Turns the good individual calibrations of one instrument and date window
//! into master calibrations, one per attribute group. A job runs only after
//! the readiness oracle reports the window complete; each group is stacked
//! under its own lock, recorded as a pending master and settled by the
//! comparer.

pub mod combine;

pub use combine::{combine_frames, combiner_for, Combiner, Mean, Median, SigmaClip};

use crate::comparer::{CalibrationComparer, Verdict};
use crate::concurrency::LockManager;
use crate::error::ReductionError;
use crate::frame::{Frame, FrameDescriptor};
use crate::grouping::{group_by_attributes, group_key, GroupKey};
use crate::registry::CalibrationRecord;
use crate::stage::{Criticality, MultiFrameStage, Pipeline, PlannedStage, Stage, StageContext};
use crate::types::{Attributes, DateWindow, FrameId, FrameType, InstrumentId};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const STACK: &str = "stack";

/// External signal that a calibration sequence has fully arrived
#[async_trait]
pub trait ReadinessOracle: Send + Sync {
    async fn is_window_complete(
        &self,
        instrument: &InstrumentId,
        frame_type: FrameType,
        window: &DateWindow,
    ) -> Result<bool, ReductionError>;
}

/// Oracle that considers every window complete
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

#[async_trait]
impl ReadinessOracle for AlwaysReady {
    async fn is_window_complete(
        &self,
        _instrument: &InstrumentId,
        _frame_type: FrameType,
        _window: &DateWindow,
    ) -> Result<bool, ReductionError> {
        Ok(true)
    }
}

/// Request to stack one instrument, frame type and window
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackingJob {
    pub instrument: InstrumentId,
    pub frame_type: FrameType,
    pub window: DateWindow,
    /// Restack even if a good master already exists for the window
    #[serde(default)]
    pub force: bool,
}

impl StackingJob {
    pub fn new(instrument: InstrumentId, frame_type: FrameType, window: DateWindow) -> Self {
        Self {
            instrument,
            frame_type,
            window,
            force: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug)]
pub enum GroupOutcome {
    /// A master was produced (or an identical one already existed) and settled
    Stacked { master: FrameId, verdict: Verdict },
    /// A good master already covers this window
    Skipped { master: FrameId },
    /// Too few usable frames
    Insufficient { usable: usize, required: usize },
    /// Stacking this group failed; prior masters are untouched
    Failed { error: ReductionError },
}

#[derive(Debug)]
pub struct GroupReport {
    pub key: GroupKey,
    pub outcome: GroupOutcome,
}

#[derive(Debug)]
pub enum StackingOutcome {
    /// The oracle reported the window incomplete, or could not be reached
    NotReady,
    Completed(Vec<GroupReport>),
}

impl StackingOutcome {
    /// Masters produced or confirmed by this run
    pub fn stacked(&self) -> Vec<&FrameId> {
        match self {
            StackingOutcome::NotReady => Vec::new(),
            StackingOutcome::Completed(reports) => reports
                .iter()
                .filter_map(|r| match &r.outcome {
                    GroupOutcome::Stacked { master, .. } => Some(master),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// Deterministic identity of the master stacked from `members` (sorted) for
/// `key` over `window`.
pub fn master_id(key: &GroupKey, window: &DateWindow, members: &[FrameId]) -> FrameId {
    let mut hasher = blake3::Hasher::new();
    for member in members {
        hasher.update(member.as_str().as_bytes());
        hasher.update(&[0]);
    }
    let digest = hasher.finalize().to_hex();
    let mut id = format!(
        "{}-{}-{}",
        key.instrument.camera,
        key.frame_type.as_str().to_ascii_lowercase(),
        window.start.format("%Y%m%d")
    );
    for (_, value) in &key.values {
        id.push('-');
        id.extend(
            value
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }),
        );
    }
    id.push('-');
    id.push_str(&digest[..12]);
    FrameId::new(id)
}

/// Attributes every frame in `frames` agrees on
fn shared_attributes(frames: &[Frame]) -> Attributes {
    let Some(first) = frames.first() else {
        return Attributes::new();
    };
    first
        .descriptor
        .attributes()
        .iter()
        .filter(|(key, value)| {
            frames[1..]
                .iter()
                .all(|f| f.descriptor.attribute(key) == Some(value.as_str()))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Multi-frame stage combining one attribute group into a master
pub struct StackStage {
    window: DateWindow,
    combiner: Arc<dyn Combiner>,
}

impl StackStage {
    pub fn new(window: DateWindow, combiner: Arc<dyn Combiner>) -> Self {
        Self { window, combiner }
    }
}

impl MultiFrameStage for StackStage {
    fn name(&self) -> &str {
        STACK
    }

    fn apply(&self, frames: Vec<Frame>, ctx: &StageContext) -> Result<Vec<Frame>, ReductionError> {
        let first = frames
            .first()
            .ok_or_else(|| ReductionError::processing(STACK, "empty group"))?;
        let key = group_key(first, ctx.registry.grouping().keys_for(first.frame_type()))?;
        let mut members: Vec<FrameId> = frames.iter().map(|f| f.frame_id().clone()).collect();
        members.sort();

        let (data, mask) = combine_frames(&frames, self.combiner.as_ref())?;
        let exposure_time = frames
            .iter()
            .map(|f| f.descriptor.exposure_time())
            .sum::<f64>()
            / frames.len() as f64;
        let observed_at = frames
            .iter()
            .map(|f| f.descriptor.observed_at())
            .max()
            .unwrap_or(self.window.start);
        let descriptor = FrameDescriptor::master(
            master_id(&key, &self.window, &members),
            key.instrument.clone(),
            key.frame_type,
            observed_at,
            exposure_time,
            shared_attributes(&frames),
        )
        .reduced(1);

        let mut master = Frame::new(descriptor, data);
        master.mask = mask;
        master
            .qc
            .insert("stacked_frames".to_string(), frames.len() as f64);
        info!(
            master = %master.frame_id(),
            group = %key,
            frames = frames.len(),
            combiner = self.combiner.name(),
            "Stacked master calibration"
        );
        Ok(vec![master])
    }
}

pub struct StackingScheduler {
    ctx: StageContext,
    oracle: Arc<dyn ReadinessOracle>,
    comparer: Arc<CalibrationComparer>,
    combiner: Arc<dyn Combiner>,
    locks: LockManager,
}

impl StackingScheduler {
    pub fn new(
        ctx: StageContext,
        oracle: Arc<dyn ReadinessOracle>,
        comparer: Arc<CalibrationComparer>,
    ) -> Self {
        let combiner: Arc<dyn Combiner> = Arc::from(combiner_for(&ctx.config.stacking));
        Self {
            ctx,
            oracle,
            comparer,
            combiner,
            locks: LockManager::new(),
        }
    }

    pub fn with_combiner(mut self, combiner: Arc<dyn Combiner>) -> Self {
        self.combiner = combiner;
        self
    }

    /// Run a job: ask the oracle, then stack every group in the window on
    /// the blocking pool.
    ///
    /// Oracle failures are reported as `NotReady` and leave the registry
    /// untouched.
    pub async fn run(self: &Arc<Self>, job: &StackingJob) -> Result<StackingOutcome, ReductionError> {
        if !FrameType::STACKABLE.contains(&job.frame_type) {
            return Err(ReductionError::Config(format!(
                "{} frames are not stacked",
                job.frame_type
            )));
        }
        if job.window.is_empty() {
            return Err(ReductionError::Config(format!(
                "empty stacking window {}",
                job.window
            )));
        }

        match self
            .oracle
            .is_window_complete(&job.instrument, job.frame_type, &job.window)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    instrument = %job.instrument,
                    frame_type = %job.frame_type,
                    window = %job.window,
                    "Calibration window not complete"
                );
                return Ok(StackingOutcome::NotReady);
            }
            Err(error) => {
                warn!(
                    instrument = %job.instrument,
                    frame_type = %job.frame_type,
                    window = %job.window,
                    error = %error,
                    "Readiness oracle failed; treating window as not ready"
                );
                return Ok(StackingOutcome::NotReady);
            }
        }

        let scheduler = Arc::clone(self);
        let blocking_job = job.clone();
        let reports = tokio::task::spawn_blocking(move || scheduler.stack_window(&blocking_job))
            .await
            .map_err(|e| ReductionError::processing(STACK, format!("stacking task failed: {}", e)))??;
        Ok(StackingOutcome::Completed(reports))
    }

    /// Stack every attribute group of the window without consulting the
    /// oracle. Group failures are reported per group; only retryable
    /// failures abort the job.
    pub fn stack_window(&self, job: &StackingJob) -> Result<Vec<GroupReport>, ReductionError> {
        let registry = &self.ctx.registry;
        let records = registry.query_individuals(
            job.frame_type,
            &job.instrument,
            &Attributes::new(),
            &job.window,
        )?;
        let groups = group_by_attributes(records, registry.grouping())?;
        debug!(
            instrument = %job.instrument,
            frame_type = %job.frame_type,
            groups = groups.len(),
            "Stacking window"
        );

        let mut reports = Vec::with_capacity(groups.len());
        for (key, members) in groups {
            let outcome = match self.stack_group(job, &key, members) {
                Ok(outcome) => outcome,
                Err(error) if error.is_retryable() => return Err(error),
                Err(error) => {
                    warn!(group = %key, error = %error, "Stacking failed for group");
                    GroupOutcome::Failed { error }
                }
            };
            reports.push(GroupReport { key, outcome });
        }
        Ok(reports)
    }

    fn stack_group(
        &self,
        job: &StackingJob,
        key: &GroupKey,
        records: Vec<CalibrationRecord>,
    ) -> Result<GroupOutcome, ReductionError> {
        let lock_key = format!("{}|{}", key, job.window.start.to_rfc3339());
        self.locks
            .with_write_lock(&lock_key, || self.stack_group_locked(job, key, records))
    }

    fn stack_group_locked(
        &self,
        job: &StackingJob,
        key: &GroupKey,
        records: Vec<CalibrationRecord>,
    ) -> Result<GroupOutcome, ReductionError> {
        let registry = &self.ctx.registry;
        let existing =
            registry.masters_for_window(key.frame_type, &key.instrument, &key.attributes(), &job.window)?;
        let current: Vec<&CalibrationRecord> =
            existing.iter().filter(|r| r.superseded_by.is_none()).collect();
        if !job.force {
            if let Some(good) = current.iter().find(|r| r.is_good()) {
                debug!(group = %key, master = %good.frame_id, "Good master exists; skipping");
                return Ok(GroupOutcome::Skipped {
                    master: good.frame_id.clone(),
                });
            }
        }

        let usable: Vec<CalibrationRecord> = records
            .into_iter()
            .filter(|r| {
                if r.frame_type == FrameType::Dark && r.exposure_time <= 0.0 {
                    warn!(frame_id = %r.frame_id, "Excluding zero-exposure dark from stack");
                    false
                } else {
                    true
                }
            })
            .collect();
        let required = self.ctx.config.stacking.min_frames_for(key.frame_type).max(1);
        if usable.len() < required {
            info!(group = %key, usable = usable.len(), required, "Not enough frames to stack");
            return Ok(GroupOutcome::Insufficient {
                usable: usable.len(),
                required,
            });
        }

        let mut members: Vec<FrameId> = usable.iter().map(|r| r.frame_id.clone()).collect();
        members.sort();
        let id = master_id(key, &job.window, &members);
        if registry.get(&id)?.is_some() {
            debug!(group = %key, master = %id, "Identical stack already recorded");
            let verdict = self.comparer.settle(&id)?;
            return Ok(GroupOutcome::Stacked { master: id, verdict });
        }

        let frames = usable
            .iter()
            .map(|r| self.ctx.load_master(r))
            .collect::<Result<Vec<_>, _>>()?;
        let pipeline = Pipeline::new(
            key.frame_type,
            vec![PlannedStage {
                name: STACK.to_string(),
                stage: Stage::Multi(Arc::new(StackStage::new(job.window, Arc::clone(&self.combiner)))),
                criticality: Criticality::Critical,
            }],
        );
        let mut batch = pipeline.run_batch(frames, &self.ctx);
        if let Some(failure) = batch.failures.pop() {
            return Err(failure.error);
        }
        let master = match (batch.outputs.pop(), batch.outputs.is_empty()) {
            (Some(master), true) => master,
            _ => {
                return Err(ReductionError::processing(
                    STACK,
                    format!("group {} did not produce exactly one master", key),
                ))
            }
        };

        let location = self.ctx.frames.write(&master)?;
        let mut record = CalibrationRecord::from_frame(&master, location, Utc::now());
        record.window = Some(job.window);
        record.members = members;
        registry.record(record)?;

        for prior in current {
            if prior.frame_id != id {
                registry.mark_superseded(&prior.frame_id, &id)?;
            }
        }

        let verdict = self.comparer.settle(&id)?;
        Ok(GroupOutcome::Stacked { master: id, verdict })
    }
}
