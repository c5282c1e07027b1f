//! Calibration Comparer
//!
//! Settles every produced calibration from `Pending` to `Good` or `Bad` by
//! comparing it with the latest good calibration of the same group observed
//! strictly earlier. A master is never compared with one of its own members.
//! A calibration with no such baseline is `Bad`.

use crate::config::{ReductionConfig, Thresholds};
use crate::error::ReductionError;
use crate::frame::{Frame, FrameStore};
use crate::grouping::select_attributes;
use crate::registry::{CalibrationRecord, CalibrationRegistry, CalibrationStatus, MasterQuery};
use crate::types::FrameId;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Agreement between a candidate and its baseline, in `[0, 1]`
pub trait AgreementMetric: Send + Sync {
    fn score(&self, candidate: &Frame, baseline: &Frame, thresholds: &Thresholds) -> f64;
}

/// Fraction of pixels unmasked in both frames whose difference lies within
/// `max(abs_tolerance, rel_tolerance * |baseline|)`. Frames of different
/// shape score zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelAgreement;

impl AgreementMetric for PixelAgreement {
    fn score(&self, candidate: &Frame, baseline: &Frame, thresholds: &Thresholds) -> f64 {
        if candidate.shape() != baseline.shape() {
            return 0.0;
        }
        let mut compared = 0usize;
        let mut agreeing = 0usize;
        let pixels = candidate
            .data
            .iter()
            .zip(candidate.mask.iter())
            .zip(baseline.data.iter().zip(baseline.mask.iter()));
        for ((c, cm), (b, bm)) in pixels {
            if *cm != 0 || *bm != 0 {
                continue;
            }
            compared += 1;
            let (c, b) = (*c as f64, *b as f64);
            let tolerance = thresholds.abs_tolerance.max(thresholds.rel_tolerance * b.abs());
            if (c - b).abs() <= tolerance {
                agreeing += 1;
            }
        }
        if compared == 0 {
            return 0.0;
        }
        agreeing as f64 / compared as f64
    }
}

/// Outcome of evaluating one calibration
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub frame_id: FrameId,
    pub status: CalibrationStatus,
    pub score: Option<f64>,
    pub baseline: Option<FrameId>,
}

impl Verdict {
    /// Verdict reflecting a record that was already settled.
    pub fn settled(record: &CalibrationRecord) -> Self {
        Self {
            frame_id: record.frame_id.clone(),
            status: record.status,
            score: None,
            baseline: None,
        }
    }

    pub fn is_good(&self) -> bool {
        self.status == CalibrationStatus::Good
    }
}

pub struct CalibrationComparer {
    registry: Arc<CalibrationRegistry>,
    frames: Arc<dyn FrameStore>,
    config: Arc<ReductionConfig>,
    metric: Arc<dyn AgreementMetric>,
}

impl CalibrationComparer {
    pub fn new(
        registry: Arc<CalibrationRegistry>,
        frames: Arc<dyn FrameStore>,
        config: Arc<ReductionConfig>,
    ) -> Self {
        Self::with_metric(registry, frames, config, Arc::new(PixelAgreement))
    }

    pub fn with_metric(
        registry: Arc<CalibrationRegistry>,
        frames: Arc<dyn FrameStore>,
        config: Arc<ReductionConfig>,
        metric: Arc<dyn AgreementMetric>,
    ) -> Self {
        Self {
            registry,
            frames,
            config,
            metric,
        }
    }

    /// Decide the verdict for `candidate` without changing the registry.
    pub fn evaluate(&self, candidate: &CalibrationRecord) -> Result<Verdict, ReductionError> {
        let keys = self.registry.grouping().keys_for(candidate.frame_type);
        let attributes = select_attributes(&candidate.frame_id, &candidate.attributes, keys)?;
        let query = MasterQuery::before(
            candidate.frame_type,
            candidate.instrument.clone(),
            attributes,
            candidate.observed_at,
        )
        .excluding(&candidate.members);

        let Some(baseline) = self.registry.query_master(&query)? else {
            warn!(
                frame_id = %candidate.frame_id,
                frame_type = %candidate.frame_type,
                instrument = %candidate.instrument,
                "No baseline master; calibration marked bad"
            );
            return Ok(Verdict {
                frame_id: candidate.frame_id.clone(),
                status: CalibrationStatus::Bad,
                score: None,
                baseline: None,
            });
        };

        let candidate_frame = self.load(candidate)?;
        let baseline_frame = self.load(&baseline)?;
        let thresholds = self.config.comparison.thresholds_for(candidate.frame_type);
        let score = self.metric.score(&candidate_frame, &baseline_frame, &thresholds);
        let status = if score >= thresholds.min_agreement {
            CalibrationStatus::Good
        } else {
            CalibrationStatus::Bad
        };
        debug!(
            frame_id = %candidate.frame_id,
            baseline = %baseline.frame_id,
            score,
            min_agreement = thresholds.min_agreement,
            "Compared calibration with baseline"
        );
        Ok(Verdict {
            frame_id: candidate.frame_id.clone(),
            status,
            score: Some(score),
            baseline: Some(baseline.frame_id),
        })
    }

    /// Evaluate a pending record and apply the verdict. Records that are
    /// already settled are reported as they stand.
    pub fn settle(&self, frame_id: &FrameId) -> Result<Verdict, ReductionError> {
        let record = self
            .registry
            .get(frame_id)?
            .ok_or_else(|| ReductionError::NotFound(format!("calibration record {}", frame_id)))?;
        if record.status != CalibrationStatus::Pending {
            return Ok(Verdict::settled(&record));
        }

        let verdict = self.evaluate(&record)?;
        match verdict.status {
            CalibrationStatus::Good => self.registry.mark_good(frame_id)?,
            _ => self.registry.mark_bad(frame_id)?,
        }
        info!(
            frame_id = %frame_id,
            status = %verdict.status,
            score = ?verdict.score,
            baseline = ?verdict.baseline.as_ref().map(FrameId::as_str),
            "Calibration settled"
        );
        Ok(verdict)
    }

    fn load(&self, record: &CalibrationRecord) -> Result<Frame, ReductionError> {
        let raw = self.frames.read(&record.location)?;
        Frame::from_raw(raw, record.frame_id.as_str(), &self.config.header_defaults)
    }
}
