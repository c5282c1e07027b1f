//! Built-in single-frame stages.
//!
//! Pixel arithmetic is plain; each stage is defined by which calibration it
//! looks up and how it fails.

use crate::error::ReductionError;
use crate::frame::{Frame, MASK_BAD_PIXEL, MASK_SATURATED};
use crate::qc::QcSummary;
use crate::registry::CalibrationRecord;
use crate::stage::{Criticality, SingleFrameStage, Stage, StageCatalog, StageContext};
use crate::types::FrameType;
use ndarray::{s, Zip};
use std::sync::Arc;
use tracing::{debug, warn};

pub const HEADER_SANITY: &str = "header_sanity";
pub const SATURATION_QC: &str = "saturation_qc";
pub const OVERSCAN: &str = "overscan";
pub const TRIM: &str = "trim";
pub const BPM: &str = "bpm";
pub const BIAS: &str = "bias";
pub const DARK: &str = "dark";
pub const FLAT: &str = "flat";
pub const QC_RECORD: &str = "qc_record";
pub const BIAS_LEVEL: &str = "bias_level";
pub const DARK_NORMALIZE: &str = "dark_normalize";
pub const FLAT_NORMALIZE: &str = "flat_normalize";

/// Register every built-in stage with its default criticality.
pub fn register_all(catalog: &mut StageCatalog) {
    let critical: Vec<Arc<dyn SingleFrameStage>> = vec![
        Arc::new(HeaderSanity),
        Arc::new(Overscan),
        Arc::new(Trim),
        Arc::new(BadPixelMask),
        Arc::new(BiasSubtract),
        Arc::new(DarkSubtract),
        Arc::new(FlatDivide),
        Arc::new(BiasLevel),
        Arc::new(DarkNormalize),
        Arc::new(FlatNormalize),
    ];
    for stage in critical {
        catalog.register(Stage::Single(stage), Criticality::Critical);
    }
    catalog.register(Stage::Single(Arc::new(SaturationQc)), Criticality::BestEffort);
    catalog.register(Stage::Single(Arc::new(QcRecord)), Criticality::BestEffort);
}

/// Master of `calibration_type` for `frame`, with pixels loaded and shape
/// checked. A missing master is `NotFound`.
fn require_master(
    frame: &Frame,
    ctx: &StageContext,
    calibration_type: FrameType,
    stage: &str,
) -> Result<(CalibrationRecord, Frame), ReductionError> {
    let record = ctx.find_master(frame, calibration_type)?.ok_or_else(|| {
        ReductionError::NotFound(format!(
            "no good master {} for {} on {}",
            calibration_type,
            frame.frame_id(),
            frame.descriptor.instrument()
        ))
    })?;
    let master = load_checked(frame, ctx, &record, stage)?;
    Ok((record, master))
}

fn load_checked(
    frame: &Frame,
    ctx: &StageContext,
    record: &CalibrationRecord,
    stage: &str,
) -> Result<Frame, ReductionError> {
    let master = ctx.load_master(record)?;
    if master.shape() != frame.shape() {
        return Err(ReductionError::processing(
            stage,
            format!(
                "master {} has shape {:?}, frame {} has {:?}",
                record.frame_id,
                master.shape(),
                frame.frame_id(),
                frame.shape()
            ),
        ));
    }
    debug!(frame_id = %frame.frame_id(), master = %record.frame_id, stage, "Applying calibration");
    Ok(master)
}

fn unmasked_mean(frame: &Frame) -> Option<f64> {
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for (value, mask) in frame.data.iter().zip(frame.mask.iter()) {
        if *mask == 0 {
            sum += *value as f64;
            n += 1;
        }
    }
    (n > 0).then(|| sum / n as f64)
}

/// Rejects frames whose metadata or pixels cannot be trusted
pub struct HeaderSanity;

impl SingleFrameStage for HeaderSanity {
    fn name(&self) -> &str {
        HEADER_SANITY
    }

    fn apply(&self, frame: Frame, _ctx: &StageContext) -> Result<Frame, ReductionError> {
        if frame.data.iter().any(|v| !v.is_finite()) {
            return Err(ReductionError::corrupt(
                frame.frame_id(),
                "pixel data contains non-finite values",
            ));
        }
        let needs_exposure = matches!(frame.frame_type(), FrameType::Flat | FrameType::Science);
        if needs_exposure && frame.descriptor.exposure_time() <= 0.0 {
            return Err(ReductionError::corrupt(
                frame.frame_id(),
                format!(
                    "{} frame has exposure time {}",
                    frame.frame_type(),
                    frame.descriptor.exposure_time()
                ),
            ));
        }
        Ok(frame)
    }
}

/// Flags saturated pixels
pub struct SaturationQc;

impl SingleFrameStage for SaturationQc {
    fn name(&self) -> &str {
        SATURATION_QC
    }

    fn apply(&self, mut frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        let level = ctx.config.pixels.saturation_level;
        if level <= 0.0 {
            return Err(ReductionError::processing(
                SATURATION_QC,
                format!("saturation level {} is not positive", level),
            ));
        }
        let mut saturated = 0usize;
        Zip::from(&mut frame.mask).and(&frame.data).for_each(|m, v| {
            if *v >= level {
                *m |= MASK_SATURATED;
                saturated += 1;
            }
        });
        let fraction = saturated as f64 / frame.data.len() as f64;
        frame.qc.insert("saturated_fraction".to_string(), fraction);
        if fraction > ctx.config.pixels.saturation_warn_fraction {
            warn!(frame_id = %frame.frame_id(), fraction, "Frame is heavily saturated");
        }
        Ok(frame)
    }
}

/// Subtracts the mean overscan level
pub struct Overscan;

impl SingleFrameStage for Overscan {
    fn name(&self) -> &str {
        OVERSCAN
    }

    fn apply(&self, mut frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        let columns = ctx.config.pixels.overscan_columns;
        if columns == 0 {
            return Ok(frame);
        }
        let (_, width) = frame.shape();
        if columns >= width {
            return Err(ReductionError::processing(
                OVERSCAN,
                format!("{} overscan columns on a frame {} wide", columns, width),
            ));
        }
        let level = frame
            .data
            .slice(s![.., width - columns..])
            .mean()
            .unwrap_or(0.0);
        frame.data.mapv_inplace(|v| v - level);
        frame.qc.insert("overscan_level".to_string(), level as f64);
        Ok(frame)
    }
}

/// Removes the overscan columns
pub struct Trim;

impl SingleFrameStage for Trim {
    fn name(&self) -> &str {
        TRIM
    }

    fn apply(&self, mut frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        let columns = ctx.config.pixels.overscan_columns;
        if columns == 0 {
            return Ok(frame);
        }
        let (_, width) = frame.shape();
        if columns >= width {
            return Err(ReductionError::processing(
                TRIM,
                format!("cannot trim {} columns from a frame {} wide", columns, width),
            ));
        }
        let keep = width - columns;
        frame.data = frame.data.slice(s![.., ..keep]).to_owned();
        frame.mask = frame.mask.slice(s![.., ..keep]).to_owned();
        Ok(frame)
    }
}

/// Folds the master bad pixel mask into the frame mask
pub struct BadPixelMask;

impl SingleFrameStage for BadPixelMask {
    fn name(&self) -> &str {
        BPM
    }

    fn apply(&self, mut frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        if !ctx.config.selection.require_bpm
            && ctx.find_master(&frame, FrameType::Bpm)?.is_none()
        {
            debug!(frame_id = %frame.frame_id(), "No bad pixel mask; continuing without one");
            return Ok(frame);
        }
        let (record, bpm) = require_master(&frame, ctx, FrameType::Bpm, BPM)?;
        Zip::from(&mut frame.mask).and(&bpm.data).for_each(|m, b| {
            if *b != 0.0 {
                *m |= MASK_BAD_PIXEL;
            }
        });
        frame.calibrations.insert(FrameType::Bpm, record.frame_id);
        Ok(frame)
    }
}

/// Subtracts the master bias
pub struct BiasSubtract;

impl SingleFrameStage for BiasSubtract {
    fn name(&self) -> &str {
        BIAS
    }

    fn apply(&self, mut frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        let (record, bias) = require_master(&frame, ctx, FrameType::Bias, BIAS)?;
        frame.data -= &bias.data;
        Zip::from(&mut frame.mask).and(&bias.mask).for_each(|m, b| *m |= *b);
        frame.calibrations.insert(FrameType::Bias, record.frame_id);
        Ok(frame)
    }
}

/// Subtracts the master dark scaled by exposure time
pub struct DarkSubtract;

impl SingleFrameStage for DarkSubtract {
    fn name(&self) -> &str {
        DARK
    }

    fn apply(&self, mut frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        let (record, dark) = require_master(&frame, ctx, FrameType::Dark, DARK)?;
        let exposure = frame.descriptor.exposure_time() as f32;
        Zip::from(&mut frame.data)
            .and(&dark.data)
            .for_each(|v, d| *v -= d * exposure);
        Zip::from(&mut frame.mask).and(&dark.mask).for_each(|m, d| *m |= *d);
        frame.calibrations.insert(FrameType::Dark, record.frame_id);
        Ok(frame)
    }
}

/// Divides by the master flat
pub struct FlatDivide;

impl SingleFrameStage for FlatDivide {
    fn name(&self) -> &str {
        FLAT
    }

    fn apply(&self, mut frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        let (record, flat) = require_master(&frame, ctx, FrameType::Flat, FLAT)?;
        Zip::from(&mut frame.data)
            .and(&mut frame.mask)
            .and(&flat.data)
            .for_each(|v, m, f| {
                if *f > 0.0 {
                    *v /= f;
                } else {
                    *v = 0.0;
                    *m |= MASK_BAD_PIXEL;
                }
            });
        frame.calibrations.insert(FrameType::Flat, record.frame_id);
        Ok(frame)
    }
}

/// Hands a QC summary to the configured sink
pub struct QcRecord;

impl SingleFrameStage for QcRecord {
    fn name(&self) -> &str {
        QC_RECORD
    }

    fn apply(&self, frame: Frame, ctx: &StageContext) -> Result<Frame, ReductionError> {
        ctx.qc.submit(&QcSummary::from_frame(&frame))?;
        Ok(frame)
    }
}

/// Removes the mean level of an individual bias
pub struct BiasLevel;

impl SingleFrameStage for BiasLevel {
    fn name(&self) -> &str {
        BIAS_LEVEL
    }

    fn apply(&self, mut frame: Frame, _ctx: &StageContext) -> Result<Frame, ReductionError> {
        let level = unmasked_mean(&frame).unwrap_or(0.0);
        frame.data.mapv_inplace(|v| v - level as f32);
        frame.qc.insert("bias_level".to_string(), level);
        Ok(frame)
    }
}

/// Scales a dark to counts per second
pub struct DarkNormalize;

impl SingleFrameStage for DarkNormalize {
    fn name(&self) -> &str {
        DARK_NORMALIZE
    }

    fn apply(&self, mut frame: Frame, _ctx: &StageContext) -> Result<Frame, ReductionError> {
        let exposure = frame.descriptor.exposure_time();
        if exposure <= 0.0 {
            // Kept as-is; the stacking scheduler excludes it.
            warn!(frame_id = %frame.frame_id(), "Dark frame has zero exposure time");
            return Ok(frame);
        }
        let scale = exposure as f32;
        frame.data.mapv_inplace(|v| v / scale);
        Ok(frame)
    }
}

/// Normalises a flat to unit mean
pub struct FlatNormalize;

impl SingleFrameStage for FlatNormalize {
    fn name(&self) -> &str {
        FLAT_NORMALIZE
    }

    fn apply(&self, mut frame: Frame, _ctx: &StageContext) -> Result<Frame, ReductionError> {
        let level = unmasked_mean(&frame).unwrap_or(0.0);
        if !(level > 0.0) {
            return Err(ReductionError::processing(
                FLAT_NORMALIZE,
                format!("flat {} has non-positive level {}", frame.frame_id(), level),
            ));
        }
        let scale = level as f32;
        frame.data.mapv_inplace(|v| v / scale);
        frame.qc.insert("flat_level".to_string(), level);
        Ok(frame)
    }
}
