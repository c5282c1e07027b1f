//! Quality-control records.
//!
//! The `qc_record` stage hands one summary per reduced frame to a `QcSink`.
//! The stage is best-effort: a failing sink never costs a frame.

use crate::error::ReductionError;
use crate::frame::Frame;
use crate::types::{FrameId, FrameType, InstrumentId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcSummary {
    pub frame_id: FrameId,
    pub frame_type: FrameType,
    pub instrument: InstrumentId,
    pub mean: f64,
    pub stddev: f64,
    pub masked_pixels: usize,
    pub metrics: BTreeMap<String, f64>,
}

impl QcSummary {
    pub fn from_frame(frame: &Frame) -> Self {
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut n = 0usize;
        for (value, mask) in frame.data.iter().zip(frame.mask.iter()) {
            if *mask == 0 {
                let v = *value as f64;
                sum += v;
                sum_sq += v * v;
                n += 1;
            }
        }
        let (mean, stddev) = if n == 0 {
            (0.0, 0.0)
        } else {
            let mean = sum / n as f64;
            let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
            (mean, variance.sqrt())
        };
        Self {
            frame_id: frame.frame_id().clone(),
            frame_type: frame.frame_type(),
            instrument: frame.descriptor.instrument().clone(),
            mean,
            stddev,
            masked_pixels: frame.mask.iter().filter(|m| **m != 0).count(),
            metrics: frame.qc.clone(),
        }
    }
}

pub trait QcSink: Send + Sync {
    fn submit(&self, summary: &QcSummary) -> Result<(), ReductionError>;
}

/// Writes summaries to the log
#[derive(Debug, Default)]
pub struct TracingQcSink;

impl QcSink for TracingQcSink {
    fn submit(&self, summary: &QcSummary) -> Result<(), ReductionError> {
        info!(
            frame_id = %summary.frame_id,
            frame_type = %summary.frame_type,
            instrument = %summary.instrument,
            mean = summary.mean,
            stddev = summary.stddev,
            masked_pixels = summary.masked_pixels,
            metrics = ?summary.metrics,
            "QC summary"
        );
        Ok(())
    }
}

/// Keeps summaries in memory
#[derive(Debug, Default)]
pub struct CollectingQcSink {
    summaries: Mutex<Vec<QcSummary>>,
}

impl CollectingQcSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summaries(&self) -> Vec<QcSummary> {
        self.summaries.lock().clone()
    }
}

impl QcSink for CollectingQcSink {
    fn submit(&self, summary: &QcSummary) -> Result<(), ReductionError> {
        self.summaries.lock().push(summary.clone());
        Ok(())
    }
}
