//! Frames
//!
//! A frame is one exposure: its descriptor, the header it was built from and
//! its pixels. `RawFrame` is the on-disk form; `Frame` is what stages work on.

pub mod archive;
pub mod descriptor;
pub mod header;

pub use archive::{FrameArchive, FrameStore};
pub use descriptor::{FrameDescriptor, HeaderDefaults};
pub use header::{Header, HeaderValue};

use crate::error::ReductionError;
use crate::types::{FrameId, FrameType};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mask bit for pixels flagged by the bad pixel mask
pub const MASK_BAD_PIXEL: u8 = 1;
/// Mask bit for saturated pixels
pub const MASK_SATURATED: u8 = 2;

/// Header keyword recording which calibration of `frame_type` was applied
pub fn calibration_key(frame_type: FrameType) -> String {
    format!("L1ID{}", frame_type.as_str())
}

/// Serialized frame as it is read from and written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub header: Header,
    pub data: Array2<f32>,
    pub mask: Option<Array2<u8>>,
}

impl RawFrame {
    pub fn new(header: Header, data: Array2<f32>) -> Self {
        Self {
            header,
            data,
            mask: None,
        }
    }
}

/// In-memory frame flowing through the stage pipeline
#[derive(Debug, Clone)]
pub struct Frame {
    pub descriptor: FrameDescriptor,
    pub header: Header,
    pub data: Array2<f32>,
    pub mask: Array2<u8>,
    /// Calibrations applied so far, by calibration type
    pub calibrations: BTreeMap<FrameType, FrameId>,
    /// Quality metrics gathered by stages
    pub qc: BTreeMap<String, f64>,
    /// Names of the stages that completed on this frame
    pub history: Vec<String>,
}

impl Frame {
    /// Decode a raw frame, building its descriptor.
    pub fn from_raw(
        raw: RawFrame,
        fallback_id: &str,
        defaults: &HeaderDefaults,
    ) -> Result<Self, ReductionError> {
        let descriptor = FrameDescriptor::from_header(&raw.header, fallback_id, defaults)?;
        if raw.data.is_empty() {
            return Err(ReductionError::corrupt(
                descriptor.frame_id(),
                "frame has no pixel data",
            ));
        }
        let mask = match raw.mask {
            Some(mask) if mask.dim() == raw.data.dim() => mask,
            Some(mask) => {
                return Err(ReductionError::corrupt(
                    descriptor.frame_id(),
                    format!(
                        "mask shape {:?} does not match data shape {:?}",
                        mask.dim(),
                        raw.data.dim()
                    ),
                ))
            }
            None => Array2::zeros(raw.data.dim()),
        };
        Ok(Self {
            descriptor,
            header: raw.header,
            data: raw.data,
            mask,
            calibrations: BTreeMap::new(),
            qc: BTreeMap::new(),
            history: Vec::new(),
        })
    }

    /// Frame built directly from a descriptor, e.g. a stacked master.
    pub fn new(descriptor: FrameDescriptor, data: Array2<f32>) -> Self {
        let mask = Array2::zeros(data.dim());
        Self {
            header: descriptor.to_header(),
            descriptor,
            data,
            mask,
            calibrations: BTreeMap::new(),
            qc: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    pub fn frame_id(&self) -> &FrameId {
        self.descriptor.frame_id()
    }

    pub fn frame_type(&self) -> FrameType {
        self.descriptor.frame_type()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Render to the on-disk form, folding descriptor, applied calibrations
    /// and QC metrics into the header.
    pub fn to_raw(&self) -> RawFrame {
        let mut header = self.header.clone();
        header.merge(&self.descriptor.to_header());
        for (frame_type, frame_id) in &self.calibrations {
            header.set(&calibration_key(*frame_type), frame_id.as_str());
        }
        for (name, value) in &self.qc {
            header.set(&format!("QC-{}", name), *value);
        }
        RawFrame {
            header,
            data: self.data.clone(),
            mask: Some(self.mask.clone()),
        }
    }
}
