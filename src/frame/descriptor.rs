//! Frame Descriptor: immutable attribute bag for one exposure.

use crate::error::ReductionError;
use crate::frame::header::*;
use crate::types::{parse_timestamp, Attributes, FrameId, FrameType, InstrumentId, Timestamp};
use serde::{Deserialize, Serialize};

pub const ATTR_BINNING: &str = "binning";
pub const ATTR_FILTER: &str = "filter";
pub const ATTR_CONFIGURATION_MODE: &str = "configuration_mode";

/// Fallback source for attributes that are absent from a frame's header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderDefaults {
    #[serde(default = "default_binning")]
    pub binning: String,

    #[serde(default = "default_configuration_mode")]
    pub configuration_mode: String,

    /// Filter to assume when the header has none (none by default)
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_binning() -> String {
    "1 1".to_string()
}

fn default_configuration_mode() -> String {
    "default".to_string()
}

impl Default for HeaderDefaults {
    fn default() -> Self {
        Self {
            binning: default_binning(),
            configuration_mode: default_configuration_mode(),
            filter: None,
        }
    }
}

/// Descriptor of one exposure. Fields are fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    frame_id: FrameId,
    instrument: InstrumentId,
    frame_type: FrameType,
    observed_at: Timestamp,
    exposure_time: f64,
    is_master: bool,
    reduction_level: u32,
    attributes: Attributes,
}

impl FrameDescriptor {
    /// Build a descriptor from source metadata.
    ///
    /// `fallback_id` names the frame when the header carries no `FRAMEID`
    /// (normally the file stem).
    pub fn from_header(
        header: &Header,
        fallback_id: &str,
        defaults: &HeaderDefaults,
    ) -> Result<Self, ReductionError> {
        let frame_id = FrameId::new(
            header
                .get_text(KEY_FRAME_ID)
                .unwrap_or_else(|| fallback_id.to_string()),
        );

        let required = |key: &str| {
            header
                .get_text(key)
                .ok_or_else(|| ReductionError::corrupt(&frame_id, format!("missing {} keyword", key)))
        };

        let instrument = InstrumentId::new(
            required(KEY_SITE)?,
            required(KEY_ENCLOSURE)?,
            required(KEY_TELESCOPE)?,
            required(KEY_CAMERA)?,
        );

        let obstype = required(KEY_OBSTYPE)?;
        let frame_type = FrameType::from_obstype(&obstype).ok_or_else(|| {
            ReductionError::corrupt(&frame_id, format!("unsupported OBSTYPE '{}'", obstype))
        })?;

        let raw_date = required(KEY_DATE_OBS)?;
        let observed_at = parse_timestamp(&raw_date).ok_or_else(|| {
            ReductionError::corrupt(&frame_id, format!("unparseable DATE-OBS '{}'", raw_date))
        })?;

        let exposure_time = header.get_f64(KEY_EXPTIME).unwrap_or(0.0);
        if !exposure_time.is_finite() || exposure_time < 0.0 {
            return Err(ReductionError::corrupt(
                &frame_id,
                format!("invalid EXPTIME {}", exposure_time),
            ));
        }

        let is_master = header.get_bool(KEY_IS_MASTER).unwrap_or(false);
        let raw_level = header.get_i64(KEY_RLEVEL).unwrap_or(0);
        let reduction_level = u32::try_from(raw_level).map_err(|_| {
            ReductionError::corrupt(&frame_id, format!("invalid RLEVEL {}", raw_level))
        })?;

        let mut attributes = Attributes::new();
        attributes.insert(
            ATTR_BINNING.to_string(),
            header
                .get_text(KEY_BINNING)
                .unwrap_or_else(|| defaults.binning.clone()),
        );
        attributes.insert(
            ATTR_CONFIGURATION_MODE.to_string(),
            normalize_configuration_mode(header.get_text(KEY_CONFMODE), defaults),
        );
        if let Some(filter) = header.get_text(KEY_FILTER).or_else(|| defaults.filter.clone()) {
            attributes.insert(ATTR_FILTER.to_string(), filter);
        }

        Ok(Self {
            frame_id,
            instrument,
            frame_type,
            observed_at,
            exposure_time,
            is_master,
            reduction_level,
            attributes,
        })
    }

    /// Descriptor for a synthesized master calibration.
    pub fn master(
        frame_id: FrameId,
        instrument: InstrumentId,
        frame_type: FrameType,
        observed_at: Timestamp,
        exposure_time: f64,
        attributes: Attributes,
    ) -> Self {
        Self {
            frame_id,
            instrument,
            frame_type,
            observed_at,
            exposure_time,
            is_master: true,
            reduction_level: 0,
            attributes,
        }
    }

    /// Copy of this descriptor at a new reduction level.
    pub fn reduced(&self, reduction_level: u32) -> Self {
        Self {
            reduction_level,
            ..self.clone()
        }
    }

    pub fn frame_id(&self) -> &FrameId {
        &self.frame_id
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn observed_at(&self) -> Timestamp {
        self.observed_at
    }

    pub fn exposure_time(&self) -> f64 {
        self.exposure_time
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn reduction_level(&self) -> u32 {
        self.reduction_level
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn binning(&self) -> Option<&str> {
        self.attribute(ATTR_BINNING)
    }

    pub fn filter(&self) -> Option<&str> {
        self.attribute(ATTR_FILTER)
    }

    /// Render back to header keywords; `from_header` on the result yields an
    /// equal descriptor.
    pub fn to_header(&self) -> Header {
        let mut header = Header::new()
            .with(KEY_FRAME_ID, self.frame_id.as_str())
            .with(KEY_SITE, self.instrument.site.as_str())
            .with(KEY_ENCLOSURE, self.instrument.enclosure.as_str())
            .with(KEY_TELESCOPE, self.instrument.telescope.as_str())
            .with(KEY_CAMERA, self.instrument.camera.as_str())
            .with(KEY_OBSTYPE, self.frame_type.as_str())
            .with(KEY_DATE_OBS, self.observed_at.to_rfc3339())
            .with(KEY_EXPTIME, self.exposure_time)
            .with(KEY_IS_MASTER, self.is_master)
            .with(KEY_RLEVEL, self.reduction_level as i64);
        if let Some(binning) = self.binning() {
            header.set(KEY_BINNING, binning);
        }
        if let Some(mode) = self.attribute(ATTR_CONFIGURATION_MODE) {
            header.set(KEY_CONFMODE, mode);
        }
        if let Some(filter) = self.filter() {
            header.set(KEY_FILTER, filter);
        }
        header
    }
}

fn normalize_configuration_mode(raw: Option<String>, defaults: &HeaderDefaults) -> String {
    match raw {
        None => defaults.configuration_mode.clone(),
        Some(mode) => {
            let lowered = mode.to_ascii_lowercase();
            if lowered == "n/a" || lowered == "0" || lowered == "normal" {
                defaults.configuration_mode.clone()
            } else {
                mode
            }
        }
    }
}
