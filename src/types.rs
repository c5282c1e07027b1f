//! Core identity and time types shared across the reduction system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Observation / creation timestamp (always UTC)
pub type Timestamp = DateTime<Utc>;

/// Free-form type-specific attributes (grouping and correction keys)
pub type Attributes = BTreeMap<String, String>;

/// Frame type of an exposure.
///
/// Serialized in upper case; lower-case aliases exist because the layered
/// configuration normalises map keys to lower case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    #[serde(alias = "bias")]
    Bias,
    #[serde(alias = "dark")]
    Dark,
    #[serde(alias = "flat")]
    Flat,
    #[serde(alias = "bpm")]
    Bpm,
    #[serde(alias = "science")]
    Science,
}

impl FrameType {
    pub const ALL: [FrameType; 5] = [
        FrameType::Bias,
        FrameType::Dark,
        FrameType::Flat,
        FrameType::Bpm,
        FrameType::Science,
    ];

    /// Calibration types that are stacked into masters, in reduction order.
    pub const STACKABLE: [FrameType; 3] = [FrameType::Bias, FrameType::Dark, FrameType::Flat];

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Bias => "BIAS",
            FrameType::Dark => "DARK",
            FrameType::Flat => "FLAT",
            FrameType::Bpm => "BPM",
            FrameType::Science => "SCIENCE",
        }
    }

    /// Map a raw `OBSTYPE` header value onto a frame type.
    pub fn from_obstype(obstype: &str) -> Option<Self> {
        match obstype.trim().to_ascii_uppercase().as_str() {
            "BIAS" => Some(FrameType::Bias),
            "DARK" => Some(FrameType::Dark),
            "SKYFLAT" | "FLAT" | "LAMPFLAT" => Some(FrameType::Flat),
            "BPM" => Some(FrameType::Bpm),
            "EXPOSE" | "STANDARD" | "SCIENCE" => Some(FrameType::Science),
            _ => None,
        }
    }

    pub fn is_calibration(&self) -> bool {
        !matches!(self, FrameType::Science)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FrameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FrameType::from_obstype(s).ok_or_else(|| format!("unknown frame type: {}", s))
    }
}

/// Unique identity of one physical frame artifact
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(String);

impl FrameId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FrameId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FrameId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Instrument identity: site, enclosure, telescope, camera
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrumentId {
    pub site: String,
    pub enclosure: String,
    pub telescope: String,
    pub camera: String,
}

impl InstrumentId {
    pub fn new(
        site: impl Into<String>,
        enclosure: impl Into<String>,
        telescope: impl Into<String>,
        camera: impl Into<String>,
    ) -> Self {
        Self {
            site: site.into(),
            enclosure: enclosure.into(),
            telescope: telescope.into(),
            camera: camera.into(),
        }
    }

    /// Stable storage key (`site/enclosure/telescope/camera`)
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.site, self.enclosure, self.telescope, self.camera
        )
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl std::str::FromStr for InstrumentId {
    type Err = String;

    /// Parse the `site/enclosure/telescope/camera` form produced by `key()`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').map(str::trim).collect();
        match parts.as_slice() {
            [site, enclosure, telescope, camera]
                if parts.iter().all(|p| !p.is_empty()) =>
            {
                Ok(InstrumentId::new(*site, *enclosure, *telescope, *camera))
            }
            _ => Err(format!(
                "invalid instrument '{}', expected site/enclosure/telescope/camera",
                s
            )),
        }
    }
}

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl DateWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: &Timestamp) -> bool {
        *t >= self.start && *t < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%dT%H:%M:%S"),
            self.end.format("%Y-%m-%dT%H:%M:%S")
        )
    }
}

/// Parse an observation timestamp: RFC3339 or `YYYY-MM-DDThh:mm:ss[.fff]` (UTC assumed)
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}
