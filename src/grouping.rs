//! Attribute Grouper
//!
//! Partitions frames or records into groups whose grouping-relevant
//! attributes are identical. Groups never span instruments or frame types.

use crate::error::ReductionError;
use crate::frame::descriptor::{ATTR_BINNING, ATTR_FILTER};
use crate::frame::{Frame, FrameDescriptor};
use crate::types::{Attributes, FrameId, FrameType, InstrumentId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Anything that can be placed into an attribute group
pub trait Grouped {
    fn frame_id(&self) -> &FrameId;
    fn instrument(&self) -> &InstrumentId;
    fn frame_type(&self) -> FrameType;
    fn attribute(&self, key: &str) -> Option<&str>;
}

impl Grouped for FrameDescriptor {
    fn frame_id(&self) -> &FrameId {
        FrameDescriptor::frame_id(self)
    }

    fn instrument(&self) -> &InstrumentId {
        FrameDescriptor::instrument(self)
    }

    fn frame_type(&self) -> FrameType {
        FrameDescriptor::frame_type(self)
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        FrameDescriptor::attribute(self, key)
    }
}

impl Grouped for Frame {
    fn frame_id(&self) -> &FrameId {
        self.descriptor.frame_id()
    }

    fn instrument(&self) -> &InstrumentId {
        self.descriptor.instrument()
    }

    fn frame_type(&self) -> FrameType {
        self.descriptor.frame_type()
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.descriptor.attribute(key)
    }
}

/// Grouping keys per frame type.
///
/// Frame types without an entry group by instrument alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingPolicy {
    #[serde(default)]
    pub keys: BTreeMap<FrameType, Vec<String>>,
}

impl Default for GroupingPolicy {
    fn default() -> Self {
        let binning = vec![ATTR_BINNING.to_string()];
        let mut keys = BTreeMap::new();
        keys.insert(FrameType::Bias, binning.clone());
        keys.insert(FrameType::Dark, binning.clone());
        keys.insert(
            FrameType::Flat,
            vec![ATTR_BINNING.to_string(), ATTR_FILTER.to_string()],
        );
        keys.insert(FrameType::Bpm, binning.clone());
        keys.insert(FrameType::Science, binning);
        Self { keys }
    }
}

impl GroupingPolicy {
    pub fn keys_for(&self, frame_type: FrameType) -> &[String] {
        self.keys.get(&frame_type).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Identity of one attribute group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub instrument: InstrumentId,
    pub frame_type: FrameType,
    /// `(key, value)` pairs in grouping-key order
    pub values: Vec<(String, String)>,
}

impl GroupKey {
    /// Grouping values as an attributes map
    pub fn attributes(&self) -> Attributes {
        self.values.iter().cloned().collect()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.frame_type, self.instrument)?;
        for (key, value) in &self.values {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Grouping key of one item under `keys`.
pub fn group_key<T: Grouped + ?Sized>(item: &T, keys: &[String]) -> Result<GroupKey, ReductionError> {
    let mut values = Vec::with_capacity(keys.len());
    for key in keys {
        let value = item
            .attribute(key)
            .ok_or_else(|| ReductionError::AttributeMissing {
                frame_id: item.frame_id().clone(),
                attribute: key.clone(),
            })?;
        values.push((key.clone(), value.to_string()));
    }
    Ok(GroupKey {
        instrument: item.instrument().clone(),
        frame_type: item.frame_type(),
        values,
    })
}

/// Extract the values of `keys` from an attributes map, failing on the first
/// missing key.
pub fn select_attributes(
    frame_id: &FrameId,
    attributes: &Attributes,
    keys: &[String],
) -> Result<Attributes, ReductionError> {
    keys.iter()
        .map(|key| {
            attributes
                .get(key)
                .map(|value| (key.clone(), value.clone()))
                .ok_or_else(|| ReductionError::AttributeMissing {
                    frame_id: frame_id.clone(),
                    attribute: key.clone(),
                })
        })
        .collect()
}

/// Partition `items` into attribute groups.
///
/// A missing grouping attribute on any item fails the whole call rather than
/// dropping the item.
pub fn group_by_attributes<T, I>(
    items: I,
    policy: &GroupingPolicy,
) -> Result<BTreeMap<GroupKey, Vec<T>>, ReductionError>
where
    T: Grouped,
    I: IntoIterator<Item = T>,
{
    let mut groups: BTreeMap<GroupKey, Vec<T>> = BTreeMap::new();
    for item in items {
        let key = group_key(&item, policy.keys_for(item.frame_type()))?;
        groups.entry(key).or_default().push(item);
    }
    Ok(groups)
}

/// Verify that `frames` form a single stackable group: same instrument, frame
/// type, grouping values and pixel shape.
pub fn check_homogeneity(frames: &[Frame], keys: &[String]) -> Result<(), ReductionError> {
    let Some(first) = frames.first() else {
        return Ok(());
    };
    let expected_key = group_key(first, keys)?;
    let expected_shape = first.shape();

    for frame in &frames[1..] {
        if frame.shape() != expected_shape {
            return Err(ReductionError::InhomogeneousSet(format!(
                "{} has shape {:?}, expected {:?}",
                frame.frame_id(),
                frame.shape(),
                expected_shape
            )));
        }
        let key = group_key(frame, keys)?;
        if key != expected_key {
            return Err(ReductionError::InhomogeneousSet(format!(
                "{} belongs to group '{}', expected '{}'",
                frame.frame_id(),
                key,
                expected_key
            )));
        }
    }
    Ok(())
}
