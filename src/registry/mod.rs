//! Calibration Registry
//!
//! Durable store of individual and master calibration records. This is the
//! single source of truth for which calibrations exist and which are usable;
//! only records with status `Good` are ever returned by selection queries.

pub mod persistence;

pub use persistence::SledCalibrationStore;

use crate::concurrency::LockManager;
use crate::error::{ReductionError, StorageError};
use crate::frame::Frame;
use crate::grouping::{Grouped, GroupingPolicy};
use crate::types::{Attributes, DateWindow, FrameId, FrameType, InstrumentId, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Comparer verdict state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationStatus {
    Pending,
    Good,
    Bad,
}

impl std::fmt::Display for CalibrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CalibrationStatus::Pending => "pending",
            CalibrationStatus::Good => "good",
            CalibrationStatus::Bad => "bad",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CalibrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(CalibrationStatus::Pending),
            "good" => Ok(CalibrationStatus::Good),
            "bad" => Ok(CalibrationStatus::Bad),
            other => Err(format!("unknown calibration status: {}", other)),
        }
    }
}

/// One row of the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub frame_id: FrameId,
    pub frame_type: FrameType,
    pub instrument: InstrumentId,
    pub observed_at: Timestamp,
    pub created_at: Timestamp,
    pub is_master: bool,
    pub status: CalibrationStatus,
    pub attributes: Attributes,
    pub exposure_time: f64,
    pub location: PathBuf,
    /// Stacking window (masters only)
    #[serde(default)]
    pub window: Option<DateWindow>,
    /// Stacked individual frames (masters only)
    #[serde(default)]
    pub members: Vec<FrameId>,
    /// Newer master that replaced this one for the same window (audit only)
    #[serde(default)]
    pub superseded_by: Option<FrameId>,
}

impl CalibrationRecord {
    /// Record for a reduced frame stored at `location`.
    pub fn from_frame(frame: &Frame, location: PathBuf, created_at: Timestamp) -> Self {
        let descriptor = &frame.descriptor;
        Self {
            frame_id: descriptor.frame_id().clone(),
            frame_type: descriptor.frame_type(),
            instrument: descriptor.instrument().clone(),
            observed_at: descriptor.observed_at(),
            created_at,
            is_master: descriptor.is_master(),
            status: CalibrationStatus::Pending,
            attributes: descriptor.attributes().clone(),
            exposure_time: descriptor.exposure_time(),
            location,
            window: None,
            members: Vec::new(),
            superseded_by: None,
        }
    }

    pub fn is_bad(&self) -> bool {
        self.status == CalibrationStatus::Bad
    }

    pub fn is_good(&self) -> bool {
        self.status == CalibrationStatus::Good
    }

    /// Whether this record carries every `(key, value)` in `attributes`.
    pub fn matches_attributes(&self, attributes: &Attributes) -> bool {
        attributes
            .iter()
            .all(|(key, value)| self.attributes.get(key) == Some(value))
    }

    /// Describe the first metadata difference from `other`. Lifecycle
    /// fields and the product location are not metadata.
    fn conflict_with(&self, other: &CalibrationRecord) -> Option<String> {
        if self.frame_type != other.frame_type {
            return Some(format!("frame type {} vs {}", self.frame_type, other.frame_type));
        }
        if self.instrument != other.instrument {
            return Some(format!("instrument {} vs {}", self.instrument, other.instrument));
        }
        if self.observed_at != other.observed_at {
            return Some(format!(
                "observation time {} vs {}",
                self.observed_at, other.observed_at
            ));
        }
        if self.is_master != other.is_master {
            return Some("master flag differs".to_string());
        }
        if self.attributes != other.attributes {
            return Some(format!(
                "attributes {:?} vs {:?}",
                self.attributes, other.attributes
            ));
        }
        if self.exposure_time != other.exposure_time {
            return Some(format!(
                "exposure time {} vs {}",
                self.exposure_time, other.exposure_time
            ));
        }
        if self.window != other.window || self.members != other.members {
            return Some("stack window or members differ".to_string());
        }
        None
    }
}

impl Grouped for CalibrationRecord {
    fn frame_id(&self) -> &FrameId {
        &self.frame_id
    }

    fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Result of `record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// An identical record already existed; nothing was written
    Unchanged,
    /// Same metadata with new product content; the record is back to
    /// `Pending` and must be settled again
    Revised,
}

/// Upper bound on a calibration's observation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBound {
    AtOrBefore(Timestamp),
    Before(Timestamp),
}

impl DateBound {
    pub fn admits(&self, t: &Timestamp) -> bool {
        match self {
            DateBound::AtOrBefore(bound) => t <= bound,
            DateBound::Before(bound) => t < bound,
        }
    }
}

/// Calibration selection query
#[derive(Debug, Clone, PartialEq)]
pub struct MasterQuery {
    pub frame_type: FrameType,
    pub instrument: InstrumentId,
    pub attributes: Attributes,
    pub bound: DateBound,
    /// Only consider calibrations created before this instant
    pub created_before: Option<Timestamp>,
    /// Records that may not be returned
    pub excluding: Vec<FrameId>,
}

impl MasterQuery {
    /// Latest calibration observed at or before `as_of`
    pub fn as_of(
        frame_type: FrameType,
        instrument: InstrumentId,
        attributes: Attributes,
        as_of: Timestamp,
    ) -> Self {
        Self {
            frame_type,
            instrument,
            attributes,
            bound: DateBound::AtOrBefore(as_of),
            created_before: None,
            excluding: Vec::new(),
        }
    }

    /// Latest calibration observed strictly before `before`
    pub fn before(
        frame_type: FrameType,
        instrument: InstrumentId,
        attributes: Attributes,
        before: Timestamp,
    ) -> Self {
        Self {
            bound: DateBound::Before(before),
            ..Self::as_of(frame_type, instrument, attributes, before)
        }
    }

    pub fn created_before(mut self, created_before: Option<Timestamp>) -> Self {
        self.created_before = created_before;
        self
    }

    pub fn excluding(mut self, frame_ids: &[FrameId]) -> Self {
        self.excluding.extend(frame_ids.iter().cloned());
        self
    }
}

/// Filter for `list`
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub frame_type: Option<FrameType>,
    pub instrument: Option<InstrumentId>,
    pub masters_only: bool,
    pub status: Option<CalibrationStatus>,
}

impl RecordFilter {
    fn admits(&self, record: &CalibrationRecord) -> bool {
        self.frame_type.map_or(true, |t| record.frame_type == t)
            && self
                .instrument
                .as_ref()
                .map_or(true, |i| &record.instrument == i)
            && (!self.masters_only || record.is_master)
            && self.status.map_or(true, |s| record.status == s)
    }
}

/// Storage backend for calibration records
pub trait CalibrationStore: Send + Sync {
    fn get(&self, frame_id: &FrameId) -> Result<Option<CalibrationRecord>, StorageError>;

    fn put(&self, record: &CalibrationRecord) -> Result<(), StorageError>;

    /// All records of one frame type on one instrument
    fn scan(
        &self,
        frame_type: FrameType,
        instrument: &InstrumentId,
    ) -> Result<Vec<CalibrationRecord>, StorageError>;

    fn list_all(&self) -> Result<Vec<CalibrationRecord>, StorageError>;
}

/// Registry facade enforcing the record lifecycle on top of a store
pub struct CalibrationRegistry {
    store: Arc<dyn CalibrationStore>,
    grouping: GroupingPolicy,
    locks: LockManager,
}

impl CalibrationRegistry {
    pub fn new(store: Arc<dyn CalibrationStore>, grouping: GroupingPolicy) -> Self {
        Self {
            store,
            grouping,
            locks: LockManager::new(),
        }
    }

    pub fn grouping(&self) -> &GroupingPolicy {
        &self.grouping
    }

    /// Idempotent upsert keyed by frame identity.
    ///
    /// New records always start `Pending` with no supersession link. A
    /// re-record with identical metadata and location is a no-op that keeps
    /// the existing status. Identical metadata at a new location means the
    /// product content changed: the record is revised and goes back to
    /// `Pending`. Differing metadata fails with `DuplicateFrame`.
    pub fn record(&self, record: CalibrationRecord) -> Result<RecordOutcome, ReductionError> {
        self.check_attributes(&record)?;

        let key = record.frame_id.as_str().to_string();
        self.locks.with_write_lock(&key, || self.record_locked(record))
    }

    /// Fail with `DuplicateFrame` if `record` could not be recorded because
    /// an existing record describes different metadata. Nothing is written.
    pub fn check_conflict(&self, record: &CalibrationRecord) -> Result<(), ReductionError> {
        self.check_attributes(record)?;
        match self.store.get(&record.frame_id)? {
            Some(existing) => match existing.conflict_with(record) {
                Some(reason) => Err(ReductionError::DuplicateFrame {
                    frame_id: record.frame_id.clone(),
                    reason,
                }),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn check_attributes(&self, record: &CalibrationRecord) -> Result<(), ReductionError> {
        for key in self.grouping.keys_for(record.frame_type) {
            if !record.attributes.contains_key(key) {
                return Err(ReductionError::AttributeMissing {
                    frame_id: record.frame_id.clone(),
                    attribute: key.clone(),
                });
            }
        }
        Ok(())
    }

    fn record_locked(&self, record: CalibrationRecord) -> Result<RecordOutcome, ReductionError> {
        if let Some(existing) = self.store.get(&record.frame_id)? {
            if let Some(reason) = existing.conflict_with(&record) {
                return Err(ReductionError::DuplicateFrame {
                    frame_id: record.frame_id,
                    reason,
                });
            }
            if existing.location == record.location {
                debug!(frame_id = %record.frame_id, "Calibration record unchanged");
                return Ok(RecordOutcome::Unchanged);
            }
            let previous = existing.status;
            let revised = CalibrationRecord {
                status: CalibrationStatus::Pending,
                location: record.location,
                created_at: record.created_at,
                ..existing
            };
            self.store.put(&revised)?;
            info!(
                frame_id = %revised.frame_id,
                previous_status = %previous,
                location = %revised.location.display(),
                "Calibration content changed; awaiting comparison"
            );
            return Ok(RecordOutcome::Revised);
        }

        let record = CalibrationRecord {
            status: CalibrationStatus::Pending,
            superseded_by: None,
            ..record
        };
        self.store.put(&record)?;
        info!(
            frame_id = %record.frame_id,
            frame_type = %record.frame_type,
            instrument = %record.instrument,
            is_master = record.is_master,
            "Calibration recorded"
        );
        Ok(RecordOutcome::Inserted)
    }

    pub fn get(&self, frame_id: &FrameId) -> Result<Option<CalibrationRecord>, ReductionError> {
        Ok(self.store.get(frame_id)?)
    }

    /// Most recent good calibration matching the query.
    ///
    /// Settled individuals are eligible alongside masters, so a newer good
    /// individual takes over from an older master. Ties on observation time
    /// go to the latest creation time. `None` is a legitimate outcome, not an
    /// error.
    pub fn query_master(
        &self,
        query: &MasterQuery,
    ) -> Result<Option<CalibrationRecord>, ReductionError> {
        let candidates = self.store.scan(query.frame_type, &query.instrument)?;
        Ok(candidates
            .into_iter()
            .filter(|r| r.is_good())
            .filter(|r| !query.excluding.contains(&r.frame_id))
            .filter(|r| r.matches_attributes(&query.attributes))
            .filter(|r| query.bound.admits(&r.observed_at))
            .filter(|r| query.created_before.map_or(true, |c| r.created_at < c))
            .max_by(|a, b| {
                a.observed_at
                    .cmp(&b.observed_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.frame_id.cmp(&b.frame_id))
            }))
    }

    /// Good individual records observed within `window`, oldest first.
    pub fn query_individuals(
        &self,
        frame_type: FrameType,
        instrument: &InstrumentId,
        attributes: &Attributes,
        window: &DateWindow,
    ) -> Result<Vec<CalibrationRecord>, ReductionError> {
        let mut records: Vec<CalibrationRecord> = self
            .store
            .scan(frame_type, instrument)?
            .into_iter()
            .filter(|r| !r.is_master && r.is_good())
            .filter(|r| r.matches_attributes(attributes))
            .filter(|r| window.contains(&r.observed_at))
            .collect();
        records.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then(a.frame_id.cmp(&b.frame_id))
        });
        Ok(records)
    }

    /// Masters of any status stacked for exactly `window`.
    pub fn masters_for_window(
        &self,
        frame_type: FrameType,
        instrument: &InstrumentId,
        attributes: &Attributes,
        window: &DateWindow,
    ) -> Result<Vec<CalibrationRecord>, ReductionError> {
        Ok(self
            .store
            .scan(frame_type, instrument)?
            .into_iter()
            .filter(|r| r.is_master && r.window.as_ref() == Some(window))
            .filter(|r| r.matches_attributes(attributes))
            .collect())
    }

    pub fn mark_bad(&self, frame_id: &FrameId) -> Result<(), ReductionError> {
        self.set_status(frame_id, CalibrationStatus::Bad)
    }

    pub fn mark_good(&self, frame_id: &FrameId) -> Result<(), ReductionError> {
        self.set_status(frame_id, CalibrationStatus::Good)
    }

    /// Record that `old` was replaced by `new` for the same window.
    pub fn mark_superseded(&self, old: &FrameId, new: &FrameId) -> Result<(), ReductionError> {
        self.update(old, |record| record.superseded_by = Some(new.clone()))?;
        info!(old = %old, new = %new, "Master superseded");
        Ok(())
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<CalibrationRecord>, ReductionError> {
        let mut records: Vec<CalibrationRecord> = self
            .store
            .list_all()?
            .into_iter()
            .filter(|r| filter.admits(r))
            .collect();
        records.sort_by(|a, b| {
            a.instrument
                .cmp(&b.instrument)
                .then(a.frame_type.cmp(&b.frame_type))
                .then(a.observed_at.cmp(&b.observed_at))
                .then(a.frame_id.cmp(&b.frame_id))
        });
        Ok(records)
    }

    fn set_status(&self, frame_id: &FrameId, status: CalibrationStatus) -> Result<(), ReductionError> {
        self.update(frame_id, |record| record.status = status)?;
        info!(frame_id = %frame_id, status = %status, "Calibration status changed");
        Ok(())
    }

    /// Atomic read-modify-write of one record.
    fn update<F>(&self, frame_id: &FrameId, apply: F) -> Result<(), ReductionError>
    where
        F: FnOnce(&mut CalibrationRecord),
    {
        self.locks.with_write_lock(frame_id.as_str(), || -> Result<(), ReductionError> {
            let mut record = self.store.get(frame_id)?.ok_or_else(|| {
                ReductionError::NotFound(format!("calibration record {}", frame_id))
            })?;
            apply(&mut record);
            self.store.put(&record)?;
            Ok(())
        })
    }
}
