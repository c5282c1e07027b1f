//! Error types for the darkroom reduction system.

use crate::types::FrameId;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt stored data: {0}")]
    InvalidData(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(io) => StorageError::IoError(io),
            sled::Error::Corruption { .. } => StorageError::InvalidData(err.to_string()),
            other => StorageError::Unavailable(other.to_string()),
        }
    }
}

/// Map a serialization failure onto `StorageError::InvalidData`.
pub(crate) fn to_storage_data<E: std::fmt::Display>(err: E) -> StorageError {
    StorageError::InvalidData(err.to_string())
}

/// Reduction errors.
///
/// `NotFound` is a legitimate outcome for registry lookups (they return
/// `Option`); it only becomes an error when a stage requires the calibration.
#[derive(Debug, Error)]
pub enum ReductionError {
    #[error("Frame {frame_id}: required attribute '{attribute}' is missing")]
    AttributeMissing { frame_id: FrameId, attribute: String },

    #[error("Frame {frame_id} already registered with conflicting metadata: {reason}")]
    DuplicateFrame { frame_id: FrameId, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt frame {frame_id}: {reason}")]
    CorruptFrame { frame_id: FrameId, reason: String },

    #[error("Transient infrastructure failure: {0}")]
    Transient(String),

    #[error("Inhomogeneous frame set: {0}")]
    InhomogeneousSet(String),

    #[error("Stage '{stage}' failed: {reason}")]
    Processing { stage: String, reason: String },

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ReductionError {
    /// Whether a failed task should be re-queued.
    ///
    /// Only infrastructure failures are retried; anything that depends on the
    /// frame's own content fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReductionError::Transient(_) => true,
            ReductionError::Storage(StorageError::Unavailable(_)) => true,
            ReductionError::Storage(StorageError::IoError(_)) => true,
            ReductionError::Storage(_) => false,
            ReductionError::AttributeMissing { .. } => false,
            ReductionError::DuplicateFrame { .. } => false,
            ReductionError::NotFound(_) => false,
            ReductionError::CorruptFrame { .. } => false,
            ReductionError::InhomogeneousSet(_) => false,
            ReductionError::Processing { .. } => false,
            ReductionError::UnknownInstrument(_) => false,
            ReductionError::Config(_) => false,
        }
    }

    pub fn corrupt(frame_id: &FrameId, reason: impl Into<String>) -> Self {
        ReductionError::CorruptFrame {
            frame_id: frame_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn processing(stage: &str, reason: impl Into<String>) -> Self {
        ReductionError::Processing {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for ReductionError {
    fn from(err: config::ConfigError) -> Self {
        ReductionError::Config(err.to_string())
    }
}
