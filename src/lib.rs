//! Darkroom: calibration lifecycle and frame reduction for observatory data
//!
//! Raw frames are reduced through ordered stages that look up master
//! calibrations in a registry; individual calibrations are stacked per
//! night into new masters, which are compared against the previous master
//! before they become eligible for use.

pub mod cli;
pub mod comparer;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod frame;
pub mod grouping;
pub mod instrument;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod qc;
pub mod queue;
pub mod registry;
pub mod stacking;
pub mod stage;
pub mod types;

pub use comparer::{CalibrationComparer, Verdict};
pub use error::{ReductionError, StorageError};
pub use frame::{Frame, FrameDescriptor};
pub use orchestrator::{Orchestrator, ReductionOutcome};
pub use registry::{CalibrationRecord, CalibrationRegistry, CalibrationStatus};
pub use stacking::{StackingJob, StackingScheduler};
pub use types::{DateWindow, FrameId, FrameType, InstrumentId};
