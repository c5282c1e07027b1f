//! Shared fixtures for integration tests
//!
//! Every test gets its own TempDir holding the registry database, the
//! product archive and a directory of raw frames.

use chrono::{TimeZone, Utc};
use darkroom::config::ReductionConfig;
use darkroom::frame::descriptor::{ATTR_BINNING, ATTR_CONFIGURATION_MODE, ATTR_FILTER};
use darkroom::frame::header::*;
use darkroom::frame::{Frame, FrameArchive, FrameDescriptor, Header, RawFrame};
use darkroom::instrument::Instrument;
use darkroom::orchestrator::Orchestrator;
use darkroom::qc::TracingQcSink;
use darkroom::registry::CalibrationRecord;
use darkroom::stacking::{AlwaysReady, ReadinessOracle};
use darkroom::stage::StageCatalog;
use darkroom::types::{Attributes, DateWindow, FrameId, FrameType, InstrumentId, Timestamp};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const SHAPE: (usize, usize) = (8, 8);

pub fn instrument() -> InstrumentId {
    InstrumentId::new("lsc", "domb", "1m0a", "fa15")
}

/// 2024-03-01T12:00 .. 2024-03-02T12:00
pub fn night_one() -> DateWindow {
    DateWindow::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap(),
    )
}

/// 2024-03-02T12:00 .. 2024-03-03T12:00
pub fn night_two() -> DateWindow {
    DateWindow::new(
        Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 3, 12, 0, 0).unwrap(),
    )
}

/// Observation time `minutes` after 20:00 on night two
pub fn night_two_at(minutes: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 2, 20, minutes, 0).unwrap()
}

pub struct TestEnv {
    pub dir: TempDir,
    pub raw_dir: PathBuf,
    pub orchestrator: Arc<Orchestrator>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config<F: FnOnce(&mut ReductionConfig)>(customize: F) -> Self {
        Self::build(customize, Arc::new(AlwaysReady), None)
    }

    pub fn with_oracle(oracle: Arc<dyn ReadinessOracle>) -> Self {
        Self::build(|_| {}, oracle, None)
    }

    pub fn with_catalog(catalog: StageCatalog) -> Self {
        Self::build(|_| {}, Arc::new(AlwaysReady), Some(catalog))
    }

    fn build<F: FnOnce(&mut ReductionConfig)>(
        customize: F,
        oracle: Arc<dyn ReadinessOracle>,
        catalog: Option<StageCatalog>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        customize(&mut config);
        let mut orchestrator = Orchestrator::open_with(config, oracle, Arc::new(TracingQcSink)).unwrap();
        if let Some(catalog) = catalog {
            orchestrator = orchestrator.with_catalog(catalog);
        }
        orchestrator
            .instruments()
            .add(&Instrument::new(instrument(), "1m0-SciCam-Sinistro", true))
            .unwrap();
        let raw_dir = dir.path().join("raw");
        std::fs::create_dir_all(&raw_dir).unwrap();
        Self {
            dir,
            raw_dir,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Write a raw frame into the raw directory.
    pub fn write_raw(&self, stem: &str, raw: &RawFrame) -> PathBuf {
        FrameArchive::write_raw(&self.raw_dir, stem, raw).unwrap()
    }

    /// Store a good master directly, bypassing the comparer.
    pub fn seed_master(
        &self,
        frame_type: FrameType,
        id: &str,
        observed_at: Timestamp,
        filter: Option<&str>,
        value: f32,
    ) -> FrameId {
        let exposure = if frame_type == FrameType::Bias { 0.0 } else { 1.0 };
        let descriptor = FrameDescriptor::master(
            FrameId::new(id),
            instrument(),
            frame_type,
            observed_at,
            exposure,
            attributes(filter),
        )
        .reduced(1);
        let frame = Frame::new(descriptor, Array2::from_elem(SHAPE, value));
        let location = self.orchestrator.frames().write(&frame).unwrap();
        let registry = self.orchestrator.registry();
        registry
            .record(CalibrationRecord::from_frame(&frame, location, Utc::now()))
            .unwrap();
        registry.mark_good(frame.frame_id()).unwrap();
        frame.frame_id().clone()
    }

    /// Good BIAS and DARK masters from night one.
    pub fn seed_bias_and_dark(&self) {
        let start = night_one().start;
        self.seed_master(FrameType::Bias, "seed-bias", start, None, 0.0);
        self.seed_master(FrameType::Dark, "seed-dark", start, None, 2.0);
    }
}

pub fn test_config(root: &Path) -> ReductionConfig {
    let mut config = ReductionConfig::default();
    config.storage.db_path = root.join("db");
    config.storage.archive_root = root.join("archive");
    config.queue.frame_workers = 2;
    config.queue.backoff_ms = 10;
    config.queue.max_backoff_ms = 20;
    config
}

pub fn attributes(filter: Option<&str>) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(ATTR_BINNING.to_string(), "1 1".to_string());
    attributes.insert(ATTR_CONFIGURATION_MODE.to_string(), "default".to_string());
    if let Some(filter) = filter {
        attributes.insert(ATTR_FILTER.to_string(), filter.to_string());
    }
    attributes
}

pub fn header(obstype: &str, observed_at: Timestamp, exposure: f64) -> Header {
    let id = instrument();
    Header::new()
        .with(KEY_SITE, id.site.as_str())
        .with(KEY_ENCLOSURE, id.enclosure.as_str())
        .with(KEY_TELESCOPE, id.telescope.as_str())
        .with(KEY_CAMERA, id.camera.as_str())
        .with(KEY_OBSTYPE, obstype)
        .with(KEY_DATE_OBS, observed_at.to_rfc3339())
        .with(KEY_EXPTIME, exposure)
        .with(KEY_BINNING, "1 1")
}

/// Uniform raw frame of `value`
pub fn raw(header: Header, value: f32) -> RawFrame {
    RawFrame::new(header, Array2::from_elem(SHAPE, value))
}

pub fn raw_bias(minutes: u32) -> RawFrame {
    raw(header("BIAS", night_two_at(minutes), 0.0), 100.0)
}

/// Dark of 30 s at 2 counts per second
pub fn raw_dark(minutes: u32) -> RawFrame {
    raw(header("DARK", night_two_at(minutes), 30.0), 60.0)
}

/// Flat of 10 s, normalising to 1.0 after the seeded dark is removed
pub fn raw_flat(minutes: u32, filter: &str) -> RawFrame {
    raw(
        header("SKYFLAT", night_two_at(minutes), 10.0).with(KEY_FILTER, filter),
        1020.0,
    )
}
