//! Reduction Orchestrator
//!
//! Per incoming frame: build its descriptor, plan its stage pipeline by frame
//! type, run it, archive the product and, for calibrations, record and settle
//! it in the registry. Failures are isolated per frame; nothing here lets one
//! frame's error stop the others.

use crate::comparer::{CalibrationComparer, Verdict};
use crate::config::ReductionConfig;
use crate::error::{ReductionError, StorageError};
use crate::frame::{Frame, FrameArchive, FrameStore};
use crate::grouping::select_attributes;
use crate::instrument::InstrumentTable;
use crate::ledger::ProcessingLedger;
use crate::qc::{QcSink, TracingQcSink};
use crate::registry::{CalibrationRecord, CalibrationRegistry, SledCalibrationStore};
use crate::stacking::{AlwaysReady, ReadinessOracle, StackingJob, StackingOutcome, StackingScheduler};
use crate::stage::{StageCatalog, StageContext};
use crate::types::{DateWindow, FrameId, FrameType, InstrumentId};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a frame was not reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The ledger shows this exact file succeeded or ran out of tries
    AlreadyProcessed,
    /// The frame carries a non-zero reduction level
    AlreadyReduced,
    /// The instrument is excluded by the selection criteria
    InstrumentExcluded,
    /// The frame type was not requested
    TypeNotSelected,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::AlreadyProcessed => "already processed",
            SkipReason::AlreadyReduced => "already reduced",
            SkipReason::InstrumentExcluded => "instrument excluded",
            SkipReason::TypeNotSelected => "frame type not selected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReductionOutcome {
    Reduced {
        frame_id: FrameId,
        frame_type: FrameType,
        product: PathBuf,
        /// Comparer verdict, for calibration frames
        verdict: Option<Verdict>,
    },
    Skipped {
        reason: SkipReason,
    },
}

/// Result of one isolated reduction
#[derive(Debug)]
pub struct FrameReport {
    pub location: PathBuf,
    pub result: Result<ReductionOutcome, ReductionError>,
}

impl FrameReport {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }

    pub fn frame_id(&self) -> Option<&FrameId> {
        match &self.result {
            Ok(ReductionOutcome::Reduced { frame_id, .. }) => Some(frame_id),
            _ => None,
        }
    }
}

/// Everything one night of processing produced
#[derive(Debug, Default)]
pub struct NightReport {
    pub frames: Vec<FrameReport>,
    pub stacking: Vec<(FrameType, StackingOutcome)>,
}

impl NightReport {
    pub fn failures(&self) -> usize {
        self.frames.iter().filter(|r| r.is_failure()).count()
    }

    pub fn reduced(&self) -> usize {
        self.frames.iter().filter(|r| r.frame_id().is_some()).count()
    }
}

pub struct Orchestrator {
    config: Arc<ReductionConfig>,
    store: SledCalibrationStore,
    registry: Arc<CalibrationRegistry>,
    frames: Arc<dyn FrameStore>,
    ledger: ProcessingLedger,
    instruments: Arc<InstrumentTable>,
    catalog: StageCatalog,
    qc: Arc<dyn QcSink>,
    comparer: Arc<CalibrationComparer>,
    scheduler: Arc<StackingScheduler>,
}

impl Orchestrator {
    /// Open the registry database and archive named by `config`, with an
    /// always-ready oracle and the tracing QC sink.
    pub fn open(config: ReductionConfig) -> Result<Self, ReductionError> {
        Self::open_with(config, Arc::new(AlwaysReady), Arc::new(TracingQcSink))
    }

    pub fn open_with(
        config: ReductionConfig,
        oracle: Arc<dyn ReadinessOracle>,
        qc: Arc<dyn QcSink>,
    ) -> Result<Self, ReductionError> {
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ReductionError::Config(messages.join("; "))
        })?;

        if let Some(parent) = config.storage.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(StorageError::IoError)?;
        }
        let store = SledCalibrationStore::open(&config.storage.db_path)?;
        let archive = FrameArchive::new(&config.storage.archive_root)?;
        let ledger = ProcessingLedger::new(store.db())?;
        let instruments = InstrumentTable::shared(store.db())?;

        let config = Arc::new(config);
        let registry = Arc::new(CalibrationRegistry::new(
            Arc::new(store.clone()),
            config.grouping.clone(),
        ));
        let frames: Arc<dyn FrameStore> = Arc::new(archive);
        let comparer = Arc::new(CalibrationComparer::new(
            Arc::clone(&registry),
            Arc::clone(&frames),
            Arc::clone(&config),
        ));
        let ctx = StageContext {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            frames: Arc::clone(&frames),
            qc: Arc::clone(&qc),
            started_at: Utc::now(),
        };
        let scheduler = Arc::new(StackingScheduler::new(ctx, oracle, Arc::clone(&comparer)));

        info!(
            db_path = %config.storage.db_path.display(),
            archive_root = %config.storage.archive_root.display(),
            "Orchestrator opened"
        );
        Ok(Self {
            config,
            store,
            registry,
            frames,
            ledger,
            instruments,
            catalog: StageCatalog::with_builtins(),
            qc,
            comparer,
            scheduler,
        })
    }

    /// Replace the stage catalog, e.g. to register additional stages.
    pub fn with_catalog(mut self, catalog: StageCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CalibrationRegistry> {
        &self.registry
    }

    pub fn instruments(&self) -> &InstrumentTable {
        &self.instruments
    }

    pub fn ledger(&self) -> &ProcessingLedger {
        &self.ledger
    }

    pub fn comparer(&self) -> &CalibrationComparer {
        &self.comparer
    }

    pub fn scheduler(&self) -> &Arc<StackingScheduler> {
        &self.scheduler
    }

    pub fn frames(&self) -> &Arc<dyn FrameStore> {
        &self.frames
    }

    pub fn flush(&self) -> Result<(), ReductionError> {
        Ok(self.store.flush()?)
    }

    /// Reduce the raw frame at `location`.
    pub fn reduce_frame(&self, location: &Path) -> Result<ReductionOutcome, ReductionError> {
        self.reduce_selected(location, None)
    }

    /// Reduce one frame, turning any error into a report.
    pub fn reduce_isolated(&self, location: &Path) -> FrameReport {
        self.isolated(location, None)
    }

    /// Reduce a batch concurrently; one report per location, in input order.
    pub async fn reduce_many(self: &Arc<Self>, locations: Vec<PathBuf>) -> Vec<FrameReport> {
        self.reduce_batch(locations, None).await
    }

    /// Reduce every frame file under `dir` whose type is in `types` (all types
    /// when empty).
    pub async fn reduce_directory(self: &Arc<Self>, dir: &Path, types: &[FrameType]) -> Vec<FrameReport> {
        let locations = FrameArchive::scan(dir);
        debug!(dir = %dir.display(), files = locations.len(), ?types, "Scanned directory");
        let types = (!types.is_empty()).then(|| types.to_vec());
        self.reduce_batch(locations, types).await
    }

    /// Stack one window through the scheduler.
    pub async fn stack(&self, job: &StackingJob) -> Result<StackingOutcome, ReductionError> {
        self.scheduler.run(job).await
    }

    /// Process one night in calibration order: bad pixel masks, then for
    /// BIAS, DARK and FLAT reduce the individuals and stack the window, and
    /// finally the science frames.
    pub async fn process_night(
        self: &Arc<Self>,
        instrument: &InstrumentId,
        window: DateWindow,
        dir: &Path,
    ) -> Result<NightReport, ReductionError> {
        info!(instrument = %instrument, window = %window, dir = %dir.display(), "Processing night");
        let mut report = NightReport::default();
        report
            .frames
            .extend(self.reduce_directory(dir, &[FrameType::Bpm]).await);

        for frame_type in FrameType::STACKABLE {
            report
                .frames
                .extend(self.reduce_directory(dir, &[frame_type]).await);
            let job = StackingJob::new(instrument.clone(), frame_type, window);
            let outcome = self.stack(&job).await?;
            report.stacking.push((frame_type, outcome));
        }

        report
            .frames
            .extend(self.reduce_directory(dir, &[FrameType::Science]).await);
        info!(
            instrument = %instrument,
            reduced = report.reduced(),
            failures = report.failures(),
            "Night complete"
        );
        Ok(report)
    }

    async fn reduce_batch(
        self: &Arc<Self>,
        locations: Vec<PathBuf>,
        types: Option<Vec<FrameType>>,
    ) -> Vec<FrameReport> {
        let tasks = locations.into_iter().map(|location| {
            let orchestrator = Arc::clone(self);
            let types = types.clone();
            async move {
                let task_location = location.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    orchestrator.isolated(&task_location, types.as_deref())
                })
                .await;
                joined.unwrap_or_else(|e| {
                    error!(location = %location.display(), error = %e, "Reduction task aborted");
                    FrameReport {
                        location,
                        result: Err(ReductionError::processing(
                            "orchestrator",
                            format!("reduction task aborted: {}", e),
                        )),
                    }
                })
            }
        });
        stream::iter(tasks)
            .buffered(self.config.queue.frame_workers.max(1))
            .collect()
            .await
    }

    fn isolated(&self, location: &Path, types: Option<&[FrameType]>) -> FrameReport {
        let result = self.reduce_selected(location, types);
        if let Err(e) = &result {
            warn!(location = %location.display(), error = %e, "Frame reduction failed");
        }
        FrameReport {
            location: location.to_path_buf(),
            result,
        }
    }

    fn reduce_selected(
        &self,
        location: &Path,
        types: Option<&[FrameType]>,
    ) -> Result<ReductionOutcome, ReductionError> {
        let checksum = self.frames.checksum(location)?;
        let max_tries = self.config.selection.max_tries;
        if !self.ledger.need_to_process(location, &checksum, max_tries)? {
            debug!(location = %location.display(), "Already processed; skipping");
            return Ok(ReductionOutcome::Skipped {
                reason: SkipReason::AlreadyProcessed,
            });
        }

        let frame = match self.decode(location) {
            Ok(frame) => frame,
            Err(e) => {
                self.ledger.increment_tries(location, &checksum)?;
                return Err(e);
            }
        };
        if let Some(types) = types {
            if !types.contains(&frame.frame_type()) {
                return Ok(ReductionOutcome::Skipped {
                    reason: SkipReason::TypeNotSelected,
                });
            }
        }

        let attempt = self.ledger.increment_tries(location, &checksum)?;
        debug!(location = %location.display(), frame_id = %frame.frame_id(), attempt, "Reducing frame");
        let outcome = self.reduce_decoded(frame)?;
        if let ReductionOutcome::Reduced { frame_id, .. } = &outcome {
            self.ledger.mark_success(location, &checksum, frame_id)?;
        }
        Ok(outcome)
    }

    fn decode(&self, location: &Path) -> Result<Frame, ReductionError> {
        let raw = self.frames.read(location)?;
        Frame::from_raw(raw, &FrameArchive::stem(location), &self.config.header_defaults)
    }

    fn reduce_decoded(&self, frame: Frame) -> Result<ReductionOutcome, ReductionError> {
        let instrument_id = frame.descriptor.instrument().clone();
        let instrument = self
            .instruments
            .get(&instrument_id)?
            .ok_or_else(|| ReductionError::UnknownInstrument(instrument_id.key()))?;
        if !self.config.selection.instrument_selection().accepts(&instrument) {
            info!(frame_id = %frame.frame_id(), instrument = %instrument_id, "Instrument excluded; skipping");
            return Ok(ReductionOutcome::Skipped {
                reason: SkipReason::InstrumentExcluded,
            });
        }
        if frame.descriptor.reduction_level() != 0 {
            info!(
                frame_id = %frame.frame_id(),
                reduction_level = frame.descriptor.reduction_level(),
                "Frame already reduced; skipping"
            );
            return Ok(ReductionOutcome::Skipped {
                reason: SkipReason::AlreadyReduced,
            });
        }

        select_attributes(
            frame.frame_id(),
            frame.descriptor.attributes(),
            self.registry.grouping().keys_for(frame.frame_type()),
        )?;

        let pipeline = self.catalog.plan(frame.frame_type(), &self.config)?;
        let ctx = self.context();
        let mut reduced = pipeline.run(frame, &ctx)?;
        reduced.descriptor = reduced.descriptor.reduced(1);

        // Rejected re-registrations must not leave a product behind
        let record = if reduced.frame_type().is_calibration() {
            let record = CalibrationRecord::from_frame(&reduced, PathBuf::new(), Utc::now());
            self.registry.check_conflict(&record)?;
            Some(record)
        } else {
            None
        };
        let product = self.frames.write(&reduced)?;

        let verdict = match record {
            Some(record) => {
                let outcome = self.registry.record(CalibrationRecord {
                    location: product.clone(),
                    ..record
                })?;
                debug!(frame_id = %reduced.frame_id(), ?outcome, "Calibration registered");
                Some(self.comparer.settle(reduced.frame_id())?)
            }
            None => None,
        };

        info!(
            frame_id = %reduced.frame_id(),
            frame_type = %reduced.frame_type(),
            product = %product.display(),
            stages = reduced.history.len(),
            "Frame reduced"
        );
        Ok(ReductionOutcome::Reduced {
            frame_id: reduced.frame_id().clone(),
            frame_type: reduced.frame_type(),
            product,
            verdict,
        })
    }

    fn context(&self) -> StageContext {
        StageContext {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            frames: Arc::clone(&self.frames),
            qc: Arc::clone(&self.qc),
            started_at: Utc::now(),
        }
    }
}
