//! Integration tests for the reduction orchestrator
//!
//! Tests cover:
//! - Per-frame failure isolation
//! - Ledger-based duplicate skipping
//! - Instrument and reduction-level selection
//! - Calibration lookups applied to science frames
//! - Re-registration and rewritten calibrations

use crate::integration::test_utils::*;
use darkroom::error::ReductionError;
use darkroom::frame::header::{KEY_BINNING, KEY_CAMERA, KEY_FRAME_ID, KEY_RLEVEL};
use darkroom::frame::{calibration_key, FrameArchive};
use darkroom::instrument::Instrument;
use darkroom::orchestrator::{ReductionOutcome, SkipReason};
use darkroom::registry::{CalibrationStatus, MasterQuery};
use darkroom::types::{FrameId, FrameType, InstrumentId};
use ndarray::{s, Array2};
use std::path::PathBuf;

/// Archived products whose file name starts with `prefix`
fn products(env: &TestEnv, prefix: &str) -> Vec<PathBuf> {
    FrameArchive::scan(&env.orchestrator.config().storage.archive_root)
        .into_iter()
        .filter(|p| FrameArchive::stem(p).starts_with(prefix))
        .collect()
}

#[test]
fn test_bias_is_reduced_recorded_and_settled() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let path = env.write_raw("bias-001", &raw_bias(1));

    let outcome = env.orchestrator.reduce_frame(&path).unwrap();
    let ReductionOutcome::Reduced {
        frame_id,
        frame_type,
        product,
        verdict,
    } = outcome
    else {
        panic!("expected a reduced frame, got {:?}", outcome);
    };
    assert_eq!(frame_id, FrameId::new("bias-001"));
    assert_eq!(frame_type, FrameType::Bias);
    assert!(product.exists());

    let verdict = verdict.unwrap();
    assert!(verdict.is_good());
    assert_eq!(verdict.baseline, Some(FrameId::new("seed-bias")));

    let record = env.orchestrator.registry().get(&frame_id).unwrap().unwrap();
    assert_eq!(record.status, CalibrationStatus::Good);
    assert!(!record.is_master);
    assert_eq!(record.location, product);
}

#[test]
fn test_calibration_without_baseline_is_bad() {
    let env = TestEnv::new();
    let path = env.write_raw("bias-001", &raw_bias(1));

    let outcome = env.orchestrator.reduce_frame(&path).unwrap();
    let ReductionOutcome::Reduced { verdict, .. } = outcome else {
        panic!("expected a reduced frame");
    };
    let verdict = verdict.unwrap();
    assert_eq!(verdict.status, CalibrationStatus::Bad);
    assert!(verdict.baseline.is_none());
}

#[test]
fn test_corrupt_frame_does_not_stop_the_batch() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let good = env.write_raw("bias-001", &raw_bias(1));
    let corrupt = env.raw_dir.join("broken.frame");
    std::fs::write(&corrupt, b"not a frame").unwrap();

    let rt = tokio::runtime::Runtime::new().unwrap();
    let reports = rt.block_on(env.orchestrator.reduce_many(vec![corrupt.clone(), good.clone()]));

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].location, corrupt);
    assert!(matches!(
        reports[0].result,
        Err(ReductionError::CorruptFrame { .. })
    ));
    assert_eq!(reports[1].frame_id(), Some(&FrameId::new("bias-001")));
}

#[test]
fn test_duplicate_delivery_is_skipped() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let path = env.write_raw("bias-001", &raw_bias(1));

    env.orchestrator.reduce_frame(&path).unwrap();
    let again = env.orchestrator.reduce_frame(&path).unwrap();
    assert_eq!(
        again,
        ReductionOutcome::Skipped {
            reason: SkipReason::AlreadyProcessed
        }
    );

    let entry = env.orchestrator.ledger().get(&path).unwrap().unwrap();
    assert!(entry.success);
    assert_eq!(entry.tries, 1);
}

#[test]
fn test_rewritten_file_is_reprocessed() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let path = env.write_raw("bias-001", &raw_bias(1));
    env.orchestrator.reduce_frame(&path).unwrap();

    // Same identity and metadata, different pixels: a new checksum
    env.write_raw("bias-001", &raw(header("BIAS", night_two_at(1), 0.0), 101.0));
    let outcome = env.orchestrator.reduce_frame(&path).unwrap();
    assert!(matches!(outcome, ReductionOutcome::Reduced { .. }));
}

#[test]
fn test_rewritten_calibration_is_compared_again() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let path = env.write_raw("bias-001", &raw_bias(1));
    let ReductionOutcome::Reduced { product: first, .. } = env.orchestrator.reduce_frame(&path).unwrap()
    else {
        panic!("expected a reduced frame");
    };

    let mut data = Array2::from_elem(SHAPE, 100.0f32);
    data.slice_mut(s![0..4, ..]).fill(5000.0);
    let rewritten = darkroom::frame::RawFrame::new(header("BIAS", night_two_at(1), 0.0), data);
    env.write_raw("bias-001", &rewritten);

    let ReductionOutcome::Reduced {
        product, verdict, ..
    } = env.orchestrator.reduce_frame(&path).unwrap()
    else {
        panic!("expected a reduced frame");
    };
    assert_ne!(product, first);
    assert!(first.exists());

    let verdict = verdict.unwrap();
    assert_eq!(verdict.status, CalibrationStatus::Bad);
    assert!(verdict.score.is_some());
    assert_eq!(verdict.baseline, Some(FrameId::new("seed-bias")));

    let record = env
        .orchestrator
        .registry()
        .get(&FrameId::new("bias-001"))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, CalibrationStatus::Bad);
    assert_eq!(record.location, product);
}

#[test]
fn test_conflicting_identity_leaves_product_untouched() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let original = env.write_raw(
        "bias-a",
        &raw(header("BIAS", night_two_at(1), 0.0).with(KEY_FRAME_ID, "x"), 100.0),
    );
    env.orchestrator.reduce_frame(&original).unwrap();
    let before = products(&env, "x-");
    assert_eq!(before.len(), 1);

    let conflicting = env.write_raw(
        "bias-b",
        &raw(
            header("BIAS", night_two_at(1), 0.0)
                .with(KEY_FRAME_ID, "x")
                .with(KEY_BINNING, "2 2"),
            100.0,
        ),
    );
    let err = env.orchestrator.reduce_frame(&conflicting).unwrap_err();
    assert!(matches!(err, ReductionError::DuplicateFrame { .. }));
    assert_eq!(products(&env, "x-"), before);

    let record = env
        .orchestrator
        .registry()
        .get(&FrameId::new("x"))
        .unwrap()
        .unwrap();
    assert_eq!(record.attributes.get("binning").map(String::as_str), Some("1 1"));
    assert_eq!(record.status, CalibrationStatus::Good);
    let stored = env.orchestrator.frames().read(&record.location).unwrap();
    assert_eq!(stored.header.get_text(KEY_BINNING).as_deref(), Some("1 1"));
}

#[test]
fn test_flat_without_filter_fails_before_archiving() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let path = env.write_raw("flat-nofilter", &raw(header("SKYFLAT", night_two_at(3), 10.0), 1020.0));

    let err = env.orchestrator.reduce_frame(&path).unwrap_err();
    assert!(matches!(
        &err,
        ReductionError::AttributeMissing { attribute, .. } if attribute == "filter"
    ));
    assert!(!err.is_retryable());
    assert!(products(&env, "flat-nofilter").is_empty());
    assert!(env
        .orchestrator
        .registry()
        .get(&FrameId::new("flat-nofilter"))
        .unwrap()
        .is_none());
}

#[test]
fn test_good_individual_replaces_older_master() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    env.seed_master(FrameType::Flat, "seed-flat-v", night_one().start, Some("V"), 2.0);
    let path = env.write_raw("bias-day2", &raw_bias(1));
    let ReductionOutcome::Reduced { verdict, .. } = env.orchestrator.reduce_frame(&path).unwrap() else {
        panic!("expected a reduced frame");
    };
    assert!(verdict.unwrap().is_good());

    let query = MasterQuery::as_of(FrameType::Bias, instrument(), attributes(None), night_two().end);
    let found = env.orchestrator.registry().query_master(&query).unwrap().unwrap();
    assert_eq!(found.frame_id, FrameId::new("bias-day2"));
    assert!(!found.is_master);

    let science = env.write_raw(
        "sci-001",
        &raw(header("EXPOSE", night_two_at(30), 10.0).with("FILTER", "V"), 420.0),
    );
    let ReductionOutcome::Reduced { product, .. } = env.orchestrator.reduce_frame(&science).unwrap() else {
        panic!("expected a reduced frame");
    };
    let stored = env.orchestrator.frames().read(&product).unwrap();
    assert_eq!(
        stored.header.get_text(&calibration_key(FrameType::Bias)).as_deref(),
        Some("bias-day2")
    );
}

#[test]
fn test_unknown_instrument_is_rejected() {
    let env = TestEnv::new();
    let frame = raw(
        header("BIAS", night_two_at(1), 0.0).with(KEY_CAMERA, "zz99"),
        100.0,
    );
    let path = env.write_raw("stranger", &frame);

    let err = env.orchestrator.reduce_frame(&path).unwrap_err();
    assert!(matches!(err, ReductionError::UnknownInstrument(_)));
    assert!(!err.is_retryable());
}

#[test]
fn test_excluded_instrument_is_skipped() {
    let env = TestEnv::new();
    let nres = InstrumentId::new("lsc", "igla", "1m0a", "nres01");
    env.orchestrator
        .instruments()
        .add(&Instrument::new(nres, "1m0-NRES-SciCam", true))
        .unwrap();
    let frame = raw(
        header("BIAS", night_two_at(1), 0.0)
            .with("ENCID", "igla")
            .with(KEY_CAMERA, "nres01"),
        100.0,
    );
    let path = env.write_raw("nres-bias", &frame);

    let outcome = env.orchestrator.reduce_frame(&path).unwrap();
    assert_eq!(
        outcome,
        ReductionOutcome::Skipped {
            reason: SkipReason::InstrumentExcluded
        }
    );
}

#[test]
fn test_already_reduced_frame_is_skipped() {
    let env = TestEnv::new();
    let frame = raw(header("BIAS", night_two_at(1), 0.0).with(KEY_RLEVEL, 91i64), 0.0);
    let path = env.write_raw("reduced-bias", &frame);

    let outcome = env.orchestrator.reduce_frame(&path).unwrap();
    assert_eq!(
        outcome,
        ReductionOutcome::Skipped {
            reason: SkipReason::AlreadyReduced
        }
    );
}

#[test]
fn test_missing_master_fails_the_frame() {
    let env = TestEnv::new();
    let path = env.write_raw("dark-001", &raw_dark(1));

    let err = env.orchestrator.reduce_frame(&path).unwrap_err();
    assert!(matches!(err, ReductionError::NotFound(_)));
    assert!(env
        .orchestrator
        .registry()
        .get(&FrameId::new("dark-001"))
        .unwrap()
        .is_none());
}

#[test]
fn test_science_frame_uses_masters() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let flat = env.seed_master(FrameType::Flat, "seed-flat-v", night_one().start, Some("V"), 2.0);
    let frame = raw(
        header("EXPOSE", night_two_at(30), 10.0).with("FILTER", "V"),
        420.0,
    );
    let path = env.write_raw("sci-001", &frame);

    let outcome = env.orchestrator.reduce_frame(&path).unwrap();
    let ReductionOutcome::Reduced {
        product, verdict, ..
    } = outcome
    else {
        panic!("expected a reduced frame");
    };
    assert!(verdict.is_none());

    let stored = env.orchestrator.frames().read(&product).unwrap();
    // (420 - 0 - 2 * 10) / 2
    assert!(stored.data.iter().all(|v| (*v - 200.0).abs() < 1e-3));
    assert_eq!(
        stored.header.get_text(&calibration_key(FrameType::Flat)),
        Some(flat.to_string())
    );
    assert_eq!(
        stored.header.get_text(&calibration_key(FrameType::Bias)).as_deref(),
        Some("seed-bias")
    );
    assert!(env
        .orchestrator
        .registry()
        .get(&FrameId::new("sci-001"))
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reduce_directory_filters_types() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    env.write_raw("bias-001", &raw_bias(1));
    env.write_raw("dark-001", &raw_dark(2));

    let reports = env
        .orchestrator
        .reduce_directory(&env.raw_dir, &[FrameType::Bias])
        .await;
    assert_eq!(reports.len(), 2);
    let skipped = reports
        .iter()
        .filter(|r| {
            matches!(
                r.result,
                Ok(ReductionOutcome::Skipped {
                    reason: SkipReason::TypeNotSelected
                })
            )
        })
        .count();
    assert_eq!(skipped, 1);
    assert!(env
        .orchestrator
        .registry()
        .get(&FrameId::new("dark-001"))
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_night_stacks_in_order() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    for i in 0..3 {
        env.write_raw(&format!("bias-{:03}", i), &raw_bias(i));
        env.write_raw(&format!("dark-{:03}", i), &raw_dark(10 + i));
    }

    let report = env
        .orchestrator
        .process_night(&instrument(), night_two(), &env.raw_dir)
        .await
        .unwrap();

    assert_eq!(report.failures(), 0);
    assert_eq!(report.reduced(), 6);
    let stacked: Vec<FrameType> = report
        .stacking
        .iter()
        .filter(|(_, outcome)| !outcome.stacked().is_empty())
        .map(|(frame_type, _)| *frame_type)
        .collect();
    assert_eq!(stacked, vec![FrameType::Bias, FrameType::Dark]);
}
