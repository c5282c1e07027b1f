//! Integration tests for the calibration comparer

use crate::integration::test_utils::*;
use darkroom::comparer::{AgreementMetric, CalibrationComparer};
use darkroom::config::Thresholds;
use darkroom::error::ReductionError;
use darkroom::frame::{Frame, FrameDescriptor};
use darkroom::registry::{CalibrationRecord, CalibrationStatus};
use darkroom::types::{FrameId, FrameType};
use ndarray::Array2;
use std::sync::Arc;

/// Record a pending master of `value` observed at `minutes` on night two.
fn pending_master(env: &TestEnv, id: &str, frame_type: FrameType, value: f32) -> FrameId {
    let descriptor = FrameDescriptor::master(
        FrameId::new(id),
        instrument(),
        frame_type,
        night_two_at(0),
        1.0,
        attributes(None),
    )
    .reduced(1);
    let mut frame = Frame::new(descriptor, Array2::from_elem(SHAPE, value));
    frame.data[[0, 0]] = value + 1000.0;
    let location = env.orchestrator.frames().write(&frame).unwrap();
    env.orchestrator
        .registry()
        .record(CalibrationRecord::from_frame(&frame, location, chrono::Utc::now()))
        .unwrap();
    frame.frame_id().clone()
}

#[test]
fn test_agreeing_candidate_is_good() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let id = pending_master(&env, "bias-candidate", FrameType::Bias, 1.0);

    let verdict = env.orchestrator.comparer().settle(&id).unwrap();
    assert_eq!(verdict.status, CalibrationStatus::Good);
    assert_eq!(verdict.baseline, Some(FrameId::new("seed-bias")));
    // One hot pixel out of 64
    let score = verdict.score.unwrap();
    assert!((score - 63.0 / 64.0).abs() < 1e-9);
    assert!(env.orchestrator.registry().get(&id).unwrap().unwrap().is_good());
}

#[test]
fn test_disagreeing_candidate_is_bad() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let id = pending_master(&env, "bias-candidate", FrameType::Bias, 50.0);

    let verdict = env.orchestrator.comparer().settle(&id).unwrap();
    assert_eq!(verdict.status, CalibrationStatus::Bad);
    assert_eq!(verdict.score, Some(0.0));
    assert!(env.orchestrator.registry().get(&id).unwrap().unwrap().is_bad());
}

#[test]
fn test_evaluate_has_no_side_effects() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let id = pending_master(&env, "bias-candidate", FrameType::Bias, 1.0);
    let record = env.orchestrator.registry().get(&id).unwrap().unwrap();

    env.orchestrator.comparer().evaluate(&record).unwrap();
    let again = env.orchestrator.registry().get(&id).unwrap().unwrap();
    assert_eq!(again.status, CalibrationStatus::Pending);
}

#[test]
fn test_settled_records_are_left_alone() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    let id = pending_master(&env, "bias-candidate", FrameType::Bias, 50.0);
    env.orchestrator.registry().mark_good(&id).unwrap();

    let verdict = env.orchestrator.comparer().settle(&id).unwrap();
    assert_eq!(verdict.status, CalibrationStatus::Good);
    assert!(verdict.score.is_none());
}

#[test]
fn test_settle_unknown_record_is_not_found() {
    let env = TestEnv::new();
    let err = env
        .orchestrator
        .comparer()
        .settle(&FrameId::new("missing"))
        .unwrap_err();
    assert!(matches!(err, ReductionError::NotFound(_)));
}

struct Constant(f64);

impl AgreementMetric for Constant {
    fn score(&self, _candidate: &Frame, _baseline: &Frame, _thresholds: &Thresholds) -> f64 {
        self.0
    }
}

#[test]
fn test_thresholds_are_per_type() {
    let env = TestEnv::with_config(|config| {
        config.comparison.by_type.insert(
            FrameType::Dark,
            Thresholds {
                min_agreement: 0.5,
                ..Thresholds::default()
            },
        );
    });
    env.seed_bias_and_dark();
    let bias = pending_master(&env, "bias-candidate", FrameType::Bias, 0.0);
    let dark = pending_master(&env, "dark-candidate", FrameType::Dark, 2.0);

    let comparer = CalibrationComparer::with_metric(
        Arc::clone(env.orchestrator.registry()),
        Arc::clone(env.orchestrator.frames()),
        Arc::new(env.orchestrator.config().clone()),
        Arc::new(Constant(0.6)),
    );
    assert_eq!(comparer.settle(&bias).unwrap().status, CalibrationStatus::Bad);
    assert_eq!(comparer.settle(&dark).unwrap().status, CalibrationStatus::Good);
}
