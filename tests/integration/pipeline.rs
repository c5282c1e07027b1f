//! Integration tests for stage plans and pipeline execution

use crate::integration::test_utils::*;
use chrono::Utc;
use darkroom::error::ReductionError;
use darkroom::frame::{Frame, HeaderDefaults};
use darkroom::qc::CollectingQcSink;
use darkroom::stage::builtin;
use darkroom::stage::{
    Criticality, Pipeline, PlannedStage, SingleFrameStage, Stage, StageCatalog, StageContext,
};
use darkroom::types::FrameType;
use std::sync::Arc;

struct Failing;

impl SingleFrameStage for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn apply(&self, _frame: Frame, _ctx: &StageContext) -> Result<Frame, ReductionError> {
        Err(ReductionError::processing("failing", "detector controller offline"))
    }
}

/// Stands in for a built-in stage under its registered name
struct Rejecting(&'static str);

impl SingleFrameStage for Rejecting {
    fn name(&self) -> &str {
        self.0
    }

    fn apply(&self, _frame: Frame, _ctx: &StageContext) -> Result<Frame, ReductionError> {
        Err(ReductionError::processing(self.0, "rejected by replacement stage"))
    }
}

struct AddOne;

impl SingleFrameStage for AddOne {
    fn name(&self) -> &str {
        "add_one"
    }

    fn apply(&self, mut frame: Frame, _ctx: &StageContext) -> Result<Frame, ReductionError> {
        frame.data.mapv_inplace(|v| v + 1.0);
        Ok(frame)
    }
}

fn planned(stage: Arc<dyn SingleFrameStage>, criticality: Criticality) -> PlannedStage {
    PlannedStage {
        name: stage.name().to_string(),
        stage: Stage::Single(stage),
        criticality,
    }
}

fn context(env: &TestEnv, qc: Arc<CollectingQcSink>) -> StageContext {
    StageContext {
        config: Arc::new(env.orchestrator.config().clone()),
        registry: Arc::clone(env.orchestrator.registry()),
        frames: Arc::clone(env.orchestrator.frames()),
        qc,
        started_at: Utc::now(),
    }
}

fn science_frame() -> Frame {
    let raw = raw(header("EXPOSE", night_two_at(5), 30.0).with("FILTER", "V"), 10.0);
    Frame::from_raw(raw, "sci-1", &HeaderDefaults::default()).unwrap()
}

#[test]
fn test_default_plans_per_type() {
    let env = TestEnv::new();
    let config = env.orchestrator.config();
    let catalog = StageCatalog::with_builtins();

    let bias = catalog.plan(FrameType::Bias, config).unwrap();
    assert_eq!(
        bias.stage_names(),
        vec![
            builtin::HEADER_SANITY,
            builtin::SATURATION_QC,
            builtin::OVERSCAN,
            builtin::TRIM,
            builtin::BPM,
            builtin::BIAS_LEVEL
        ]
    );

    let flat = catalog.plan(FrameType::Flat, config).unwrap();
    assert!(flat.stage_names().contains(&builtin::DARK));
    assert!(!flat.stage_names().contains(&builtin::FLAT));
    assert_eq!(flat.stage_names().last(), Some(&builtin::FLAT_NORMALIZE));

    let science = catalog.plan(FrameType::Science, config).unwrap();
    assert_eq!(science.stage_names().last(), Some(&builtin::QC_RECORD));
    let qc = science
        .stages()
        .iter()
        .find(|s| s.name == builtin::QC_RECORD)
        .unwrap();
    assert_eq!(qc.criticality, Criticality::BestEffort);
}

#[test]
fn test_unknown_stage_is_config_error() {
    let env = TestEnv::with_config(|config| {
        config.pipeline.ordered_stages.push("cosmic_rays".to_string());
    });
    let planned = StageCatalog::with_builtins().plan(FrameType::Science, env.orchestrator.config());
    assert!(matches!(planned, Err(ReductionError::Config(_))));
}

#[test]
fn test_best_effort_failure_keeps_frame() {
    let env = TestEnv::new();
    let ctx = context(&env, Arc::new(CollectingQcSink::new()));
    let pipeline = Pipeline::new(
        FrameType::Science,
        vec![
            planned(Arc::new(Failing), Criticality::BestEffort),
            planned(Arc::new(AddOne), Criticality::Critical),
        ],
    );

    let frame = pipeline.run(science_frame(), &ctx).unwrap();
    assert!(frame.data.iter().all(|v| *v == 11.0));
    assert_eq!(frame.history, vec!["add_one".to_string()]);
}

#[test]
fn test_critical_failure_drops_frame() {
    let env = TestEnv::new();
    let ctx = context(&env, Arc::new(CollectingQcSink::new()));
    let pipeline = Pipeline::new(
        FrameType::Science,
        vec![
            planned(Arc::new(AddOne), Criticality::Critical),
            planned(Arc::new(Failing), Criticality::Critical),
        ],
    );

    let outcome = pipeline.run_batch(vec![science_frame()], &ctx);
    assert!(outcome.outputs.is_empty());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].stage, "failing");
    assert_eq!(outcome.failures[0].frame_ids[0].as_str(), "sci-1");
}

#[test]
fn test_qc_record_reaches_sink() {
    let env = TestEnv::new();
    env.seed_bias_and_dark();
    env.seed_master(FrameType::Flat, "seed-flat", night_one().start, Some("V"), 1.0);
    let sink = Arc::new(CollectingQcSink::new());
    let ctx = context(&env, Arc::clone(&sink));

    let pipeline = StageCatalog::with_builtins()
        .plan(FrameType::Science, env.orchestrator.config())
        .unwrap();
    let frame = pipeline.run(science_frame(), &ctx).unwrap();

    let summaries = sink.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(&summaries[0].frame_id, frame.frame_id());
    assert!(summaries[0].metrics.contains_key("saturated_fraction"));
}

#[test]
fn test_missing_bpm_is_tolerated_unless_required() {
    let env = TestEnv::with_config(|config| config.selection.require_bpm = true);
    env.seed_bias_and_dark();
    let ctx = context(&env, Arc::new(CollectingQcSink::new()));
    let raw = raw(header("BIAS", night_two_at(1), 0.0), 100.0);
    let frame = Frame::from_raw(raw, "bias-1", &HeaderDefaults::default()).unwrap();

    let pipeline = StageCatalog::with_builtins()
        .plan(FrameType::Bias, env.orchestrator.config())
        .unwrap();
    let err = pipeline.run(frame.clone(), &ctx).unwrap_err();
    assert!(matches!(err, ReductionError::NotFound(_)));

    env.seed_master(FrameType::Bpm, "seed-bpm", night_one().start, None, 0.0);
    let reduced = pipeline.run(frame, &ctx).unwrap();
    assert!(reduced.calibrations.contains_key(&FrameType::Bpm));
}

#[test]
fn test_replacement_catalog_drives_reduction() {
    let mut catalog = StageCatalog::with_builtins();
    catalog.register(
        Stage::Single(Arc::new(Rejecting(builtin::BIAS_LEVEL))),
        Criticality::Critical,
    );
    let env = TestEnv::with_catalog(catalog);
    env.seed_bias_and_dark();
    let path = env.write_raw("bias-0", &raw_bias(0));

    let err = env.orchestrator.reduce_frame(&path).unwrap_err();
    assert!(matches!(err, ReductionError::Processing { ref stage, .. } if stage == builtin::BIAS_LEVEL));
    assert!(env
        .orchestrator
        .registry()
        .get(&darkroom::types::FrameId::new("bias-0"))
        .unwrap()
        .is_none());
}
