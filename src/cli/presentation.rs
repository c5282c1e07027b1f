//! CLI presentation: render reports and records as text tables or JSON.

use crate::comparer::Verdict;
use crate::error::ReductionError;
use crate::orchestrator::{FrameReport, NightReport, ReductionOutcome};
use crate::registry::CalibrationRecord;
use crate::stacking::{GroupOutcome, StackingOutcome};
use comfy_table::Table;
use serde_json::json;

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(header);
    table
}

fn verdict_text(verdict: Option<&Verdict>) -> String {
    match verdict {
        None => "-".to_string(),
        Some(v) => match v.score {
            Some(score) => format!("{} ({:.3})", v.status, score),
            None => v.status.to_string(),
        },
    }
}

pub fn format_frame_reports(reports: &[FrameReport]) -> String {
    let mut out = table(vec!["File", "Result", "Frame", "Verdict"]);
    for report in reports {
        let file = report.location.display().to_string();
        let row = match &report.result {
            Ok(ReductionOutcome::Reduced {
                frame_id,
                frame_type,
                verdict,
                ..
            }) => vec![
                file,
                format!("reduced {}", frame_type),
                frame_id.to_string(),
                verdict_text(verdict.as_ref()),
            ],
            Ok(ReductionOutcome::Skipped { reason }) => {
                vec![file, format!("skipped: {}", reason), "-".into(), "-".into()]
            }
            Err(e) => vec![file, format!("failed: {}", e), "-".into(), "-".into()],
        };
        out.add_row(row);
    }
    let failed = reports.iter().filter(|r| r.is_failure()).count();
    format!("{}\n{} file(s), {} failed", out, reports.len(), failed)
}

pub fn format_stacking(outcome: &StackingOutcome) -> String {
    let reports = match outcome {
        StackingOutcome::NotReady => return "Window not ready; nothing stacked".to_string(),
        StackingOutcome::Completed(reports) => reports,
    };
    if reports.is_empty() {
        return "No individual calibrations in window".to_string();
    }
    let mut out = table(vec!["Group", "Result", "Master", "Verdict"]);
    for report in reports {
        let group = report.key.to_string();
        let row = match &report.outcome {
            GroupOutcome::Stacked { master, verdict } => vec![
                group,
                "stacked".to_string(),
                master.to_string(),
                verdict_text(Some(verdict)),
            ],
            GroupOutcome::Skipped { master } => {
                vec![group, "skipped".to_string(), master.to_string(), "good".into()]
            }
            GroupOutcome::Insufficient { usable, required } => vec![
                group,
                format!("insufficient ({} of {})", usable, required),
                "-".into(),
                "-".into(),
            ],
            GroupOutcome::Failed { error } => {
                vec![group, format!("failed: {}", error), "-".into(), "-".into()]
            }
        };
        out.add_row(row);
    }
    out.to_string()
}

pub fn format_night(report: &NightReport) -> String {
    let mut sections = vec![format_frame_reports(&report.frames)];
    for (frame_type, outcome) in &report.stacking {
        sections.push(format!("{} stacking:\n{}", frame_type, format_stacking(outcome)));
    }
    sections.join("\n\n")
}

pub fn format_records_text(records: &[CalibrationRecord]) -> String {
    if records.is_empty() {
        return "No calibration records".to_string();
    }
    let mut out = table(vec![
        "Frame", "Type", "Instrument", "Observed", "Master", "Status", "Superseded by",
    ]);
    for r in records {
        out.add_row(vec![
            r.frame_id.to_string(),
            r.frame_type.to_string(),
            r.instrument.to_string(),
            r.observed_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            if r.is_master { "yes" } else { "no" }.to_string(),
            r.status.to_string(),
            r.superseded_by
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    out.to_string()
}

pub fn format_records_json(records: &[CalibrationRecord]) -> Result<String, ReductionError> {
    let value = json!({ "count": records.len(), "records": records });
    serde_json::to_string_pretty(&value)
        .map_err(|e| ReductionError::Config(format!("Failed to render JSON: {}", e)))
}
