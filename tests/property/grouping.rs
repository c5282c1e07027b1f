//! Properties of attribute grouping

use chrono::{Duration, TimeZone, Utc};
use darkroom::grouping::{group_by_attributes, GroupingPolicy, Grouped};
use darkroom::registry::{CalibrationRecord, CalibrationStatus};
use darkroom::types::{Attributes, FrameId, FrameType, InstrumentId};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::path::PathBuf;

const CAMERAS: [&str; 3] = ["fa14", "fa15", "fa16"];
const TYPES: [FrameType; 3] = [FrameType::Bias, FrameType::Dark, FrameType::Flat];
const BINNINGS: [&str; 2] = ["1 1", "2 2"];
const FILTERS: [&str; 3] = ["V", "R", "B"];

fn record(index: usize, camera: usize, kind: usize, binning: usize, filter: usize) -> CalibrationRecord {
    let observed_at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(index as i64);
    let mut attributes = Attributes::new();
    attributes.insert("binning".into(), BINNINGS[binning].into());
    attributes.insert("filter".into(), FILTERS[filter].into());
    CalibrationRecord {
        frame_id: FrameId::new(format!("frame-{}", index)),
        frame_type: TYPES[kind],
        instrument: InstrumentId::new("ogg", "clma", "2m0a", CAMERAS[camera]),
        observed_at,
        created_at: observed_at,
        is_master: false,
        status: CalibrationStatus::Good,
        attributes,
        exposure_time: 1.0,
        location: PathBuf::from(format!("/archive/frame-{}.frame", index)),
        window: None,
        members: Vec::new(),
        superseded_by: None,
    }
}

fn records() -> impl Strategy<Value = Vec<CalibrationRecord>> {
    prop::collection::vec((0..3usize, 0..3usize, 0..2usize, 0..3usize), 0..40).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (camera, kind, binning, filter))| record(i, camera, kind, binning, filter))
            .collect()
    })
}

proptest! {
    #[test]
    fn every_item_lands_in_exactly_one_group(items in records()) {
        let policy = GroupingPolicy::default();
        let ids: BTreeSet<FrameId> = items.iter().map(|r| r.frame_id.clone()).collect();
        let groups = group_by_attributes(items.clone(), &policy).unwrap();

        let mut seen = BTreeSet::new();
        for members in groups.values() {
            for member in members {
                prop_assert!(seen.insert(member.frame_id.clone()), "{} grouped twice", member.frame_id);
            }
        }
        prop_assert_eq!(seen, ids);
    }

    #[test]
    fn groups_are_homogeneous(items in records()) {
        let policy = GroupingPolicy::default();
        let groups = group_by_attributes(items, &policy).unwrap();

        for (key, members) in &groups {
            prop_assert!(!members.is_empty());
            for member in members {
                prop_assert_eq!(Grouped::instrument(member), &key.instrument);
                prop_assert_eq!(Grouped::frame_type(member), key.frame_type);
                for (attr, value) in &key.values {
                    prop_assert_eq!(member.attribute(attr), Some(value.as_str()));
                }
            }
        }
    }
}

/// Flats split on filter, biases do not.
#[test]
fn test_filter_only_splits_flats() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&records(), |items| {
            let groups = group_by_attributes(items, &GroupingPolicy::default()).unwrap();
            for key in groups.keys() {
                let has_filter = key.values.iter().any(|(k, _)| k == "filter");
                assert_eq!(has_filter, key.frame_type == FrameType::Flat);
            }
            Ok(())
        })
        .unwrap();
}
