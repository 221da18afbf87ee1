use std::path::{Path, PathBuf};

use tfp_adapters::{relation_targets, FromSourceRecord, MappingError};
use tfp_core::{NegativeBill, RelationType, Representative, SourceRecord};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/airtable")
        .join(name)
}

fn load(name: &str) -> Vec<SourceRecord> {
    let text = std::fs::read_to_string(fixture(name)).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn state_rep_fixture_maps_except_incomplete_record() {
    let results = load("state_reps.json")
        .iter()
        .map(Representative::from_source_record)
        .collect::<Vec<_>>();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().name, "Tim Barhorst");
    assert_eq!(results[1].as_ref().unwrap().state, "Massachusetts");
    assert!(matches!(
        &results[2],
        Err(MappingError::MissingField { field: "Role", .. })
    ));
}

#[test]
fn bill_fixture_maps_every_record() {
    let bills = load("negative_bills.json")
        .iter()
        .map(NegativeBill::from_source_record)
        .collect::<Result<Vec<_>, _>>()
        .expect("all bills map");
    let names = bills.iter().map(|b| b.case_name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["OH HB68", "AL HB261"]);
    assert_ne!(bills[0].checksum, bills[1].checksum);
}

#[test]
fn fixture_relations_reference_known_bills() {
    let reps = load("state_reps.json");
    let barhorst = &reps[0];
    assert_eq!(
        relation_targets(barhorst, RelationType::Sponsorship).unwrap(),
        vec!["recs99WthsQVu2BUe"]
    );
    assert!(relation_targets(barhorst, RelationType::NayVote)
        .unwrap()
        .is_empty());
}
