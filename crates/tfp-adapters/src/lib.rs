//! Airtable field mapping: source records into representative and bill rows.

use serde_json::Value as JsonValue;
use tfp_core::{ContentChecksum, NegativeBill, RelationType, Representative, SourceRecord};
use thiserror::Error;

pub const CRATE_NAME: &str = "tfp-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("record {record_id} is missing required field `{field}`")]
    MissingField {
        record_id: String,
        field: &'static str,
    },
    #[error("record {record_id} field `{field}` is not {expected}")]
    InvalidField {
        record_id: String,
        field: &'static str,
        expected: &'static str,
    },
}

/// Builds an entity row (checksum included) from an Airtable record.
pub trait FromSourceRecord: Sized {
    /// Human-readable entity name used in log lines.
    const ENTITY: &'static str;

    fn from_source_record(record: &SourceRecord) -> Result<Self, MappingError>;
}

impl FromSourceRecord for Representative {
    const ENTITY: &'static str = "Rep";

    fn from_source_record(record: &SourceRecord) -> Result<Self, MappingError> {
        let mut rep = Representative {
            id: record_id(record)?,
            name: required_text(record, "Name")?,
            district: required_text(record, "District")?,
            state: required_text(record, "State")?,
            role: required_text(record, "Role")?,
            created: required_text(record, "Created")?,
            modified: required_text(record, "Last Modified")?,
            political_party: optional_text(record, "Political Party")?,
            reelection_date: optional_text(record, "Up For Reelection On")?,
            website: optional_text(record, "Website")?,
            email: optional_text(record, "Email")?,
            facebook: optional_text(record, "Facebook")?,
            twitter: optional_text(record, "Twitter")?,
            capitol_address: optional_text(record, "Capitol Address")?,
            capitol_phone: optional_text(record, "Capitol Phone Number")?,
            district_address: optional_text(record, "District Address")?,
            district_phone: optional_text(record, "District Phone Number")?,
            ftm_eid: optional_integer(record, "Follow the Money EID")?,
            legiscan_id: optional_integer(record, "Legiscan ID")?,
            checksum: String::new(),
        };
        rep.checksum = rep.sha256();
        Ok(rep)
    }
}

impl FromSourceRecord for NegativeBill {
    const ENTITY: &'static str = "NegativeBills";

    fn from_source_record(record: &SourceRecord) -> Result<Self, MappingError> {
        let id = record_id(record)?;
        if record.created_time.is_empty() {
            return Err(MappingError::MissingField {
                record_id: record.id.clone(),
                field: "createdTime",
            });
        }
        let mut bill = NegativeBill {
            id,
            created: record.created_time.clone(),
            case_name: required_text(record, "Case Name")?,
            category: serialized_json(record, "Category"),
            expanded_category: serialized_json(record, "Expanded Category"),
            last_activity: optional_text(record, "Last Activity Date")?,
            last_modified: optional_text(record, "Last Modified")?,
            legiscan_id: optional_integer(record, "Legiscan Bill ID")?,
            progress: optional_text(record, "Progress")?,
            state: optional_text(record, "State")?,
            status: optional_text(record, "Status")?,
            summary: optional_text(record, "Summary")?,
            bill_information_link: optional_text(record, "Bill Information Link")?,
            checksum: String::new(),
        };
        bill.checksum = bill.sha256();
        Ok(bill)
    }
}

/// The record's Airtable id, which every entity requires.
pub fn record_id(record: &SourceRecord) -> Result<String, MappingError> {
    if record.id.trim().is_empty() {
        return Err(MappingError::MissingField {
            record_id: String::new(),
            field: "id",
        });
    }
    Ok(record.id.clone())
}

/// Representative field listing the bills linked by `kind`.
pub fn relation_field_name(kind: RelationType) -> &'static str {
    match kind {
        RelationType::YeaVote => "Yea Votes",
        RelationType::NayVote => "Nay Votes",
        RelationType::Sponsorship => "Sponsorships",
        RelationType::Contact => "Bills to Contact about",
    }
}

/// Bill ids referenced by a representative record for one relation kind.
///
/// An absent field yields an empty list.
pub fn relation_targets(
    record: &SourceRecord,
    kind: RelationType,
) -> Result<Vec<String>, MappingError> {
    let field = relation_field_name(kind);
    let invalid = || MappingError::InvalidField {
        record_id: record.id.clone(),
        field,
        expected: "a list of record ids",
    };
    let Some(value) = record.field(field) else {
        return Ok(Vec::new());
    };
    let items = value.as_array().ok_or_else(invalid)?;
    items
        .iter()
        .map(|item| item.as_str().map(ToString::to_string).ok_or_else(invalid))
        .collect()
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required_text(record: &SourceRecord, field: &'static str) -> Result<String, MappingError> {
    match record.field(field) {
        Some(value) => scalar_text(value).ok_or_else(|| MappingError::InvalidField {
            record_id: record.id.clone(),
            field,
            expected: "text",
        }),
        None => Err(MappingError::MissingField {
            record_id: record.id.clone(),
            field,
        }),
    }
}

fn optional_text(
    record: &SourceRecord,
    field: &'static str,
) -> Result<Option<String>, MappingError> {
    match record.field(field) {
        Some(_) => required_text(record, field).map(Some),
        None => Ok(None),
    }
}

fn optional_integer(
    record: &SourceRecord,
    field: &'static str,
) -> Result<Option<i64>, MappingError> {
    let Some(value) = record.field(field) else {
        return Ok(None);
    };
    let parsed = match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.map(Some).ok_or_else(|| MappingError::InvalidField {
        record_id: record.id.clone(),
        field,
        expected: "an integer",
    })
}

/// JSON text of a field; an absent field serializes as `null`.
fn serialized_json(record: &SourceRecord, field: &str) -> Option<String> {
    Some(
        record
            .field(field)
            .map_or_else(|| JsonValue::Null.to_string(), JsonValue::to_string),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn galvin() -> SourceRecord {
        serde_json::from_value(json!({
            "createdTime": "2023-03-29T22:00:53.000Z",
            "fields": {
                "Capitol Address": "24 Beacon St., Room 166, Boston, MA 02133",
                "Capitol Phone Number": "(617) 722-2692",
                "Created": "2023-03-29T22:00:53.000Z",
                "District": "6th Norfolk",
                "Email": "William.Galvin@mahouse.gov",
                "Follow the Money EID": 839710,
                "Last Modified": "2023-07-11T22:15:31.000Z",
                "Legiscan ID": 2441,
                "Name": "William Galvin",
                "Political Party": "Democrat",
                "Role": "House Representative",
                "State": "Massachusetts",
                "Up For Reelection On": "2022-11-05"
            },
            "id": "rec02eJ7tvAv6H8LX"
        }))
        .unwrap()
    }

    #[test]
    fn maps_representative_fields() {
        let rep = Representative::from_source_record(&galvin()).unwrap();
        assert_eq!(rep.id, "rec02eJ7tvAv6H8LX");
        assert_eq!(rep.name, "William Galvin");
        assert_eq!(rep.district, "6th Norfolk");
        assert_eq!(rep.modified, "2023-07-11T22:15:31.000Z");
        assert_eq!(rep.political_party.as_deref(), Some("Democrat"));
        assert_eq!(rep.ftm_eid, Some(839710));
        assert_eq!(rep.legiscan_id, Some(2441));
        assert_eq!(rep.twitter, None);
        assert_eq!(rep.checksum, rep.sha256());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut record = galvin();
        record.fields.remove("Role");
        let err = Representative::from_source_record(&record).unwrap_err();
        assert_eq!(
            err,
            MappingError::MissingField {
                record_id: "rec02eJ7tvAv6H8LX".into(),
                field: "Role"
            }
        );
    }

    #[test]
    fn numeric_district_is_accepted_as_text() {
        let record = galvin().with_field("District", 85);
        let rep = Representative::from_source_record(&record).unwrap();
        assert_eq!(rep.district, "85");
    }

    #[test]
    fn non_integer_legiscan_id_is_invalid() {
        let record = galvin().with_field("Legiscan ID", json!(["x"]));
        assert!(matches!(
            Representative::from_source_record(&record),
            Err(MappingError::InvalidField { field: "Legiscan ID", .. })
        ));
    }

    #[test]
    fn maps_bill_fields_and_serializes_categories() {
        let record = SourceRecord::new("recs99WthsQVu2BUe", "2023-03-07T18:17:13.000Z")
            .with_field("Case Name", "OH HB68")
            .with_field("State", "Ohio")
            .with_field("Category", json!(["Health Care", "Sports"]))
            .with_field("Legiscan Bill ID", 1723919);
        let bill = NegativeBill::from_source_record(&record).unwrap();
        assert_eq!(bill.case_name, "OH HB68");
        assert_eq!(bill.created, "2023-03-07T18:17:13.000Z");
        assert_eq!(bill.category.as_deref(), Some(r#"["Health Care","Sports"]"#));
        assert_eq!(bill.expanded_category.as_deref(), Some("null"));
        assert_eq!(bill.legiscan_id, Some(1723919));
        assert_eq!(bill.checksum, bill.sha256());
    }

    #[test]
    fn record_without_id_is_rejected() {
        let mut rep = galvin();
        rep.id = String::new();
        assert_eq!(
            Representative::from_source_record(&rep),
            Err(MappingError::MissingField {
                record_id: String::new(),
                field: "id"
            })
        );

        let bill = SourceRecord::new("", "2023-03-07T18:17:13.000Z").with_field("Case Name", "OH HB68");
        assert!(matches!(
            NegativeBill::from_source_record(&bill),
            Err(MappingError::MissingField { field: "id", .. })
        ));
    }

    #[test]
    fn bill_without_case_name_is_rejected() {
        let record = SourceRecord::new("recBill", "2023-03-07T18:17:13.000Z");
        assert!(matches!(
            NegativeBill::from_source_record(&record),
            Err(MappingError::MissingField { field: "Case Name", .. })
        ));
    }

    #[test]
    fn relation_targets_read_list_fields() {
        let record = galvin()
            .with_field("Yea Votes", json!(["Yea1", "Yea2"]))
            .with_field("Bills to Contact about", json!(["Contact1"]));
        assert_eq!(
            relation_targets(&record, RelationType::YeaVote).unwrap(),
            vec!["Yea1", "Yea2"]
        );
        assert_eq!(
            relation_targets(&record, RelationType::Contact).unwrap(),
            vec!["Contact1"]
        );
        assert!(relation_targets(&record, RelationType::NayVote)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn malformed_relation_list_is_invalid() {
        let record = galvin().with_field("Sponsorships", "recNotAList");
        assert!(matches!(
            relation_targets(&record, RelationType::Sponsorship),
            Err(MappingError::InvalidField { field: "Sponsorships", .. })
        ));
    }
}
