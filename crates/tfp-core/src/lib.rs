//! Core domain model and content checksums for the TFP representative widget.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "tfp-core";

/// A record as returned by the Airtable list-records endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Empty when the source omitted it; mappers reject such records.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "createdTime", default)]
    pub created_time: String,
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, created_time: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_time: created_time.into(),
            fields: Map::new(),
        }
    }

    /// Present, non-null field value.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn with_field(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

/// Kind of link between a representative and a bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    YeaVote,
    NayVote,
    Sponsorship,
    Contact,
}

impl RelationType {
    pub const ALL: [RelationType; 4] = [
        RelationType::YeaVote,
        RelationType::NayVote,
        RelationType::Sponsorship,
        RelationType::Contact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::YeaVote => "yea_vote",
            RelationType::NayVote => "nay_vote",
            RelationType::Sponsorship => "sponsorship",
            RelationType::Contact => "contact",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRelationType(pub String);

impl fmt::Display for UnknownRelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown relation type `{}`", self.0)
    }
}

impl std::error::Error for UnknownRelationType {}

impl FromStr for RelationType {
    type Err = UnknownRelationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelationType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownRelationType(s.to_string()))
    }
}

/// Rendering of an absent value inside a content checksum.
pub const ABSENT_VALUE: &str = "None";

/// A single persisted column value, used both for hashing and SQL binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Text(Option<String>),
    Integer(Option<i64>),
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Text(Some(v)) => f.write_str(v),
            ColumnValue::Integer(Some(v)) => write!(f, "{v}"),
            ColumnValue::Text(None) | ColumnValue::Integer(None) => f.write_str(ABSENT_VALUE),
        }
    }
}

impl From<&String> for ColumnValue {
    fn from(value: &String) -> Self {
        ColumnValue::Text(Some(value.clone()))
    }
}

impl From<&Option<String>> for ColumnValue {
    fn from(value: &Option<String>) -> Self {
        ColumnValue::Text(value.clone())
    }
}

impl From<Option<i64>> for ColumnValue {
    fn from(value: Option<i64>) -> Self {
        ColumnValue::Integer(value)
    }
}

/// Content hash over an entity's persisted columns.
///
/// `content_columns` must never include the checksum column itself, otherwise
/// the hash would depend on its own previous value.
pub trait ContentChecksum {
    fn content_columns(&self) -> Vec<(&'static str, ColumnValue)>;

    /// SHA-256 over the column values concatenated in column-name order.
    fn sha256(&self) -> String {
        content_sha256(self.content_columns())
    }
}

/// Hex SHA-256 of `columns`, sorted by name, values concatenated.
pub fn content_sha256(mut columns: Vec<(&str, ColumnValue)>) -> String {
    columns.sort_by_key(|(name, _)| *name);
    let mut hasher = Sha256::new();
    for (_, value) in &columns {
        hasher.update(value.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// State or national representative.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Representative {
    pub id: String,
    pub name: String,
    pub district: String,
    pub role: String,
    pub state: String,
    pub created: String,
    pub modified: String,
    pub political_party: Option<String>,
    pub reelection_date: Option<String>,
    pub website: Option<String>,
    pub email: Option<String>,
    pub facebook: Option<String>,
    pub twitter: Option<String>,
    pub capitol_address: Option<String>,
    pub capitol_phone: Option<String>,
    pub district_address: Option<String>,
    pub district_phone: Option<String>,
    /// Follow the Money entity id.
    pub ftm_eid: Option<i64>,
    pub legiscan_id: Option<i64>,
    pub checksum: String,
}

impl ContentChecksum for Representative {
    fn content_columns(&self) -> Vec<(&'static str, ColumnValue)> {
        vec![
            ("id", (&self.id).into()),
            ("name", (&self.name).into()),
            ("district", (&self.district).into()),
            ("role", (&self.role).into()),
            ("state", (&self.state).into()),
            ("created", (&self.created).into()),
            ("modified", (&self.modified).into()),
            ("political_party", (&self.political_party).into()),
            ("reelection_date", (&self.reelection_date).into()),
            ("website", (&self.website).into()),
            ("email", (&self.email).into()),
            ("facebook", (&self.facebook).into()),
            ("twitter", (&self.twitter).into()),
            ("capitol_address", (&self.capitol_address).into()),
            ("capitol_phone", (&self.capitol_phone).into()),
            ("district_address", (&self.district_address).into()),
            ("district_phone", (&self.district_phone).into()),
            ("ftm_eid", self.ftm_eid.into()),
            ("legiscan_id", self.legiscan_id.into()),
        ]
    }
}

/// Bill tracked as harmful ("negative") legislation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NegativeBill {
    pub id: String,
    pub case_name: String,
    pub created: String,
    pub bill_information_link: Option<String>,
    /// JSON-serialized list of category names.
    pub category: Option<String>,
    pub expanded_category: Option<String>,
    pub last_activity: Option<String>,
    pub last_modified: Option<String>,
    pub legiscan_id: Option<i64>,
    pub progress: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub checksum: String,
}

impl ContentChecksum for NegativeBill {
    fn content_columns(&self) -> Vec<(&'static str, ColumnValue)> {
        vec![
            ("id", (&self.id).into()),
            ("case_name", (&self.case_name).into()),
            ("created", (&self.created).into()),
            ("bill_information_link", (&self.bill_information_link).into()),
            ("category", (&self.category).into()),
            ("expanded_category", (&self.expanded_category).into()),
            ("last_activity", (&self.last_activity).into()),
            ("last_modified", (&self.last_modified).into()),
            ("legiscan_id", self.legiscan_id.into()),
            ("progress", (&self.progress).into()),
            ("state", (&self.state).into()),
            ("status", (&self.status).into()),
            ("summary", (&self.summary).into()),
        ]
    }
}

/// Row of the representative-to-bill link table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub rep_id: String,
    pub negative_bills_id: String,
    pub relation_type: RelationType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jane(id: &str) -> Representative {
        Representative {
            id: id.to_string(),
            name: "Jane Doe".to_string(),
            district: "AL5".to_string(),
            ..Default::default()
        }
    }

    /// Columns of a representative with only id, name, and district set.
    fn sparse_columns(id: &str) -> Vec<(&'static str, ColumnValue)> {
        jane(id)
            .content_columns()
            .into_iter()
            .map(|(name, value)| match (name, value) {
                ("id" | "name" | "district", value) => (name, value),
                (_, ColumnValue::Integer(_)) => (name, ColumnValue::Integer(None)),
                (_, ColumnValue::Text(_)) => (name, ColumnValue::Text(None)),
            })
            .collect()
    }

    #[test]
    fn absent_values_hash_as_none() {
        assert_eq!(ColumnValue::Text(None).to_string(), "None");
        assert_eq!(ColumnValue::Integer(None).to_string(), "None");
        assert_eq!(ColumnValue::Integer(Some(2441)).to_string(), "2441");
        assert_eq!(
            content_sha256(sparse_columns("Test1")),
            "2b0f97527663a16ff611a621d6f86ff966705ac7918d08d7c3e69a35f611cd1a"
        );
    }

    #[test]
    fn checksum_is_stable_and_ordered_by_column_name() {
        let rep = jane("Test1");
        assert_eq!(rep.sha256(), rep.clone().sha256());

        let mut shuffled = rep.content_columns();
        shuffled.reverse();
        assert_eq!(content_sha256(shuffled), rep.sha256());
    }

    #[test]
    fn checksum_differs_when_any_field_differs() {
        assert_eq!(
            content_sha256(sparse_columns("Test2")),
            "fa0b7f5d2af472a38815d8bbc97a03f470f4eb33a516cfb5c034a7620ca9e890"
        );
        assert_ne!(jane("Test1").sha256(), jane("Test2").sha256());

        let mut with_party = jane("Test1");
        with_party.political_party = Some("Independent".into());
        assert_ne!(with_party.sha256(), jane("Test1").sha256());
    }

    #[test]
    fn checksum_ignores_the_stored_checksum() {
        let mut rep = jane("Test1");
        let before = rep.sha256();
        rep.checksum = "stale".into();
        assert_eq!(rep.sha256(), before);
    }

    #[test]
    fn relation_type_round_trips_through_str() {
        for kind in RelationType::ALL {
            assert_eq!(kind.as_str().parse::<RelationType>().unwrap(), kind);
        }
        assert!("sponsorship_vote".parse::<RelationType>().is_err());
    }

    #[test]
    fn source_record_parses_airtable_shape() {
        let record: SourceRecord = serde_json::from_str(
            r#"{"id":"rec1","createdTime":"2023-03-29T22:00:53.000Z","fields":{"Name":"A","Email":null}}"#,
        )
        .unwrap();
        assert_eq!(record.id, "rec1");
        assert_eq!(record.field("Name").and_then(|v| v.as_str()), Some("A"));
        assert!(record.field("Email").is_none());
    }

    #[test]
    fn source_record_without_id_still_parses() {
        let records: Vec<SourceRecord> = serde_json::from_str(
            r#"[{"id":"rec1","fields":{}},{"createdTime":"2023-03-29T22:00:53.000Z","fields":{"Name":"B"}}]"#,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "");
        assert_eq!(records[1].created_time, "2023-03-29T22:00:53.000Z");
    }
}
