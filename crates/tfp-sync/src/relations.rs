//! Representative to bill links (votes, sponsorships, contact requests).

use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::{AnyConnection, Connection};
use tfp_adapters::{record_id, relation_targets, MappingError};
use tfp_core::{RelationType, SourceRecord};
use thiserror::Error;
use tracing::{error, info};

use crate::dialect::SqlDialect;
use crate::store::{Store, RELATIONS_TABLE};

const RELATION_COLUMNS: [&str; 3] = ["rep_id", "negative_bills_id", "relation_type"];

#[derive(Debug, Error)]
pub enum RelationError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Link `rep_id` to `bill_id` unless the same link already exists.
///
/// Returns `true` when a row was written.
pub async fn rep_negative_bill_relation_insert(
    conn: &mut AnyConnection,
    dialect: &dyn SqlDialect,
    rep_id: &str,
    bill_id: &str,
    kind: RelationType,
) -> Result<bool, sqlx::Error> {
    let exists_sql = format!(
        "SELECT COUNT(*) FROM {RELATIONS_TABLE} \
         WHERE rep_id = {} AND negative_bills_id = {} AND relation_type = {}",
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.placeholder(3),
    );
    let existing: i64 = sqlx::query_scalar(&exists_sql)
        .bind(rep_id.to_string())
        .bind(bill_id.to_string())
        .bind(kind.as_str())
        .fetch_one(&mut *conn)
        .await?;
    if existing > 0 {
        return Ok(false);
    }

    let insert_sql = dialect.insert_ignore_statement(RELATIONS_TABLE, &RELATION_COLUMNS);
    let result = sqlx::query(&insert_sql)
        .bind(rep_id.to_string())
        .bind(bill_id.to_string())
        .bind(kind.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelationKindCount {
    pub referenced: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelationCounts {
    pub per_kind: BTreeMap<RelationType, RelationKindCount>,
    pub failed_reps: usize,
}

impl RelationCounts {
    pub fn kind(&self, kind: RelationType) -> RelationKindCount {
        self.per_kind.get(&kind).copied().unwrap_or_default()
    }

    pub fn total_referenced(&self) -> usize {
        self.per_kind.values().map(|c| c.referenced).sum()
    }

    pub fn total_inserted(&self) -> usize {
        self.per_kind.values().map(|c| c.inserted).sum()
    }
}

/// Links found on one representative, applied together or not at all.
async fn build_rep_relations(
    conn: &mut AnyConnection,
    dialect: &dyn SqlDialect,
    record: &SourceRecord,
) -> Result<Vec<(RelationType, bool)>, RelationError> {
    let rep_id = record_id(record)?;
    let mut targets = Vec::new();
    for kind in RelationType::ALL {
        for bill_id in relation_targets(record, kind)? {
            targets.push((kind, bill_id));
        }
    }

    let mut savepoint = conn.begin().await?;
    let mut written = Vec::with_capacity(targets.len());
    for (kind, bill_id) in &targets {
        let inserted =
            rep_negative_bill_relation_insert(&mut savepoint, dialect, &rep_id, bill_id, *kind)
                .await?;
        written.push((*kind, inserted));
    }
    savepoint.commit().await?;
    Ok(written)
}

/// Build every link referenced by `records` in one transaction.
///
/// A representative whose links cannot be built is logged and skipped.
pub async fn rep_build_all_relations(
    store: &Store,
    records: &[SourceRecord],
) -> Result<RelationCounts, sqlx::Error> {
    let mut counts = RelationCounts::default();
    for kind in RelationType::ALL {
        counts.per_kind.insert(kind, RelationKindCount::default());
    }
    let mut tx = store.begin().await?;
    let mut processed = 0usize;

    for record in records {
        match build_rep_relations(&mut tx, store.dialect(), record).await {
            Ok(written) => {
                for (kind, inserted) in written {
                    let entry = counts.per_kind.entry(kind).or_default();
                    entry.referenced += 1;
                    if inserted {
                        entry.inserted += 1;
                    }
                    processed += 1;
                    if processed % 500 == 0 {
                        info!(processed, "relation build progress");
                    }
                }
            }
            Err(err) => {
                counts.failed_reps += 1;
                error!(rep_id = %record.id, %err, "failed to build relations for representative");
            }
        }
    }

    tx.commit().await?;
    for (kind, count) in &counts.per_kind {
        info!(
            relation_type = %kind,
            referenced = count.referenced,
            inserted = count.inserted,
            "relations built"
        );
    }
    info!(
        referenced = counts.total_referenced(),
        inserted = counts.total_inserted(),
        failed_reps = counts.failed_reps,
        "relation build complete"
    );
    Ok(counts)
}
