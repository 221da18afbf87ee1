//! Checksum-based insert / update / skip of Airtable records.

use serde::Serialize;
use sqlx::AnyConnection;
use tfp_adapters::{FromSourceRecord, MappingError};
use tfp_core::SourceRecord;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::dialect::SqlDialect;
use crate::store::{find_by_id, write_entity, Store, StoredEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upserted<E> {
    pub entity: E,
    pub outcome: UpsertOutcome,
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Upsert one record keyed by its id. Does not commit.
pub async fn upsert<E>(
    conn: &mut AnyConnection,
    dialect: &dyn SqlDialect,
    record: &SourceRecord,
) -> Result<Upserted<E>, UpsertError>
where
    E: StoredEntity + FromSourceRecord,
{
    let incoming = E::from_source_record(record)?;

    match find_by_id::<E>(conn, dialect, incoming.id()).await? {
        Some(existing) if existing.checksum() == incoming.checksum() => {
            debug!(entity = E::ENTITY, id = existing.id(), "skipped unchanged record");
            Ok(Upserted {
                entity: existing,
                outcome: UpsertOutcome::Skipped,
            })
        }
        Some(_) => {
            write_entity(conn, dialect, &incoming).await?;
            debug!(entity = E::ENTITY, id = incoming.id(), "updated record");
            Ok(Upserted {
                entity: incoming,
                outcome: UpsertOutcome::Updated,
            })
        }
        None => {
            write_entity(conn, dialect, &incoming).await?;
            debug!(entity = E::ENTITY, id = incoming.id(), "inserted record");
            Ok(Upserted {
                entity: incoming,
                outcome: UpsertOutcome::Inserted,
            })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkUpsertSummary {
    pub entity: &'static str,
    pub seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub rejected: usize,
}

impl BulkUpsertSummary {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn accepted(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }
}

/// Upsert every record in one transaction, committed once at the end.
///
/// Records the mapper rejects are logged and skipped; a database error
/// rolls the whole batch back.
pub async fn bulk_upsert<E>(
    store: &Store,
    records: &[SourceRecord],
) -> Result<BulkUpsertSummary, sqlx::Error>
where
    E: StoredEntity + FromSourceRecord,
{
    let mut summary = BulkUpsertSummary {
        entity: E::ENTITY,
        ..Default::default()
    };
    let mut tx = store.begin().await?;

    for record in records {
        summary.seen += 1;
        match upsert::<E>(&mut tx, store.dialect(), record).await {
            Ok(upserted) => summary.record(upserted.outcome),
            Err(UpsertError::Mapping(err)) => {
                summary.rejected += 1;
                let dump = serde_json::to_string_pretty(record).unwrap_or_else(|_| record.id.clone());
                error!(entity = E::ENTITY, %err, "record rejected by field mapping\n{dump}");
            }
            Err(UpsertError::Database(err)) => return Err(err),
        }
        if summary.seen % 100 == 0 {
            info!(entity = E::ENTITY, processed = summary.seen, "bulk upsert progress");
        }
    }

    tx.commit().await?;
    info!(
        entity = E::ENTITY,
        inserted = summary.inserted,
        updated = summary.updated,
        skipped = summary.skipped,
        rejected = summary.rejected,
        "bulk upsert complete"
    );
    Ok(summary)
}
