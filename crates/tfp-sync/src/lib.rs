//! Sync pipeline: Airtable fetch, dump, and import into the relational store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tfp_core::{NegativeBill, Representative, SourceRecord};
use tfp_source::{
    load_table, AirtableClient, AirtableConfig, DumpStore, SourceTable, StoredDump,
    TokenBucketConfig,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

mod dialect;
mod relations;
mod store;
mod upsert;

pub use dialect::{
    dialect_for_url, ColumnKind, ColumnSpec, DialectError, PostgresDialect, SqlDialect,
    SqliteDialect,
};
pub use relations::{
    rep_build_all_relations, rep_negative_bill_relation_insert, RelationCounts, RelationError,
    RelationKindCount,
};
pub use store::{
    find_by_id, schema_statements, write_entity, Store, StoreConfig, StoreError, StoredEntity,
    BILLS_TABLE, RELATIONS_TABLE, REPS_TABLE,
};
pub use upsert::{bulk_upsert, upsert, BulkUpsertSummary, UpsertError, UpsertOutcome, Upserted};

pub const CRATE_NAME: &str = "tfp-sync";

/// Airtable table ids, one per mirrored table.
#[derive(Debug, Clone, Default)]
pub struct SourceTableIds {
    pub state_reps: String,
    pub national_reps: String,
    pub negative_bills: String,
}

impl SourceTableIds {
    pub fn id_for(&self, table: SourceTable) -> &str {
        match table {
            SourceTable::StateReps => &self.state_reps,
            SourceTable::NationalReps => &self.national_reps,
            SourceTable::NegativeBills => &self.negative_bills,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub airtable_api_url: String,
    pub airtable_base: String,
    pub airtable_token: String,
    pub tables: SourceTableIds,
    pub requests_per_second: u32,
    pub dump_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).unwrap_or_default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://tfp.db?mode=rwc".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            airtable_api_url: std::env::var("AIRTABLE_API_URL")
                .unwrap_or_else(|_| AirtableConfig::default().api_url),
            airtable_base: var("AIRTABLE_BASE"),
            airtable_token: var("AIRTABLE_API_TOKEN"),
            tables: SourceTableIds {
                state_reps: var(SourceTable::StateReps.env_key()),
                national_reps: var(SourceTable::NationalReps.env_key()),
                negative_bills: var(SourceTable::NegativeBills.env_key()),
            },
            requests_per_second: std::env::var("AIRTABLE_REQUESTS_PER_SECOND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            dump_dir: std::env::var("TFP_DUMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./dumps")),
            scheduler_enabled: std::env::var("TFP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            user_agent: std::env::var("TFP_USER_AGENT")
                .unwrap_or_else(|_| "tfp-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("TFP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            max_connections: self.db_max_connections,
        }
    }

    pub fn airtable_config(&self) -> AirtableConfig {
        AirtableConfig {
            api_url: self.airtable_api_url.clone(),
            base_id: self.airtable_base.clone(),
            token: self.airtable_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: (self.requests_per_second > 0)
                .then(|| TokenBucketConfig::per_second(self.requests_per_second)),
        }
    }
}

/// Records of the three mirrored tables.
#[derive(Debug, Clone, Default)]
pub struct SourceTables {
    pub state_reps: Vec<SourceRecord>,
    pub national_reps: Vec<SourceRecord>,
    pub negative_bills: Vec<SourceRecord>,
}

impl SourceTables {
    pub fn records(&self, table: SourceTable) -> &[SourceRecord] {
        match table {
            SourceTable::StateReps => &self.state_reps,
            SourceTable::NationalReps => &self.national_reps,
            SourceTable::NegativeBills => &self.negative_bills,
        }
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        SourceTable::ALL
            .iter()
            .map(|t| (t.dump_name().to_string(), self.records(*t).len()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub reps: BulkUpsertSummary,
    pub bills: BulkUpsertSummary,
    pub national_reps_seen: usize,
    pub relations: Option<RelationCounts>,
}

/// Upsert representatives, then bills, then (optionally) build relations.
pub async fn import_tables(
    store: &Store,
    tables: &SourceTables,
    build_relations: bool,
) -> Result<ImportSummary> {
    let reps = bulk_upsert::<Representative>(store, &tables.state_reps)
        .await
        .context("upserting representatives")?;
    let bills = bulk_upsert::<NegativeBill>(store, &tables.negative_bills)
        .await
        .context("upserting negative bills")?;
    info!(
        records = tables.national_reps.len(),
        "national representatives fetched (not stored)"
    );

    let relations = if build_relations {
        Some(
            rep_build_all_relations(store, &tables.state_reps)
                .await
                .context("building representative relations")?,
        )
    } else {
        info!("relation build skipped");
        None
    };

    Ok(ImportSummary {
        reps,
        bills,
        national_reps_seen: tables.national_reps.len(),
        relations,
    })
}

/// Dump files for an offline import.
#[derive(Debug, Clone)]
pub struct ImportFiles {
    pub state_reps: PathBuf,
    pub national_reps: Option<PathBuf>,
    pub negative_bills: Option<PathBuf>,
}

pub async fn import_from_files(
    store: &Store,
    files: &ImportFiles,
    build_relations: bool,
) -> Result<ImportSummary> {
    let tables = SourceTables {
        state_reps: load_table(&files.state_reps).await?,
        national_reps: load_optional(files.national_reps.as_ref()).await?,
        negative_bills: load_optional(files.negative_bills.as_ref()).await?,
    };
    import_tables(store, &tables, build_relations).await
}

async fn load_optional(path: Option<&PathBuf>) -> Result<Vec<SourceRecord>> {
    match path {
        Some(path) => load_table(path).await,
        None => Ok(Vec::new()),
    }
}

/// Fetch all three tables, one after another.
pub async fn fetch_tables(client: &AirtableClient, ids: &SourceTableIds) -> Result<SourceTables> {
    let mut tables = SourceTables::default();
    for table in SourceTable::ALL {
        let table_id = ids.id_for(table);
        let records = client
            .fetch_table(table_id)
            .await
            .with_context(|| format!("fetching {} ({table_id})", table.dump_name()))?;
        info!(table = table.dump_name(), records = records.len(), "fetched table");
        match table {
            SourceTable::StateReps => tables.state_reps = records,
            SourceTable::NationalReps => tables.national_reps = records,
            SourceTable::NegativeBills => tables.negative_bills = records,
        }
    }
    Ok(tables)
}

pub async fn write_dumps(
    dumps: &DumpStore,
    fetched_at: DateTime<Utc>,
    tables: &SourceTables,
) -> Result<Vec<StoredDump>> {
    let mut written = Vec::with_capacity(SourceTable::ALL.len());
    for table in SourceTable::ALL {
        let stored = dumps
            .write_table(table.dump_name(), fetched_at, tables.records(table))
            .await?;
        info!(
            table = table.dump_name(),
            path = %stored.path.display(),
            deduplicated = stored.deduplicated,
            "wrote table dump"
        );
        written.push(stored);
    }
    Ok(written)
}

/// Fetch and dump every table without touching the store.
pub async fn dump_once(config: &SyncConfig) -> Result<Vec<StoredDump>> {
    let client = AirtableClient::new(config.airtable_config())?;
    let dumps = DumpStore::new(config.dump_dir.clone());
    let fetched_at = Utc::now();
    let tables = fetch_tables(&client, &config.tables).await?;
    write_dumps(&dumps, fetched_at, &tables).await
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub table_counts: BTreeMap<String, usize>,
    pub dumps: Vec<String>,
    pub import: ImportSummary,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Store,
    client: AirtableClient,
    dumps: DumpStore,
}

impl SyncPipeline {
    /// Connect and migrate the configured store.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = Store::connect(&config.store_config())
            .await
            .context("connecting to store")?;
        store.migrate().await.context("migrating store")?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: SyncConfig, store: Store) -> Result<Self> {
        let client = AirtableClient::new(config.airtable_config())?;
        let dumps = DumpStore::new(config.dump_dir.clone());
        Ok(Self {
            config,
            store,
            client,
            dumps,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "sync run started");

        let tables = fetch_tables(&self.client, &self.config.tables).await?;
        let dumps = write_dumps(&self.dumps, started_at, &tables).await?;
        let import = import_tables(&self.store, &tables, true).await?;

        let finished_at = Utc::now();
        info!(%run_id, elapsed_ms = (finished_at - started_at).num_milliseconds(), "sync run finished");
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            table_counts: tables.counts(),
            dumps: dumps.iter().map(|d| d.path.display().to_string()).collect(),
            import,
        })
    }
}

/// Scheduler running `run_once` on both configured crons, or `None` when
/// scheduling is disabled.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&pipeline.config.sync_cron_1, &pipeline.config.sync_cron_2] {
        let job_pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&job_pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync complete"),
                    Err(err) => error!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "scheduled sync job");
    }
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}
