//! Relational store: connection pool, schema, and entity persistence.

use std::sync::Arc;
use std::time::Duration;

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyConnection, AnyPool, Row, Transaction};
use tfp_core::{ColumnValue, ContentChecksum, NegativeBill, Relation, RelationType, Representative};
use thiserror::Error;
use tracing::info;

use crate::dialect::{dialect_for_url, ColumnSpec, DialectError, SqlDialect};

pub const REPS_TABLE: &str = "reps";
pub const BILLS_TABLE: &str = "negative_bills";
pub const RELATIONS_TABLE: &str = "reps_to_negative_bills";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Dialect(#[from] DialectError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt relation row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// Pooled connection to the relational store plus the dialect chosen for it.
#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
    dialect: Arc<dyn SqlDialect>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Connect to `config.database_url`. Fails before connecting when the
    /// backend has no dialect.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let dialect = dialect_for_url(&config.database_url)?;
        sqlx::any::install_default_drivers();

        let mut options = AnyPoolOptions::new().max_connections(config.max_connections.max(1));
        if config.is_in_memory() {
            // Every connection to an in-memory SQLite database is a new database.
            options = options
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }
        let pool = options.connect(&config.database_url).await?;
        info!(dialect = dialect.name(), "connected to store");
        Ok(Self { pool, dialect })
    }

    /// Fresh, migrated in-memory SQLite store.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let store = Self::connect(&StoreConfig::new("sqlite::memory:")).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Any>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in schema_statements(self.dialect()) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn count(&self, table: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
    }

    pub async fn find<E: StoredEntity>(&self, id: &str) -> Result<Option<E>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        find_by_id(&mut conn, self.dialect(), id).await
    }

    /// Relations of one representative, in insertion order.
    pub async fn relations_for(&self, rep_id: &str) -> Result<Vec<Relation>, StoreError> {
        let sql = format!(
            "SELECT id, rep_id, negative_bills_id, relation_type FROM {RELATIONS_TABLE} \
             WHERE rep_id = {} ORDER BY id",
            self.dialect.placeholder(1)
        );
        let rows = sqlx::query(&sql)
            .bind(rep_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(relation_from_row).collect()
    }
}

fn relation_from_row(row: &AnyRow) -> Result<Relation, StoreError> {
    let id: i64 = row.try_get("id")?;
    let kind: String = row.try_get("relation_type")?;
    let relation_type = kind
        .parse::<RelationType>()
        .map_err(|err| StoreError::CorruptRow {
            id,
            reason: err.to_string(),
        })?;
    Ok(Relation {
        id,
        rep_id: row.try_get("rep_id")?,
        negative_bills_id: row.try_get("negative_bills_id")?,
        relation_type,
    })
}

pub fn schema_statements(dialect: &dyn SqlDialect) -> Vec<String> {
    vec![
        dialect.create_table_statement(
            REPS_TABLE,
            "id",
            &with_checksum(Representative::COLUMNS),
        ),
        format!("CREATE UNIQUE INDEX IF NOT EXISTS ix_reps_checksum ON {REPS_TABLE} (checksum)"),
        dialect.create_table_statement(
            BILLS_TABLE,
            "id",
            &with_checksum(NegativeBill::COLUMNS),
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS ix_negative_bills_checksum ON {BILLS_TABLE} (checksum)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {RELATIONS_TABLE} (id {}, rep_id TEXT NOT NULL, \
             negative_bills_id TEXT NOT NULL, relation_type TEXT NOT NULL)",
            dialect.serial_primary_key()
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_reps_to_negative_bills_link \
             ON {RELATIONS_TABLE} (rep_id, negative_bills_id, relation_type)"
        ),
    ]
}

fn with_checksum(columns: &[ColumnSpec]) -> Vec<ColumnSpec> {
    let mut all = columns.to_vec();
    all.push(ColumnSpec::text("checksum"));
    all
}

/// An entity persisted in its own table, keyed by its Airtable record id.
pub trait StoredEntity: ContentChecksum + Sized + Send + Sync + Unpin + 'static {
    const TABLE: &'static str;
    /// Every column except `checksum`; names match `content_columns`.
    const COLUMNS: &'static [ColumnSpec];

    fn id(&self) -> &str;
    fn checksum(&self) -> &str;
    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error>;

    fn select_list() -> String {
        let mut names = Self::COLUMNS.iter().map(|c| c.name).collect::<Vec<_>>();
        names.push("checksum");
        names.join(", ")
    }
}

pub async fn find_by_id<E: StoredEntity>(
    conn: &mut AnyConnection,
    dialect: &dyn SqlDialect,
    id: &str,
) -> Result<Option<E>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = {}",
        E::select_list(),
        E::TABLE,
        dialect.placeholder(1)
    );
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(E::from_row).transpose()
}

/// Insert or overwrite `entity` through the dialect's upsert statement.
pub async fn write_entity<E: StoredEntity>(
    conn: &mut AnyConnection,
    dialect: &dyn SqlDialect,
    entity: &E,
) -> Result<(), sqlx::Error> {
    let mut columns = entity.content_columns();
    columns.push(("checksum", ColumnValue::Text(Some(entity.checksum().to_string()))));
    let names = columns.iter().map(|(name, _)| *name).collect::<Vec<_>>();
    let sql = dialect.upsert_statement(E::TABLE, &names, "id");

    let mut query = sqlx::query(&sql);
    for (_, value) in columns {
        query = match value {
            ColumnValue::Text(v) => query.bind(v),
            ColumnValue::Integer(v) => query.bind(v),
        };
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

impl StoredEntity for Representative {
    const TABLE: &'static str = REPS_TABLE;
    const COLUMNS: &'static [ColumnSpec] = &[
        ColumnSpec::text("id"),
        ColumnSpec::text("name"),
        ColumnSpec::text("district"),
        ColumnSpec::text("role"),
        ColumnSpec::text("state"),
        ColumnSpec::text("created"),
        ColumnSpec::text("modified"),
        ColumnSpec::optional_text("political_party"),
        ColumnSpec::optional_text("reelection_date"),
        ColumnSpec::optional_text("website"),
        ColumnSpec::optional_text("email"),
        ColumnSpec::optional_text("facebook"),
        ColumnSpec::optional_text("twitter"),
        ColumnSpec::optional_text("capitol_address"),
        ColumnSpec::optional_text("capitol_phone"),
        ColumnSpec::optional_text("district_address"),
        ColumnSpec::optional_text("district_phone"),
        ColumnSpec::optional_integer("ftm_eid"),
        ColumnSpec::optional_integer("legiscan_id"),
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            district: row.try_get("district")?,
            role: row.try_get("role")?,
            state: row.try_get("state")?,
            created: row.try_get("created")?,
            modified: row.try_get("modified")?,
            political_party: row.try_get("political_party")?,
            reelection_date: row.try_get("reelection_date")?,
            website: row.try_get("website")?,
            email: row.try_get("email")?,
            facebook: row.try_get("facebook")?,
            twitter: row.try_get("twitter")?,
            capitol_address: row.try_get("capitol_address")?,
            capitol_phone: row.try_get("capitol_phone")?,
            district_address: row.try_get("district_address")?,
            district_phone: row.try_get("district_phone")?,
            ftm_eid: row.try_get("ftm_eid")?,
            legiscan_id: row.try_get("legiscan_id")?,
            checksum: row.try_get("checksum")?,
        })
    }
}

impl StoredEntity for NegativeBill {
    const TABLE: &'static str = BILLS_TABLE;
    const COLUMNS: &'static [ColumnSpec] = &[
        ColumnSpec::text("id"),
        ColumnSpec::text("case_name"),
        ColumnSpec::text("created"),
        ColumnSpec::optional_text("bill_information_link"),
        ColumnSpec::optional_text("category"),
        ColumnSpec::optional_text("expanded_category"),
        ColumnSpec::optional_text("last_activity"),
        ColumnSpec::optional_text("last_modified"),
        ColumnSpec::optional_integer("legiscan_id"),
        ColumnSpec::optional_text("progress"),
        ColumnSpec::optional_text("state"),
        ColumnSpec::optional_text("status"),
        ColumnSpec::optional_text("summary"),
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            case_name: row.try_get("case_name")?,
            created: row.try_get("created")?,
            bill_information_link: row.try_get("bill_information_link")?,
            category: row.try_get("category")?,
            expanded_category: row.try_get("expanded_category")?,
            last_activity: row.try_get("last_activity")?,
            last_modified: row.try_get("last_modified")?,
            legiscan_id: row.try_get("legiscan_id")?,
            progress: row.try_get("progress")?,
            state: row.try_get("state")?,
            status: row.try_get("status")?,
            summary: row.try_get("summary")?,
            checksum: row.try_get("checksum")?,
        })
    }
}
