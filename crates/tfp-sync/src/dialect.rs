//! Per-backend SQL statement construction.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialectError {
    #[error("unsupported database backend `{0}` (expected sqlite or postgres)")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

impl ColumnSpec {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Text,
            required: true,
        }
    }

    pub const fn optional_text(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Text,
            required: false,
        }
    }

    pub const fn optional_integer(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Integer,
            required: false,
        }
    }
}

/// Builds the statements whose syntax differs between backends.
///
/// Selected once from configuration; see [`dialect_for_url`].
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Positional bind parameter, 1-based.
    fn placeholder(&self, index: usize) -> String;

    fn column_type(&self, kind: ColumnKind) -> &'static str;

    /// Column definition for an auto-incrementing surrogate key.
    fn serial_primary_key(&self) -> &'static str;

    fn placeholders(&self, count: usize) -> String {
        (1..=count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Insert a row, replacing every non-key column when `key` already exists.
    fn upsert_statement(&self, table: &str, columns: &[&str], key: &str) -> String {
        let updates = columns
            .iter()
            .filter(|c| **c != key)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({key}) DO UPDATE SET {updates}",
            columns.join(", "),
            self.placeholders(columns.len()),
        )
    }

    /// Insert a row unless it violates a uniqueness constraint.
    fn insert_ignore_statement(&self, table: &str, columns: &[&str]) -> String {
        format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
            columns.join(", "),
            self.placeholders(columns.len()),
        )
    }

    fn create_table_statement(&self, table: &str, key: &str, columns: &[ColumnSpec]) -> String {
        let mut defs = vec![format!("{key} TEXT PRIMARY KEY")];
        defs.extend(columns.iter().filter(|c| c.name != key).map(|c| {
            let null = if c.required { " NOT NULL" } else { "" };
            format!("{} {}{null}", c.name, self.column_type(c.kind))
        }));
        format!("CREATE TABLE IF NOT EXISTS {table} ({})", defs.join(", "))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }

    fn column_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Text => "TEXT",
            ColumnKind::Integer => "INTEGER",
        }
    }

    fn serial_primary_key(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn column_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Text => "TEXT",
            ColumnKind::Integer => "BIGINT",
        }
    }

    fn serial_primary_key(&self) -> &'static str {
        "BIGSERIAL PRIMARY KEY"
    }
}

pub fn dialect_for_url(database_url: &str) -> Result<Arc<dyn SqlDialect>, DialectError> {
    let scheme = database_url
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .unwrap_or(database_url);
    match scheme {
        "sqlite" => Ok(Arc::new(SqliteDialect)),
        "postgres" | "postgresql" => Ok(Arc::new(PostgresDialect)),
        other => Err(DialectError::Unsupported(other.to_string())),
    }
}
