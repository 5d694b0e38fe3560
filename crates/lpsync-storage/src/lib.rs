//! Relational store seams, snapshot backups, and their Postgres/in-memory backends.

pub mod backup;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use lpsync_core::{ProgramId, ProgramUpdate, TargetProgram};
use serde::Deserialize;
use thiserror::Error;

pub use backup::{
    backup_name, backup_prefix, parse_backup_name, BackupError, BackupManager, Clock,
    RestoreError, RetentionPolicy, SystemClock,
};
pub use memory::MemoryStore;
pub use postgres::{run_migrations, PgStore};

pub const CRATE_NAME: &str = "lpsync-storage";

/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error on {table}: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("row id={id} not found in {table}")]
    RowMissing { table: String, id: ProgramId },
    #[error("could not decode row from {table}: {message}")]
    Decode { table: String, message: String },
    #[error("injected failure: {0}")]
    Injected(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Scopes which programs are offered to the matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProgramFilter {
    /// Only programs with at least one empty date column.
    pub only_missing_dates: bool,
    /// Case-insensitive substring on the stored title.
    pub title_contains: Option<String>,
}

impl ProgramFilter {
    pub fn admits(&self, program: &TargetProgram) -> bool {
        if self.only_missing_dates && !program.dates.has_missing() {
            return false;
        }
        match self.title_contains.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => program
                .title
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            _ => true,
        }
    }
}

/// Read and scoped-write access to the live program table.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    fn table(&self) -> &str;

    async fn eligible_programs(&self, filter: &ProgramFilter) -> StoreResult<Vec<TargetProgram>>;

    /// Applies every update inside one transaction; any failure leaves the table untouched.
    async fn apply_updates(&self, updates: &[ProgramUpdate]) -> StoreResult<usize>;
}

/// Whole-table operations the backup manager is built on.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn table_names(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Materializes a full copy of `source` as a new table `destination`.
    /// Fails with `TableExists` rather than overwriting.
    async fn copy_table(&self, source: &str, destination: &str) -> StoreResult<u64>;

    async fn row_count(&self, table: &str) -> StoreResult<u64>;

    /// Replaces the rows of `live` with those of `snapshot`, all-or-nothing.
    async fn replace_contents(&self, live: &str, snapshot: &str) -> StoreResult<u64>;

    async fn drop_table(&self, table: &str) -> StoreResult<()>;
}

/// Names a live program table may take: a plain, unquoted-safe identifier.
pub fn validate_table_name(name: &str) -> StoreResult<()> {
    check_identifier(name, |c| c.is_ascii_alphanumeric() || c == '_')
}

/// Names any table the store touches may take, backup snapshots included.
/// Snapshot stamps carry `-`, so these are only ever used quoted.
pub fn validate_relation_name(name: &str) -> StoreResult<()> {
    check_identifier(name, |c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn check_identifier(name: &str, allowed: impl Fn(char) -> bool) -> StoreResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(allowed);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
