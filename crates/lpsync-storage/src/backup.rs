//! Snapshot backups keyed purely by table name.
//!
//! A backup of `Program` taken at `2026-10-18T11:46:03.123456Z` lives in a
//! sibling table named `Program_backup_2026-10-18T11-46-03-123456Z`. The stamp
//! is fixed-width, so lexicographic order of names is chronological order, and
//! `list_backups` rebuilds the snapshot list from table names alone.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, DurationRound, NaiveDateTime, Utc};
use lpsync_core::BackupSnapshot;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{validate_table_name, StoreError, TableStore, MAX_IDENTIFIER_LEN};

const BACKUP_INFIX: &str = "_backup_";
const STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%6fZ";
const STAMP_LEN: usize = 27;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup source table {table}: {source}")]
    InvalidTable {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("backup name {name} exceeds {MAX_IDENTIFIER_LEN} bytes")]
    NameTooLong { name: String },
    #[error("backup name collision: {name} already exists")]
    NameCollision { name: String },
    #[error("creating backup {name} of {table} failed: {source}")]
    Create {
        table: String,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("listing backups of {table} failed: {source}")]
    List {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("dropping backup {name} failed: {source}")]
    Prune {
        name: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("no backup named {name} exists for {table}")]
    UnknownSnapshot { table: String, name: String },
    #[error("listing backups of {table} failed: {source}")]
    List {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("restoring {table} from {snapshot} failed, live table left unchanged: {source}")]
    Restore {
        table: String,
        snapshot: String,
        #[source]
        source: StoreError,
    },
}

/// How many snapshots of a table to keep. `None` keeps every snapshot; the
/// newest snapshot is never pruned, so `Some(0)` behaves like `Some(1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_latest: Option<usize>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn backup_prefix(table: &str) -> String {
    format!("{table}{BACKUP_INFIX}")
}

pub fn backup_name(table: &str, created_at: DateTime<Utc>) -> String {
    format!("{}{}", backup_prefix(table), created_at.format(STAMP_FORMAT))
}

/// Recovers the creation time from a backup table name, or `None` when `name`
/// is not a backup of `table`.
pub fn parse_backup_name(table: &str, name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(&backup_prefix(table))?;
    if stamp.len() != STAMP_LEN || !stamp.is_ascii() || !stamp.ends_with('Z') {
        return None;
    }
    // 2026-10-18T11-46-03-123456Z -> 2026-10-18T11:46:03.123456
    let mut iso = stamp[..STAMP_LEN - 1].to_string();
    iso.replace_range(13..14, ":");
    iso.replace_range(16..17, ":");
    iso.replace_range(19..20, ".");
    let parsed = NaiveDateTime::parse_from_str(&iso, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()?
        .and_utc();
    // Reject anything that would not re-render to the same name.
    (parsed.format(STAMP_FORMAT).to_string() == stamp).then_some(parsed)
}

pub struct BackupManager {
    store: Arc<dyn TableStore>,
    clock: Arc<dyn Clock>,
    last_issued: Mutex<Option<DateTime<Utc>>>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn TableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            last_issued: Mutex::new(None),
        }
    }

    /// Next stamp at microsecond precision, strictly after every stamp this
    /// manager has issued even when the clock stalls or steps backwards.
    fn next_stamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let now = now
            .duration_trunc(Duration::microseconds(1))
            .unwrap_or(now);
        let mut last = self.last_issued.lock().unwrap_or_else(PoisonError::into_inner);
        let stamp = match *last {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }

    pub async fn create_backup(&self, table: &str) -> Result<BackupSnapshot, BackupError> {
        validate_table_name(table).map_err(|source| BackupError::InvalidTable {
            table: table.to_string(),
            source,
        })?;
        let created_at = self.next_stamp();
        let name = backup_name(table, created_at);
        if name.len() > MAX_IDENTIFIER_LEN {
            return Err(BackupError::NameTooLong { name });
        }

        match self.store.copy_table(table, &name).await {
            Ok(row_count) => {
                info!(table, backup = %name, row_count, "backup created");
                Ok(BackupSnapshot {
                    source_table: table.to_string(),
                    name,
                    created_at,
                    row_count,
                })
            }
            Err(StoreError::TableExists(_)) => Err(BackupError::NameCollision { name }),
            Err(source) => Err(BackupError::Create {
                table: table.to_string(),
                name,
                source,
            }),
        }
    }

    /// Every snapshot of `table`, newest first.
    pub async fn list_backups(&self, table: &str) -> Result<Vec<BackupSnapshot>, BackupError> {
        self.snapshots(table).await.map_err(|source| BackupError::List {
            table: table.to_string(),
            source,
        })
    }

    pub async fn latest_backup(&self, table: &str) -> Result<Option<BackupSnapshot>, RestoreError> {
        Ok(self
            .snapshots(table)
            .await
            .map_err(|source| RestoreError::List {
                table: table.to_string(),
                source,
            })?
            .into_iter()
            .next())
    }

    pub async fn find_backup(&self, table: &str, name: &str) -> Result<BackupSnapshot, RestoreError> {
        self.snapshots(table)
            .await
            .map_err(|source| RestoreError::List {
                table: table.to_string(),
                source,
            })?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RestoreError::UnknownSnapshot {
                table: table.to_string(),
                name: name.to_string(),
            })
    }

    async fn snapshots(&self, table: &str) -> Result<Vec<BackupSnapshot>, StoreError> {
        let names = self.store.table_names(&backup_prefix(table)).await?;
        let mut snapshots = Vec::with_capacity(names.len());
        for name in names {
            let Some(created_at) = parse_backup_name(table, &name) else {
                debug!(table, name, "ignoring table that only resembles a backup name");
                continue;
            };
            let row_count = self.store.row_count(&name).await?;
            snapshots.push(BackupSnapshot {
                source_table: table.to_string(),
                name,
                created_at,
                row_count,
            });
        }
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
        Ok(snapshots)
    }

    /// Replaces the live table with the snapshot's rows. The snapshot is kept.
    pub async fn restore_backup(&self, snapshot: &BackupSnapshot) -> Result<u64, RestoreError> {
        if parse_backup_name(&snapshot.source_table, &snapshot.name).is_none() {
            return Err(RestoreError::UnknownSnapshot {
                table: snapshot.source_table.clone(),
                name: snapshot.name.clone(),
            });
        }
        match self
            .store
            .replace_contents(&snapshot.source_table, &snapshot.name)
            .await
        {
            Ok(rows) => {
                info!(table = %snapshot.source_table, backup = %snapshot.name, rows, "table restored");
                Ok(rows)
            }
            Err(StoreError::TableNotFound(missing)) if missing == snapshot.name => {
                Err(RestoreError::UnknownSnapshot {
                    table: snapshot.source_table.clone(),
                    name: snapshot.name.clone(),
                })
            }
            Err(source) => Err(RestoreError::Restore {
                table: snapshot.source_table.clone(),
                snapshot: snapshot.name.clone(),
                source,
            }),
        }
    }

    /// Drops the oldest snapshots beyond `policy.keep_latest`; returns the dropped names.
    pub async fn prune(&self, table: &str, policy: RetentionPolicy) -> Result<Vec<String>, BackupError> {
        let Some(keep) = policy.keep_latest else {
            return Ok(Vec::new());
        };
        let keep = keep.max(1);
        let snapshots = self.list_backups(table).await?;
        let mut dropped = Vec::new();
        for snapshot in snapshots.into_iter().skip(keep) {
            if let Err(source) = self.store.drop_table(&snapshot.name).await {
                warn!(backup = %snapshot.name, error = %source, "prune stopped");
                return Err(BackupError::Prune {
                    name: snapshot.name,
                    source,
                });
            }
            info!(table, backup = %snapshot.name, "backup pruned");
            dropped.push(snapshot.name);
        }
        Ok(dropped)
    }
}
