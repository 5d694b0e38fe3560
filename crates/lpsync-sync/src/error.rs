use std::path::PathBuf;

use lpsync_adapters::ExtractionError;
use lpsync_core::{SyncMode, ThresholdError};
use lpsync_storage::{BackupError, RestoreError, StoreError};
use thiserror::Error;

/// Failures that abort a run. A rolled-back write batch is not one of them:
/// it is recorded on the returned `SyncRun` instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("extracting legacy records from {source_id} failed: {source}")]
    Extraction {
        source_id: String,
        #[source]
        source: ExtractionError,
    },
    #[error("loading candidate programs from {table} failed: {source}")]
    Candidates {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("backup failed, nothing was written: {0}")]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error("no backup of {table} is available to restore")]
    NoBackupAvailable { table: String },
    #[error("{mode} run on {table} timed out after {seconds}s")]
    Timeout {
        mode: SyncMode,
        table: String,
        seconds: u64,
    },
    #[error("no legacy source is configured for {mode}")]
    MissingSource { mode: SyncMode },
    #[error("invalid thresholds: {0}")]
    Thresholds(#[from] ThresholdError),
    #[error("reading config {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },
    /// A merged setting is unusable, whichever layer supplied it.
    #[error("invalid setting {key}: {message}")]
    Setting { key: &'static str, message: String },
}
