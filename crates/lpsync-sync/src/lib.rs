//! Matching and orchestration: normalize legacy titles, score them against the
//! live program table, then report, apply, or restore.

pub mod config;
pub mod dates;
pub mod error;
pub mod matcher;
pub mod normalize;
pub mod orchestrator;
pub mod report;
pub mod similarity;

use std::sync::Arc;

use anyhow::{Context, Result};
use lpsync_storage::{BackupManager, PgStore};

pub use config::{SyncConfig, DEFAULT_CONFIG_FILE};
pub use dates::{parse_program_dates, parse_program_dates_in};
pub use error::SyncError;
pub use matcher::{decide, match_legacy, Matcher};
pub use normalize::normalize;
pub use orchestrator::{RestoreTarget, RunOptions, SyncOrchestrator};
pub use report::{render_summary_markdown, render_table, write_run_report};
pub use similarity::similarity;

pub const CRATE_NAME: &str = "lpsync-sync";

/// Connects to Postgres and wires the store, backup manager and configured
/// legacy source into an orchestrator.
pub async fn orchestrator_from_config(config: &SyncConfig) -> Result<SyncOrchestrator> {
    config.validate()?;
    let store = Arc::new(
        PgStore::connect(&config.database_url, config.program_table.clone())
            .await
            .with_context(|| format!("connecting to {}", config.program_table))?,
    );
    let backups = BackupManager::new(store.clone());
    let mut orchestrator = SyncOrchestrator::new(store, backups, RunOptions::from_config(config));
    if let Some(source) = &config.source {
        let source = source
            .build(&config.http_client_config())
            .context("building legacy source")?;
        orchestrator = orchestrator.with_source(source);
    }
    Ok(orchestrator)
}
