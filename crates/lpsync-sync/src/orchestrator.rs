//! Drives one run: extract, match, then report (dry-run) or back up, write and report (apply).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use lpsync_adapters::LegacySource;
use lpsync_core::{
    MatchResult, MatchThresholds, OutcomeKind, ProgramId, ProgramUpdate, RecordOutcome, RunError,
    RunErrorKind, RunPhase, SkipReason, SyncMode, SyncRun, WriteDisposition,
};
use lpsync_storage::{BackupManager, ProgramFilter, ProgramStore, RetentionPolicy};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::dates::parse_program_dates_in;
use crate::matcher::Matcher;
use crate::normalize::normalize;
use crate::SyncError;

/// Which snapshot a restore run reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    Named(String),
    Latest,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub thresholds: MatchThresholds,
    pub filter: ProgramFilter,
    pub retention: RetentionPolicy,
    pub as_of: NaiveDate,
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            thresholds: MatchThresholds::default(),
            filter: ProgramFilter::default(),
            retention: RetentionPolicy::default(),
            as_of,
            timeout: None,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            thresholds: config.thresholds,
            filter: config.filter.clone(),
            retention: config.retention,
            as_of: config.as_of_date(),
            timeout: config.run_timeout(),
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn ProgramStore>,
    backups: BackupManager,
    source: Option<Box<dyn LegacySource>>,
    options: RunOptions,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn ProgramStore>, backups: BackupManager, options: RunOptions) -> Self {
        Self {
            store,
            backups,
            source: None,
            options,
        }
    }

    pub fn with_source(mut self, source: Box<dyn LegacySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn table(&self) -> &str {
        self.store.table()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// `Restore` mode restores the most recent snapshot; use [`Self::restore`] to pick one.
    pub async fn run(&self, mode: SyncMode) -> Result<SyncRun, SyncError> {
        match mode {
            SyncMode::DryRun => self.dry_run().await,
            SyncMode::Apply => self.apply().await,
            SyncMode::Restore => self.restore(RestoreTarget::Latest).await,
        }
    }

    /// Matches and reports. Never writes and never creates a backup.
    pub async fn dry_run(&self) -> Result<SyncRun, SyncError> {
        let mut run = self.new_run(SyncMode::DryRun);
        let span = info_span!("sync_run", run_id = %run.run_id, mode = %run.mode, table = %run.table);
        self.bounded(SyncMode::DryRun, async {
            self.extract_and_match(&mut run).await?;
            run.finish();
            Ok(run)
        })
        .instrument(span)
        .await
    }

    /// Matches, snapshots the table, then writes every accepted update in one
    /// transaction. A rolled-back batch is reported on the returned run.
    pub async fn apply(&self) -> Result<SyncRun, SyncError> {
        let mut run = self.new_run(SyncMode::Apply);
        let span = info_span!("sync_run", run_id = %run.run_id, mode = %run.mode, table = %run.table);
        self.bounded(SyncMode::Apply, async {
            self.extract_and_match(&mut run).await?;
            self.write(&mut run).await?;
            run.finish();
            Ok(run)
        })
        .instrument(span)
        .await
    }

    /// Replaces the live table with a snapshot. Bypasses matching and never prunes.
    pub async fn restore(&self, target: RestoreTarget) -> Result<SyncRun, SyncError> {
        let mut run = self.new_run(SyncMode::Restore);
        let span = info_span!("sync_run", run_id = %run.run_id, mode = %run.mode, table = %run.table);
        self.bounded(SyncMode::Restore, async {
            let table = self.table().to_string();
            let snapshot = match target {
                RestoreTarget::Named(name) => self.backups.find_backup(&table, &name).await?,
                RestoreTarget::Latest => self
                    .backups
                    .latest_backup(&table)
                    .await?
                    .ok_or_else(|| SyncError::NoBackupAvailable {
                        table: table.clone(),
                    })?,
            };
            let rows = self.backups.restore_backup(&snapshot).await?;
            run.updated_count = usize::try_from(rows).unwrap_or(usize::MAX);
            run.restored_from = Some(snapshot);
            run.phase = RunPhase::Written;
            run.finish();
            Ok(run)
        })
        .instrument(span)
        .await
    }

    fn new_run(&self, mode: SyncMode) -> SyncRun {
        SyncRun::new(mode, self.table(), self.options.thresholds, self.options.as_of)
    }

    /// Applies the run-level timeout. Dropping the future on expiry drops any
    /// open transaction, which rolls it back.
    async fn bounded<F>(&self, mode: SyncMode, run: F) -> Result<SyncRun, SyncError>
    where
        F: std::future::Future<Output = Result<SyncRun, SyncError>>,
    {
        let Some(limit) = self.options.timeout else {
            return run.await;
        };
        match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%mode, table = self.table(), seconds = limit.as_secs(), "run timed out");
                Err(SyncError::Timeout {
                    mode,
                    table: self.table().to_string(),
                    seconds: limit.as_secs(),
                })
            }
        }
    }

    async fn extract_and_match(&self, run: &mut SyncRun) -> Result<(), SyncError> {
        let source = self
            .source
            .as_ref()
            .ok_or(SyncError::MissingSource { mode: run.mode })?;
        let extraction = source
            .extract(run.run_id)
            .await
            .map_err(|err| SyncError::Extraction {
                source_id: source.source_id().to_string(),
                source: err,
            })?;
        run.extraction_warnings = extraction.warnings;
        run.phase = RunPhase::Extracted;
        info!(
            source = source.source_id(),
            records = extraction.records.len(),
            warnings = run.extraction_warnings.len(),
            "extracted"
        );

        // Filled targets stay matchable so a rerun recognizes them; the
        // missing-dates scope is enforced when deciding what to write.
        let only_missing_dates = self.options.filter.only_missing_dates;
        let scope = ProgramFilter {
            only_missing_dates: false,
            ..self.options.filter.clone()
        };
        let candidates = self
            .store
            .eligible_programs(&scope)
            .await
            .map_err(|err| SyncError::Candidates {
                table: self.table().to_string(),
                source: err,
            })?;

        let year = self.options.as_of.year();
        let matcher = Matcher::new(&candidates, self.options.thresholds).with_default_year(year);
        run.results = extraction
            .records
            .into_iter()
            .map(|legacy| {
                let result = matcher.match_record(&legacy);
                let parsed_dates = parse_program_dates_in(&legacy.extracted_date_text, Some(year));
                let proposed = result
                    .matched_target()
                    .and_then(|target| ProgramUpdate::from_parsed(target, parsed_dates, self.options.as_of));
                let write = match (&result, &proposed) {
                    (MatchResult::Matched { target, .. }, _)
                        if only_missing_dates && !target.dates.has_missing() =>
                    {
                        WriteDisposition::Skipped {
                            reason: SkipReason::AlreadyDated,
                        }
                    }
                    (MatchResult::Matched { .. }, Some(_)) => WriteDisposition::Proposed,
                    (MatchResult::Matched { .. }, None) => WriteDisposition::Skipped {
                        reason: SkipReason::NoDates,
                    },
                    _ => WriteDisposition::None,
                };
                RecordOutcome {
                    normalized_title: normalize(&legacy.raw_title),
                    legacy,
                    parsed_dates,
                    result,
                    proposed,
                    write,
                }
            })
            .collect();
        skip_conflicting_updates(&mut run.results);
        run.skipped_count = run
            .results
            .iter()
            .filter(|r| matches!(r.write, WriteDisposition::Skipped { .. }))
            .count();
        run.phase = RunPhase::Matched;
        info!(
            candidates = matcher.candidate_count(),
            matched = run.count(OutcomeKind::Matched),
            ambiguous = run.count(OutcomeKind::Ambiguous),
            unmatched = run.count(OutcomeKind::Unmatched),
            skipped = run.skipped_count,
            "matched"
        );
        Ok(())
    }

    async fn write(&self, run: &mut SyncRun) -> Result<(), SyncError> {
        let updates = pending_updates(&run.results);
        if updates.is_empty() {
            info!("nothing to write; no backup taken");
            return Ok(());
        }

        // No backup, no write.
        let snapshot = self.backups.create_backup(self.table()).await?;
        run.phase = RunPhase::BackedUp;
        info!(backup = %snapshot.name, rows = snapshot.row_count, "backed up");
        let snapshot_name = snapshot.name.clone();
        run.backup = Some(snapshot);

        match self.store.apply_updates(&updates).await {
            Ok(written) => {
                mark_proposed(&mut run.results, WriteDisposition::Written);
                run.updated_count = written;
                run.phase = RunPhase::Written;
                info!(written, "updates committed");
            }
            Err(err) => {
                warn!(backup = %snapshot_name, attempted = updates.len(), error = %err, "write rolled back");
                mark_proposed(&mut run.results, WriteDisposition::RolledBack);
                run.push_error(RunError {
                    kind: RunErrorKind::Write,
                    table: self.table().to_string(),
                    snapshot: Some(snapshot_name),
                    attempted: updates.len(),
                    message: err.to_string(),
                });
                return Ok(());
            }
        }

        match self.backups.prune(self.table(), self.options.retention).await {
            Ok(pruned) => {
                if !pruned.is_empty() {
                    debug!(pruned = pruned.len(), "retention applied");
                }
                run.pruned_backups = pruned;
            }
            Err(err) => {
                warn!(error = %err, "retention pruning failed");
                run.push_error(RunError {
                    kind: RunErrorKind::Prune,
                    table: self.table().to_string(),
                    snapshot: None,
                    attempted: 0,
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Several legacy rows may resolve to one program. Identical updates collapse
/// into a single write; differing ones are all skipped for operator review.
fn skip_conflicting_updates(results: &mut [RecordOutcome]) {
    let mut by_target: BTreeMap<ProgramId, Vec<usize>> = BTreeMap::new();
    for (index, outcome) in results.iter().enumerate() {
        if let (WriteDisposition::Proposed, Some(update)) = (&outcome.write, &outcome.proposed) {
            by_target.entry(update.id).or_default().push(index);
        }
    }
    for indices in by_target.values().filter(|indices| indices.len() > 1) {
        let first = &results[indices[0]].proposed;
        let conflicting = indices.iter().any(|&i| &results[i].proposed != first);
        if conflicting {
            for &i in indices {
                results[i].write = WriteDisposition::Skipped {
                    reason: SkipReason::ConflictingUpdates,
                };
            }
        }
    }
}

/// One update per target, ordered by id.
fn pending_updates(results: &[RecordOutcome]) -> Vec<ProgramUpdate> {
    let mut updates: BTreeMap<ProgramId, ProgramUpdate> = BTreeMap::new();
    for outcome in results {
        if let (WriteDisposition::Proposed, Some(update)) = (&outcome.write, &outcome.proposed) {
            updates.entry(update.id).or_insert_with(|| update.clone());
        }
    }
    updates.into_values().collect()
}

fn mark_proposed(results: &mut [RecordOutcome], disposition: WriteDisposition) {
    for outcome in results
        .iter_mut()
        .filter(|r| r.write == WriteDisposition::Proposed)
    {
        outcome.write = disposition.clone();
    }
}
