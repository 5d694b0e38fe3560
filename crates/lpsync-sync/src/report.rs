//! Run reports: `reports/<run_id>/sync_run.json` and `summary.md`, plus the CLI table.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lpsync_core::{
    MatchResult, OutcomeKind, ProgramDates, RecordOutcome, SyncRun, WriteDisposition,
};
use tokio::fs;

/// Writes both report files and returns the run's report directory.
pub async fn write_run_report(reports_dir: &Path, run: &SyncRun) -> Result<PathBuf> {
    let run_dir = reports_dir.join(run.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(run).context("serializing sync run")?;
    fs::write(run_dir.join("sync_run.json"), json)
        .await
        .context("writing sync_run.json")?;
    fs::write(run_dir.join("summary.md"), render_summary_markdown(run))
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}

pub fn render_summary_markdown(run: &SyncRun) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# lpsync {} run\n", run.mode);
    let _ = writeln!(out, "- Run ID: `{}`", run.run_id);
    let _ = writeln!(out, "- Table: `{}`", run.table);
    let _ = writeln!(out, "- Status: {:?}", run.status);
    let _ = writeln!(out, "- As of: {}", run.as_of);
    let _ = writeln!(
        out,
        "- Thresholds: accept {:.2}, margin {:.2}",
        run.thresholds.accept, run.thresholds.ambiguity_margin
    );
    let _ = writeln!(out, "- Started: {}", run.started_at);
    if let Some(finished) = run.finished_at {
        let _ = writeln!(out, "- Finished: {finished}");
    }
    if let Some(backup) = &run.backup {
        let _ = writeln!(out, "- Backup: `{}` ({} rows)", backup.name, backup.row_count);
    }
    if let Some(restored) = &run.restored_from {
        let _ = writeln!(out, "- Restored from: `{}`", restored.name);
    }
    if !run.pruned_backups.is_empty() {
        let _ = writeln!(out, "- Pruned: {}", run.pruned_backups.join(", "));
    }

    out.push_str("\n## Counts\n");
    let _ = writeln!(out, "- matched: {}", run.count(OutcomeKind::Matched));
    let _ = writeln!(out, "- ambiguous: {}", run.count(OutcomeKind::Ambiguous));
    let _ = writeln!(out, "- unmatched: {}", run.count(OutcomeKind::Unmatched));
    let _ = writeln!(out, "- updated: {}", run.updated_count);
    let _ = writeln!(out, "- skipped: {}", run.skipped_count);
    let _ = writeln!(out, "- errors: {}", run.error_count);

    if !run.errors.is_empty() {
        out.push_str("\n## Errors\n");
        for error in &run.errors {
            let _ = writeln!(
                out,
                "- {:?} on `{}` (snapshot {}, {} attempted): {}",
                error.kind,
                error.table,
                error.snapshot.as_deref().unwrap_or("-"),
                error.attempted,
                error.message
            );
        }
    }
    if !run.extraction_warnings.is_empty() {
        out.push_str("\n## Extraction warnings\n");
        for warning in &run.extraction_warnings {
            let _ = writeln!(out, "- {warning}");
        }
    }

    if !run.results.is_empty() {
        out.push_str("\n## Records\n\n");
        out.push_str("| Legacy title | Outcome | Target | Similarity | Dates | Write |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for row in run.results.iter().map(Row::from) {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} |",
                row.title.replace('|', "\\|"),
                row.outcome,
                row.target.replace('|', "\\|"),
                row.similarity,
                row.dates,
                row.write
            );
        }
    }
    out
}

/// Fixed-width table for terminal output.
pub fn render_table(run: &SyncRun) -> String {
    let headers = ["LEGACY TITLE", "OUTCOME", "TARGET", "SIM", "DATES", "WRITE"];
    let rows: Vec<[String; 6]> = run
        .results
        .iter()
        .map(Row::from)
        .map(|r| [r.title, r.outcome, r.target, r.similarity, r.dates, r.write])
        .collect();

    let mut widths = headers.map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let line = |cells: &[String]| -> String {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| pad(cell, width))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let _ = writeln!(out, "{}", line(&headers.map(String::from)));
    for row in &rows {
        let _ = writeln!(out, "{}", line(row));
    }
    let _ = writeln!(
        out,
        "\n{} {} on {}: matched {}, ambiguous {}, unmatched {}, updated {}, skipped {}, errors {}",
        run.mode,
        run.run_id,
        run.table,
        run.count(OutcomeKind::Matched),
        run.count(OutcomeKind::Ambiguous),
        run.count(OutcomeKind::Unmatched),
        run.updated_count,
        run.skipped_count,
        run.error_count
    );
    if let Some(backup) = &run.backup {
        let _ = writeln!(out, "backup: {}", backup.name);
    }
    if let Some(restored) = &run.restored_from {
        let _ = writeln!(out, "restored from: {} ({} rows)", restored.name, run.updated_count);
    }
    for error in &run.errors {
        let _ = writeln!(out, "error: {}", error.message);
    }
    out
}

fn pad(cell: &str, width: usize) -> String {
    let fill = width.saturating_sub(cell.chars().count());
    format!("{cell}{}", " ".repeat(fill))
}

struct Row {
    title: String,
    outcome: String,
    target: String,
    similarity: String,
    dates: String,
    write: String,
}

impl From<&RecordOutcome> for Row {
    fn from(outcome: &RecordOutcome) -> Self {
        let target = match &outcome.result {
            MatchResult::Matched { target, .. } => format!("#{} {}", target.id, target.title),
            MatchResult::Ambiguous { top_candidates } => top_candidates
                .iter()
                .map(|c| format!("#{}", c.target.id))
                .collect::<Vec<_>>()
                .join(" / "),
            MatchResult::Unmatched { .. } => "-".to_string(),
        };
        let dates = outcome
            .proposed
            .as_ref()
            .map(|update| format_dates(&update.dates))
            .unwrap_or_else(|| "-".to_string());
        let write = match &outcome.write {
            WriteDisposition::None => "-".to_string(),
            WriteDisposition::Proposed => "proposed".to_string(),
            WriteDisposition::Written => "written".to_string(),
            WriteDisposition::Skipped { reason } => format!("skipped ({reason:?})"),
            WriteDisposition::RolledBack => "rolled back".to_string(),
        };
        Self {
            title: outcome.legacy.raw_title.clone(),
            outcome: outcome.result.kind().to_string(),
            target,
            similarity: format!("{:.3}", outcome.result.best_similarity()),
            dates,
            write,
        }
    }
}

fn format_dates(dates: &ProgramDates) -> String {
    let day = |d: Option<chrono::NaiveDate>| d.map(|d| d.to_string()).unwrap_or_else(|| "?".into());
    let mut parts = Vec::new();
    if dates.recruit_start.is_some() || dates.recruit_end.is_some() {
        parts.push(format!("recruit {}~{}", day(dates.recruit_start), day(dates.recruit_end)));
    }
    if dates.start_date.is_some() || dates.end_date.is_some() {
        parts.push(format!("program {}~{}", day(dates.start_date), day(dates.end_date)));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lpsync_core::{
        LegacyRecord, MatchThresholds, ProgramStatus, ProgramUpdate, SourceConfidence, SyncMode,
        TargetProgram,
    };

    fn sample_run() -> SyncRun {
        let as_of = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let mut run = SyncRun::new(SyncMode::DryRun, "Program", MatchThresholds::default(), as_of);
        let target = TargetProgram {
            id: 7,
            title: "독서모임".into(),
            dates: ProgramDates::default(),
            status: ProgramStatus::Upcoming,
        };
        let parsed = ProgramDates {
            start_date: NaiveDate::from_ymd_opt(2024, 3, 2),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 29),
            ..Default::default()
        };
        run.results.push(RecordOutcome {
            legacy: LegacyRecord::new("독서모임 5기", "2024.03.02 ~ 2024.06.29", SourceConfidence::Text),
            normalized_title: "독서모임".into(),
            parsed_dates: parsed,
            proposed: ProgramUpdate::from_parsed(&target, parsed, as_of),
            result: MatchResult::Matched {
                target,
                similarity: 1.0,
            },
            write: WriteDisposition::Proposed,
        });
        run.results.push(RecordOutcome {
            legacy: LegacyRecord::new("시니어 스마트폰 교실", "일정 추후 공지", SourceConfidence::Ocr),
            normalized_title: "시니어 스마트폰 교실".into(),
            parsed_dates: ProgramDates::default(),
            proposed: None,
            result: MatchResult::Unmatched {
                best_similarity: 0.25,
            },
            write: WriteDisposition::None,
        });
        run.finish();
        run
    }

    #[test]
    fn table_lists_every_record_and_the_counts() {
        let table = render_table(&sample_run());
        assert!(table.starts_with("LEGACY TITLE"));
        assert!(table.contains("#7 독서모임"));
        assert!(table.contains("program 2024-03-02~2024-06-29"));
        assert!(table.contains("1.000"));
        assert!(table.contains("matched 1, ambiguous 0, unmatched 1"));
    }

    #[test]
    fn summary_carries_counts_and_record_rows() {
        let summary = render_summary_markdown(&sample_run());
        assert!(summary.starts_with("# lpsync dry-run run"));
        assert!(summary.contains("- unmatched: 1"));
        assert!(summary.contains("| 시니어 스마트폰 교실 | unmatched | - | 0.250 | - | - |"));
    }

    #[tokio::test]
    async fn report_files_land_under_the_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let run = sample_run();
        let run_dir = write_run_report(dir.path(), &run).await.unwrap();
        assert_eq!(run_dir, dir.path().join(run.run_id.to_string()));

        let json = std::fs::read_to_string(run_dir.join("sync_run.json")).unwrap();
        let parsed: SyncRun = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, run);
        assert!(run_dir.join("summary.md").exists());
    }
}
