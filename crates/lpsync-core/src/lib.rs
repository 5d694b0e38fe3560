//! Core domain model for reconciling legacy program listings with the program store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpsync-core";

pub type ProgramId = i64;

/// How the extraction collaborator obtained a legacy row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceConfidence {
    Text,
    Ocr,
}

/// One `(title, date text, confidence)` tuple handed over by the extraction step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRecord {
    pub raw_title: String,
    pub extracted_date_text: String,
    pub source_confidence: SourceConfidence,
}

impl LegacyRecord {
    pub fn new(
        raw_title: impl Into<String>,
        extracted_date_text: impl Into<String>,
        source_confidence: SourceConfidence,
    ) -> Self {
        Self {
            raw_title: raw_title.into(),
            extracted_date_text: extracted_date_text.into(),
            source_confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramStatus {
    Upcoming,
    Recruiting,
    InProgress,
    Closed,
}

impl ProgramStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upcoming => "UPCOMING",
            Self::Recruiting => "RECRUITING",
            Self::InProgress => "IN_PROGRESS",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown program status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for ProgramStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UPCOMING" => Ok(Self::Upcoming),
            "RECRUITING" => Ok(Self::Recruiting),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "CLOSED" => Ok(Self::Closed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// The four date fields the sync is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramDates {
    pub recruit_start: Option<NaiveDate>,
    pub recruit_end: Option<NaiveDate>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl ProgramDates {
    pub fn is_empty(&self) -> bool {
        self.recruit_start.is_none()
            && self.recruit_end.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
    }

    pub fn has_missing(&self) -> bool {
        self.recruit_start.is_none()
            || self.recruit_end.is_none()
            || self.start_date.is_none()
            || self.end_date.is_none()
    }

    /// Single representative date: program start, else recruitment start.
    pub fn anchor(&self) -> Option<NaiveDate> {
        self.start_date
            .or(self.recruit_start)
            .or(self.end_date)
            .or(self.recruit_end)
    }

    /// Closed range used for date-proximity comparisons. Falls back from the
    /// program range to the recruitment range; a missing bound collapses onto the other.
    pub fn span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let pick = |a: Option<NaiveDate>, b: Option<NaiveDate>| match (a, b) {
            (Some(a), Some(b)) => Some((a.min(b), a.max(b))),
            (Some(d), None) | (None, Some(d)) => Some((d, d)),
            (None, None) => None,
        };
        pick(self.start_date, self.end_date).or_else(|| pick(self.recruit_start, self.recruit_end))
    }

    /// Distance in days from `date` to this span; zero when inside it.
    pub fn distance_days(&self, date: NaiveDate) -> Option<i64> {
        let (lo, hi) = self.span()?;
        if date < lo {
            Some((lo - date).num_days())
        } else if date > hi {
            Some((date - hi).num_days())
        } else {
            Some(0)
        }
    }

    /// Fields set on `self` win; unset fields keep `current`'s value.
    pub fn overlay(&self, current: &ProgramDates) -> ProgramDates {
        ProgramDates {
            recruit_start: self.recruit_start.or(current.recruit_start),
            recruit_end: self.recruit_end.or(current.recruit_end),
            start_date: self.start_date.or(current.start_date),
            end_date: self.end_date.or(current.end_date),
        }
    }

    /// Status implied by these dates on `as_of`. First rule wins: past the end
    /// is closed, past the start is in progress, inside the recruitment window
    /// is recruiting, anything else is upcoming.
    pub fn derive_status(&self, as_of: NaiveDate) -> Option<ProgramStatus> {
        if self.is_empty() {
            return None;
        }
        let has_program_dates = self.start_date.is_some() || self.end_date.is_some();
        if let Some(end) = self.end_date {
            if as_of > end {
                return Some(ProgramStatus::Closed);
            }
        }
        if !has_program_dates {
            if let Some(recruit_end) = self.recruit_end {
                if as_of > recruit_end {
                    return Some(ProgramStatus::Closed);
                }
            }
        }
        if let Some(start) = self.start_date {
            if as_of >= start {
                return Some(ProgramStatus::InProgress);
            }
        }
        let recruiting_known = self.recruit_start.is_some() || self.recruit_end.is_some();
        let after_open = self.recruit_start.map_or(true, |d| as_of >= d);
        let before_close = self.recruit_end.map_or(true, |d| as_of <= d);
        if recruiting_known && after_open && before_close {
            return Some(ProgramStatus::Recruiting);
        }
        Some(ProgramStatus::Upcoming)
    }
}

/// Authoritative program row owned by the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProgram {
    pub id: ProgramId,
    pub title: String,
    #[serde(flatten)]
    pub dates: ProgramDates,
    pub status: ProgramStatus,
}

/// Scoped write against one program: only `Some` fields are touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramUpdate {
    pub id: ProgramId,
    #[serde(flatten)]
    pub dates: ProgramDates,
    pub status: Option<ProgramStatus>,
}

impl ProgramUpdate {
    /// Builds the update a legacy date reading implies for `target`, deriving
    /// the status from the merged result. `None` when nothing was parsed.
    pub fn from_parsed(target: &TargetProgram, parsed: ProgramDates, as_of: NaiveDate) -> Option<Self> {
        if parsed.is_empty() {
            return None;
        }
        let merged = parsed.overlay(&target.dates);
        Some(Self {
            id: target.id,
            dates: parsed,
            status: merged.derive_status(as_of),
        })
    }

    pub fn apply_to(&self, program: &mut TargetProgram) {
        program.dates = self.dates.overlay(&program.dates);
        if let Some(status) = self.status {
            program.status = status;
        }
    }
}

/// Operator-tunable matching cut-offs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchThresholds {
    pub accept: f64,
    pub ambiguity_margin: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            accept: 0.80,
            ambiguity_margin: 0.05,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("accept threshold {0} is outside [0, 1]")]
    Accept(f64),
    #[error("ambiguity margin {0} is outside [0, 1]")]
    Margin(f64),
}

impl MatchThresholds {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        if !(0.0..=1.0).contains(&self.accept) {
            return Err(ThresholdError::Accept(self.accept));
        }
        if !(0.0..=1.0).contains(&self.ambiguity_margin) {
            return Err(ThresholdError::Margin(self.ambiguity_margin));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub legacy: LegacyRecord,
    pub target: TargetProgram,
    pub similarity: f64,
}

/// Exactly one of these is produced per legacy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    Matched {
        target: TargetProgram,
        similarity: f64,
    },
    Ambiguous {
        #[serde(rename = "topCandidates")]
        top_candidates: Vec<MatchCandidate>,
    },
    Unmatched {
        #[serde(rename = "bestSimilarity")]
        best_similarity: f64,
    },
}

impl MatchResult {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Matched { .. } => OutcomeKind::Matched,
            Self::Ambiguous { .. } => OutcomeKind::Ambiguous,
            Self::Unmatched { .. } => OutcomeKind::Unmatched,
        }
    }

    pub fn matched_target(&self) -> Option<&TargetProgram> {
        match self {
            Self::Matched { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Best similarity seen, whichever outcome was reached.
    pub fn best_similarity(&self) -> f64 {
        match self {
            Self::Matched { similarity, .. } => *similarity,
            Self::Ambiguous { top_candidates } => top_candidates
                .first()
                .map(|c| c.similarity)
                .unwrap_or_default(),
            Self::Unmatched { best_similarity } => *best_similarity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Matched,
    Ambiguous,
    Unmatched,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Matched => "matched",
            Self::Ambiguous => "ambiguous",
            Self::Unmatched => "unmatched",
        })
    }
}

/// Point-in-time full copy of a table. The name alone encodes `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub source_table: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub row_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    DryRun,
    Apply,
    Restore,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DryRun => "dry-run",
            Self::Apply => "apply",
            Self::Restore => "restore",
        })
    }
}

/// Phases a run moves through; dry-runs jump from `Matched` to `Reported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Extracted,
    Matched,
    BackedUp,
    Written,
    Reported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NoDates,
    ConflictingUpdates,
    /// The target has no empty date column and the run only fills gaps.
    AlreadyDated,
}

/// What happened (or would happen) to the store for one legacy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WriteDisposition {
    /// Unmatched or ambiguous: never written.
    None,
    /// Dry-run: the proposed update was not sent.
    Proposed,
    Written,
    Skipped { reason: SkipReason },
    RolledBack,
}

/// Per-record detail row of a run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub legacy: LegacyRecord,
    pub normalized_title: String,
    pub parsed_dates: ProgramDates,
    pub result: MatchResult,
    pub proposed: Option<ProgramUpdate>,
    pub write: WriteDisposition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// The write transaction rolled back; the backup taken before it is intact.
    Write,
    /// Writes committed but retention pruning failed.
    Prune,
}

/// Infrastructure failure surfaced in a report with enough context to remediate by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub kind: RunErrorKind,
    pub table: String,
    pub snapshot: Option<String>,
    pub attempted: usize,
    pub message: String,
}

/// The report artifact of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub as_of: NaiveDate,
    pub thresholds: MatchThresholds,
    pub table: String,
    pub results: Vec<RecordOutcome>,
    pub updated_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub backup: Option<BackupSnapshot>,
    pub restored_from: Option<BackupSnapshot>,
    pub pruned_backups: Vec<String>,
    pub extraction_warnings: Vec<String>,
    pub errors: Vec<RunError>,
}

impl SyncRun {
    pub fn new(mode: SyncMode, table: impl Into<String>, thresholds: MatchThresholds, as_of: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            status: RunStatus::Ok,
            phase: RunPhase::Init,
            started_at: Utc::now(),
            finished_at: None,
            as_of,
            thresholds,
            table: table.into(),
            results: Vec::new(),
            updated_count: 0,
            skipped_count: 0,
            error_count: 0,
            backup: None,
            restored_from: None,
            pruned_backups: Vec::new(),
            extraction_warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.results.iter().filter(|r| r.result.kind() == kind).count()
    }

    pub fn push_error(&mut self, error: RunError) {
        self.error_count += 1;
        self.status = RunStatus::Failed;
        self.errors.push(error);
    }

    pub fn finish(&mut self) {
        self.phase = RunPhase::Reported;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn program_dates() -> ProgramDates {
        ProgramDates {
            recruit_start: Some(d(2024, 2, 1)),
            recruit_end: Some(d(2024, 2, 20)),
            start_date: Some(d(2024, 3, 1)),
            end_date: Some(d(2024, 5, 31)),
        }
    }

    #[test]
    fn status_follows_the_calendar() {
        let dates = program_dates();
        assert_eq!(dates.derive_status(d(2024, 1, 10)), Some(ProgramStatus::Upcoming));
        assert_eq!(dates.derive_status(d(2024, 2, 1)), Some(ProgramStatus::Recruiting));
        assert_eq!(dates.derive_status(d(2024, 2, 25)), Some(ProgramStatus::Upcoming));
        assert_eq!(dates.derive_status(d(2024, 3, 1)), Some(ProgramStatus::InProgress));
        assert_eq!(dates.derive_status(d(2024, 5, 31)), Some(ProgramStatus::InProgress));
        assert_eq!(dates.derive_status(d(2024, 6, 1)), Some(ProgramStatus::Closed));
        assert_eq!(ProgramDates::default().derive_status(d(2024, 6, 1)), None);
    }

    #[test]
    fn recruitment_only_dates_close_after_the_window() {
        let dates = ProgramDates {
            recruit_start: Some(d(2024, 2, 1)),
            recruit_end: Some(d(2024, 2, 20)),
            ..Default::default()
        };
        assert_eq!(dates.derive_status(d(2024, 2, 21)), Some(ProgramStatus::Closed));
    }

    #[test]
    fn distance_is_zero_inside_span() {
        let dates = program_dates();
        assert_eq!(dates.distance_days(d(2024, 4, 1)), Some(0));
        assert_eq!(dates.distance_days(d(2024, 2, 28)), Some(2));
        assert_eq!(dates.distance_days(d(2024, 6, 3)), Some(3));
        assert_eq!(ProgramDates::default().distance_days(d(2024, 6, 3)), None);
    }

    #[test]
    fn update_only_touches_parsed_fields() {
        let mut program = TargetProgram {
            id: 7,
            title: "인문학 아카데미".into(),
            dates: ProgramDates {
                recruit_start: Some(d(2024, 1, 1)),
                ..Default::default()
            },
            status: ProgramStatus::Upcoming,
        };
        let parsed = ProgramDates {
            start_date: Some(d(2024, 3, 1)),
            end_date: Some(d(2024, 5, 31)),
            ..Default::default()
        };
        let update = ProgramUpdate::from_parsed(&program, parsed, d(2024, 4, 1)).unwrap();
        update.apply_to(&mut program);
        assert_eq!(program.dates.recruit_start, Some(d(2024, 1, 1)));
        assert_eq!(program.dates.start_date, Some(d(2024, 3, 1)));
        assert_eq!(program.status, ProgramStatus::InProgress);
        assert!(ProgramUpdate::from_parsed(&program, ProgramDates::default(), d(2024, 4, 1)).is_none());
    }

    #[test]
    fn thresholds_reject_out_of_range_values() {
        assert!(MatchThresholds::default().validate().is_ok());
        let bad = MatchThresholds {
            accept: 1.2,
            ambiguity_margin: 0.05,
        };
        assert_eq!(bad.validate(), Err(ThresholdError::Accept(1.2)));
    }

    #[test]
    fn target_program_serializes_with_store_field_names() {
        let program = TargetProgram {
            id: 1,
            title: "독서모임".into(),
            dates: program_dates(),
            status: ProgramStatus::InProgress,
        };
        let value = serde_json::to_value(&program).unwrap();
        assert_eq!(value["recruitStart"], "2024-02-01");
        assert_eq!(value["status"], "IN_PROGRESS");
        let back: TargetProgram = serde_json::from_value(value).unwrap();
        assert_eq!(back, program);
    }
}
