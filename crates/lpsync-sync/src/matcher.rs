//! Ranks store candidates for one legacy record and applies the accept/ambiguity policy.

use std::cmp::Ordering;

use chrono::NaiveDate;
use lpsync_core::{LegacyRecord, MatchCandidate, MatchResult, MatchThresholds, TargetProgram};

use crate::dates::parse_program_dates_in;
use crate::normalize::normalize;
use crate::similarity::similarity;

/// Scores closer than this are treated as equal when compared to a threshold.
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct PreparedCandidate {
    normalized: String,
    target: TargetProgram,
}

/// Candidates normalized once and reused for every legacy record of a run.
/// Performs no I/O; the orchestrator loads candidates from the store.
#[derive(Debug, Clone)]
pub struct Matcher {
    candidates: Vec<PreparedCandidate>,
    thresholds: MatchThresholds,
    default_year: Option<i32>,
}

impl Matcher {
    pub fn new(candidates: &[TargetProgram], thresholds: MatchThresholds) -> Self {
        Self {
            candidates: candidates
                .iter()
                .map(|target| PreparedCandidate {
                    normalized: normalize(&target.title),
                    target: target.clone(),
                })
                .collect(),
            thresholds,
            default_year: None,
        }
    }

    /// Year given to year-less legacy dates when ranking by date proximity.
    pub fn with_default_year(mut self, year: i32) -> Self {
        self.default_year = Some(year);
        self
    }

    pub fn thresholds(&self) -> &MatchThresholds {
        &self.thresholds
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Every candidate scored against `legacy`, best first.
    pub fn rank(&self, legacy: &LegacyRecord) -> Vec<MatchCandidate> {
        let title = normalize(&legacy.raw_title);
        if title.is_empty() {
            return Vec::new();
        }
        let anchor = parse_program_dates_in(&legacy.extracted_date_text, self.default_year).anchor();

        let mut ranked: Vec<MatchCandidate> = self
            .candidates
            .iter()
            .map(|candidate| MatchCandidate {
                legacy: legacy.clone(),
                target: candidate.target.clone(),
                similarity: similarity(&title, &candidate.normalized),
            })
            .collect();
        ranked.sort_by(|a, b| compare_candidates(a, b, anchor));
        ranked
    }

    pub fn match_record(&self, legacy: &LegacyRecord) -> MatchResult {
        decide(self.rank(legacy), &self.thresholds)
    }
}

/// Similarity descending; exact ties go to the target whose date range is
/// closest to `anchor` (targets without dates last), then to the lower id.
fn compare_candidates(a: &MatchCandidate, b: &MatchCandidate, anchor: Option<NaiveDate>) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| {
            let distance = |c: &MatchCandidate| anchor.and_then(|d| c.target.dates.distance_days(d));
            match (distance(a), distance(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
        .then_with(|| a.target.id.cmp(&b.target.id))
}

/// Applies the decision policy to candidates already ranked best first.
///
/// Below `accept` the record is unmatched. At or above it, a runner-up
/// closer than `ambiguity_margin` makes the record ambiguous, listing every
/// candidate within the margin of the best. Otherwise the best is matched.
pub fn decide(ranked: Vec<MatchCandidate>, thresholds: &MatchThresholds) -> MatchResult {
    let Some(best) = ranked.first() else {
        return MatchResult::Unmatched {
            best_similarity: 0.0,
        };
    };
    let best_score = best.similarity;
    if best_score < thresholds.accept - SCORE_EPSILON {
        return MatchResult::Unmatched {
            best_similarity: best_score,
        };
    }

    let within_margin =
        |c: &MatchCandidate| best_score - c.similarity < thresholds.ambiguity_margin - SCORE_EPSILON;
    let runner_up_close = ranked.get(1).is_some_and(within_margin);
    if runner_up_close {
        let top_candidates = ranked.into_iter().take_while(|c| within_margin(c)).collect();
        return MatchResult::Ambiguous { top_candidates };
    }

    let mut ranked = ranked;
    let best = ranked.swap_remove(0);
    MatchResult::Matched {
        target: best.target,
        similarity: best.similarity,
    }
}

/// One-shot form of [`Matcher::match_record`].
pub fn match_legacy(
    legacy: &LegacyRecord,
    candidates: &[TargetProgram],
    thresholds: &MatchThresholds,
) -> MatchResult {
    Matcher::new(candidates, *thresholds).match_record(legacy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpsync_core::{OutcomeKind, ProgramDates, ProgramStatus, SourceConfidence};
    use proptest::prelude::*;

    fn target(id: i64, title: &str) -> TargetProgram {
        TargetProgram {
            id,
            title: title.into(),
            dates: ProgramDates::default(),
            status: ProgramStatus::Upcoming,
        }
    }

    fn dated(id: i64, title: &str, start: (i32, u32, u32), end: (i32, u32, u32)) -> TargetProgram {
        TargetProgram {
            dates: ProgramDates {
                start_date: NaiveDate::from_ymd_opt(start.0, start.1, start.2),
                end_date: NaiveDate::from_ymd_opt(end.0, end.1, end.2),
                ..Default::default()
            },
            ..target(id, title)
        }
    }

    fn legacy(title: &str, dates: &str) -> LegacyRecord {
        LegacyRecord::new(title, dates, SourceConfidence::Text)
    }

    fn scored(id: i64, similarity: f64) -> MatchCandidate {
        MatchCandidate {
            legacy: legacy("독서모임", ""),
            target: target(id, &format!("독서모임 {id}")),
            similarity,
        }
    }

    #[test]
    fn cohort_suffix_matches_the_recurring_program() {
        let candidates = vec![target(1, "인문학 아카데미"), target(2, "인문학 세미나")];
        let result = match_legacy(
            &legacy("인문학 아카데미 3기", ""),
            &candidates,
            &MatchThresholds::default(),
        );
        match result {
            MatchResult::Matched { target, similarity } => {
                assert_eq!(target.id, 1);
                assert!(similarity >= 0.9);
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn close_runner_up_is_ambiguous_and_lists_both() {
        let result = decide(vec![scored(1, 0.82), scored(2, 0.80)], &MatchThresholds::default());
        match result {
            MatchResult::Ambiguous { top_candidates } => {
                let ids: Vec<_> = top_candidates.iter().map(|c| c.target.id).collect();
                assert_eq!(ids, vec![1, 2]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn sibling_classes_tie_and_stay_ambiguous() {
        let candidates = vec![target(10, "독서모임 A반"), target(11, "독서모임 B반")];
        let result = match_legacy(&legacy("독서모임 반", ""), &candidates, &MatchThresholds::default());
        assert_eq!(result.kind(), OutcomeKind::Ambiguous);
    }

    #[test]
    fn margin_exactly_met_is_a_match() {
        let result = decide(
            vec![scored(1, 0.85), scored(2, 0.80), scored(3, 0.40)],
            &MatchThresholds::default(),
        );
        assert_eq!(result.kind(), OutcomeKind::Matched);
        assert_eq!(result.matched_target().map(|t| t.id), Some(1));
    }

    #[test]
    fn ambiguous_lists_only_candidates_within_the_margin() {
        let result = decide(
            vec![scored(1, 0.90), scored(2, 0.88), scored(3, 0.70)],
            &MatchThresholds::default(),
        );
        match result {
            MatchResult::Ambiguous { top_candidates } => assert_eq!(top_candidates.len(), 2),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn below_accept_is_unmatched_with_best_score() {
        let candidates = vec![target(1, "시민 글쓰기 교실")];
        let result = match_legacy(&legacy("청소년 코딩 캠프", ""), &candidates, &MatchThresholds::default());
        match result {
            MatchResult::Unmatched { best_similarity } => assert!(best_similarity < 0.8),
            other => panic!("expected unmatched, got {other:?}"),
        }
    }

    #[test]
    fn empty_title_and_empty_candidate_set_are_unmatched() {
        let candidates = vec![target(1, "")];
        let result = match_legacy(&legacy("   ", ""), &candidates, &MatchThresholds::default());
        assert_eq!(result, MatchResult::Unmatched { best_similarity: 0.0 });

        let result = match_legacy(&legacy("독서모임", ""), &[], &MatchThresholds::default());
        assert_eq!(result, MatchResult::Unmatched { best_similarity: 0.0 });
    }

    #[test]
    fn exact_ties_prefer_the_closest_date_range_then_lowest_id() {
        let candidates = vec![
            target(1, "독서모임"),
            dated(2, "독서모임", (2023, 3, 1), (2023, 6, 30)),
            dated(3, "독서모임", (2024, 3, 1), (2024, 6, 30)),
            target(4, "독서모임"),
        ];
        let matcher = Matcher::new(&candidates, MatchThresholds::default());

        let ranked = matcher.rank(&legacy("독서모임 5기", "2024.03.02 ~ 2024.06.29"));
        let ids: Vec<_> = ranked.iter().map(|c| c.target.id).collect();
        assert_eq!(ids, vec![3, 2, 1, 4]);

        let undated = matcher.rank(&legacy("독서모임", ""));
        let ids: Vec<_> = undated.iter().map(|c| c.target.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn matching_is_deterministic_across_calls_and_input_order() {
        let mut candidates = vec![
            target(5, "독서모임 A반"),
            target(2, "인문학 아카데미"),
            target(9, "독서모임 B반"),
        ];
        let record = legacy("독서모임 반", "2024.03.02");
        let first = match_legacy(&record, &candidates, &MatchThresholds::default());
        assert_eq!(first, match_legacy(&record, &candidates, &MatchThresholds::default()));
        candidates.reverse();
        assert_eq!(first, match_legacy(&record, &candidates, &MatchThresholds::default()));
    }

    proptest! {
        #[test]
        fn decisions_respect_thresholds(
            mut scores in proptest::collection::vec(0.0f64..=1.0, 0..6),
            accept in 0.5f64..=1.0,
            margin in 0.0f64..=0.2,
        ) {
            scores.sort_by(|a, b| b.total_cmp(a));
            let thresholds = MatchThresholds { accept, ambiguity_margin: margin };
            let ranked: Vec<_> = scores
                .iter()
                .enumerate()
                .map(|(i, s)| scored(i as i64, *s))
                .collect();
            match decide(ranked, &thresholds) {
                MatchResult::Matched { similarity, .. } => {
                    prop_assert!(similarity >= accept - SCORE_EPSILON);
                    if let Some(second) = scores.get(1) {
                        prop_assert!(similarity - second >= margin - SCORE_EPSILON);
                    }
                }
                MatchResult::Ambiguous { top_candidates } => {
                    prop_assert!(top_candidates.len() >= 2);
                    prop_assert!(scores[0] >= accept - SCORE_EPSILON);
                }
                MatchResult::Unmatched { best_similarity } => {
                    prop_assert!(best_similarity < accept);
                }
            }
        }
    }
}
