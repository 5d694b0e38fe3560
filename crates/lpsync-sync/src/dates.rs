//! Reads recruitment and program dates out of free-form legacy date text.

use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use lpsync_core::ProgramDates;
use regex::{Captures, Regex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Recruit,
    Program,
}

#[derive(Debug, Clone, Copy)]
struct DateToken {
    at: usize,
    date: NaiveDate,
}

fn date_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?x)
            (?P<y>[0-9]{4})\s*(?:[./-]|년)\s*(?P<m>[0-9]{1,2})\s*(?:[./-]|월)\s*(?P<d>[0-9]{1,2})(?:\s*일)?
            | (?P<yy>[0-9]{2})\.(?P<m2>[0-9]{1,2})\.(?P<d2>[0-9]{1,2})
            | (?P<m3>[0-9]{1,2})\s*월\s*(?P<d3>[0-9]{1,2})(?:\s*일)?
            | (?P<m4>[0-9]{1,2})[./](?P<d4>[0-9]{1,2})
            ",
        )
        .expect("static regex")
    })
}

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // A label swallows the rest of its word so "신청기간" reads as one recruitment label.
        Regex::new(r"(?P<recruit>(?:모집|접수|신청)[가-힣]*)|(?P<program>(?:교육|운영|활동|행사|기간|일시)[가-힣]*)")
            .expect("static regex")
    })
}

/// Parses `text` with no fallback year: year-less dates need a preceding full date.
pub fn parse_program_dates(text: &str) -> ProgramDates {
    parse_program_dates_in(text, None)
}

/// Like [`parse_program_dates`], but a leading year-less date (`7.22`, `7월 22일`)
/// takes `default_year`.
///
/// Labelled segments (`모집`/`접수`/`신청` versus `교육`/`운영`/`활동`/`행사`/`기간`/`일시`)
/// decide which range a date belongs to. Unlabelled text with four or more dates
/// reads as recruitment start/end then program start/end; two or three dates
/// are the program range; a single date is a one-day program.
pub fn parse_program_dates_in(text: &str, default_year: Option<i32>) -> ProgramDates {
    let tokens = date_tokens(text, default_year);
    if tokens.is_empty() {
        return ProgramDates::default();
    }
    let labels = labels(text);

    let mut recruit = Vec::new();
    let mut program = Vec::new();
    let mut unlabelled = Vec::new();
    for token in &tokens {
        let label = labels
            .iter()
            .take_while(|(at, _)| *at < token.at)
            .last()
            .map(|(_, label)| *label);
        match label {
            Some(Label::Recruit) => recruit.push(token.date),
            Some(Label::Program) => program.push(token.date),
            None => unlabelled.push(token.date),
        }
    }

    if recruit.is_empty() && program.is_empty() {
        match unlabelled.len() {
            n if n >= 4 => {
                recruit.extend_from_slice(&unlabelled[..2]);
                program.extend_from_slice(&unlabelled[2..]);
            }
            _ => program = unlabelled,
        }
    } else if !unlabelled.is_empty() {
        if program.is_empty() {
            program = unlabelled;
        } else if recruit.is_empty() {
            recruit = unlabelled;
        }
    }

    let (recruit_start, recruit_end) = bounds(&recruit);
    let (start_date, end_date) = bounds(&program);
    ProgramDates {
        recruit_start,
        recruit_end,
        start_date,
        end_date,
    }
}

fn bounds(dates: &[NaiveDate]) -> (Option<NaiveDate>, Option<NaiveDate>) {
    (dates.iter().min().copied(), dates.iter().max().copied())
}

fn labels(text: &str) -> Vec<(usize, Label)> {
    label_pattern()
        .captures_iter(text)
        .filter_map(|caps| {
            let at = caps.get(0)?.start();
            if caps.name("recruit").is_some() {
                Some((at, Label::Recruit))
            } else {
                Some((at, Label::Program))
            }
        })
        .collect()
}

fn number(caps: &Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

fn date_tokens(text: &str, default_year: Option<i32>) -> Vec<DateToken> {
    let mut tokens = Vec::new();
    let mut previous: Option<NaiveDate> = None;

    for caps in date_pattern().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        // Reject fragments of longer digit runs (phone numbers, ids).
        let digit_before = text[..whole.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_digit());
        let digit_after = text[whole.end()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit());
        if digit_before || digit_after {
            continue;
        }

        let date = if let (Some(y), Some(m), Some(d)) =
            (number(&caps, "y"), number(&caps, "m"), number(&caps, "d"))
        {
            NaiveDate::from_ymd_opt(y as i32, m, d)
        } else if let (Some(yy), Some(m), Some(d)) =
            (number(&caps, "yy"), number(&caps, "m2"), number(&caps, "d2"))
        {
            NaiveDate::from_ymd_opt(2000 + yy as i32, m, d)
        } else {
            let month = number(&caps, "m3").or_else(|| number(&caps, "m4"));
            let day = number(&caps, "d3").or_else(|| number(&caps, "d4"));
            let year = match previous {
                // Month going backwards means the range crossed New Year.
                Some(prev) if month.is_some_and(|m| m < prev.month()) => Some(prev.year() + 1),
                Some(prev) => Some(prev.year()),
                None => default_year,
            };
            match (year, month, day) {
                (Some(year), Some(month), Some(day)) => NaiveDate::from_ymd_opt(year, month, day),
                _ => None,
            }
        };

        if let Some(date) = date {
            previous = Some(date);
            tokens.push(DateToken {
                at: whole.start(),
                date,
            });
        }
    }
    tokens
}
