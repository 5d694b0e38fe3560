//! Title canonicalization ahead of similarity scoring.

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Bracket pairs whose contents are cohort/session annotations.
const BRACKETS: &[(char, char)] = &[
    ('(', ')'),
    ('[', ']'),
    ('{', '}'),
    ('【', '】'),
    ('〔', '〕'),
    ('〈', '〉'),
    ('《', '》'),
    ('「', '」'),
    ('『', '』'),
    ('<', '>'),
];

const MAX_PASSES: usize = 16;

fn ordinal_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // "제3기", "제 12 회차"
            Regex::new(r"(?:^|\s)제\s*[0-9]+\s*(?:회차|기|차|회)$").expect("static regex"),
            // "3기", "2차", "10회", "5期"
            Regex::new(r"\s*[0-9]+\s*(?:회차|기|차|회|期)$").expect("static regex"),
            // "camp 2nd"
            Regex::new(r"\s+[0-9]+(?:st|nd|rd|th)$").expect("static regex"),
        ]
    })
}

/// Canonical comparison form of a free-text title. Total, pure and idempotent:
/// `normalize(&normalize(x)) == normalize(x)` for every input.
pub fn normalize(raw: &str) -> String {
    let mut current = single_pass(raw);
    for _ in 0..MAX_PASSES {
        let next = single_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn single_pass(input: &str) -> String {
    let mut folded = String::with_capacity(input.len());
    for c in input.nfkc().flat_map(char::to_lowercase) {
        match c {
            c if is_invisible(c) => {}
            c if c.is_whitespace() || c.is_control() => folded.push(' '),
            // Lowercase forms whose case fold differs.
            'ß' => folded.push_str("ss"),
            'ς' => folded.push('σ'),
            c => folded.push(c),
        }
    }
    let folded = collapse_whitespace(&folded);

    let unbracketed = collapse_whitespace(&strip_brackets(&folded));
    let text = if unbracketed.is_empty() { folded } else { unbracketed };

    let unnumbered = strip_trailing_ordinals(&text);
    if unnumbered.is_empty() {
        text
    } else {
        unnumbered
    }
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}')
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes balanced bracketed spans (nested ones included). Unbalanced
/// brackets are kept as literal characters.
fn strip_brackets(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut removed = vec![false; chars.len()];
    let mut open: Vec<(char, usize)> = Vec::new();

    for (index, &c) in chars.iter().enumerate() {
        if let Some(&(_, close)) = BRACKETS.iter().find(|(o, _)| *o == c) {
            open.push((close, index));
        } else if BRACKETS.iter().any(|(_, close)| *close == c) {
            if let Some(position) = open.iter().rposition(|(close, _)| *close == c) {
                let (_, start) = open[position];
                open.truncate(position);
                removed[start..=index].iter_mut().for_each(|r| *r = true);
            }
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut previous_removed = false;
    for (c, gone) in chars.into_iter().zip(removed) {
        if gone {
            if !previous_removed {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
        previous_removed = gone;
    }
    out
}

fn strip_trailing_ordinals(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let before = current.len();
        for pattern in ordinal_patterns() {
            let stripped = pattern.replace(&current, "").trim_end().to_string();
            current = stripped;
        }
        if current.len() == before {
            return current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_cohort_suffixes() {
        assert_eq!(normalize("인문학 아카데미 3기"), "인문학 아카데미");
        assert_eq!(normalize("인문학 아카데미 제3기"), "인문학 아카데미");
        assert_eq!(normalize("독서모임 2차"), "독서모임");
        assert_eq!(normalize("시민 글쓰기 교실 12회차"), "시민 글쓰기 교실");
        assert_eq!(normalize("Coding Camp 2nd"), "coding camp");
        assert_eq!(normalize("아카데미 3기 2차"), "아카데미");
    }

    #[test]
    fn session_prefix_needs_a_word_boundary() {
        assert_eq!(normalize("지역 축제3회"), "지역 축제");
        assert_eq!(normalize("요가 교실 기초"), "요가 교실 기초");
    }

    #[test]
    fn strips_bracketed_annotations() {
        assert_eq!(normalize("[신규] 청소년 코딩 캠프 (2차)"), "청소년 코딩 캠프");
        assert_eq!(normalize("【모집중】 인문학 아카데미"), "인문학 아카데미");
        assert_eq!(normalize("독서모임(A반(오전))"), "독서모임");
        assert_eq!(normalize("인문학 (특강"), "인문학 (특강");
    }

    #[test]
    fn folds_case_width_and_whitespace() {
        assert_eq!(normalize("  Reading\u{3000}\u{3000}CLUB\t"), "reading club");
        assert_eq!(normalize("ＡＢＣ　교실"), "abc 교실");
        assert_eq!(normalize("독서\u{200B}모임"), "독서모임");
    }

    #[test]
    fn folds_case_beyond_lowercasing() {
        assert_eq!(normalize("STRAßE"), normalize("strasse"));
        assert_eq!(normalize("Straße Kurs"), "strasse kurs");
        assert_eq!(normalize("ẞ"), "ss");
        assert_eq!(normalize("ΟΔΟΣ"), normalize("οδος"));
    }

    #[test]
    fn never_strips_a_title_to_nothing() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
        assert_eq!(normalize("3기"), "3기");
        assert_eq!(normalize("(특강)"), "(특강)");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(raw in "\\PC{0,40}") {
            let once = normalize(&raw);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn normalize_is_idempotent_on_title_like_input(
            raw in "[ 가-힣a-zA-Z0-9()\\[\\]【】제기차회]{0,30}"
        ) {
            let once = normalize(&raw);
            prop_assert_eq!(normalize(&once), once);
        }
    }
}
