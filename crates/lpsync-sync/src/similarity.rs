//! Edit-distance similarity over Unicode scalar values.

/// `1 - levenshtein(a, b) / max(len(a), len(b), 1)`, lengths counted in chars.
/// Two empty strings are identical (1.0); one empty string scores 0.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - strsim::levenshtein(a, b) as f64 / longest as f64
}
