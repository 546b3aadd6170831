//! Trigram similarity compatible with PostgreSQL `pg_trgm`.
//!
//! Text is lowercased and split into words on non-alphanumeric characters.
//! Each word is padded with two leading blanks and one trailing blank before
//! its three-character windows are collected into a set. Similarity is the
//! size of the intersection over the size of the union.

use std::collections::HashSet;

pub fn trigrams(text: &str) -> HashSet<String> {
    let mut grams = HashSet::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.chars().flat_map(char::to_lowercase))
            .chain(" ".chars())
            .collect();
        for window in padded.windows(3) {
            grams.insert(window.iter().collect());
        }
    }
    grams
}

/// Score in `[0, 1]`; `0.0` when either side has no trigrams.
pub fn similarity(left: &str, right: &str) -> f64 {
    let a = trigrams(left);
    let b = trigrams(right);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

/// Similarity against an optional value, missing values scoring zero.
pub fn similarity_opt(query: &str, candidate: Option<&str>) -> f64 {
    candidate.map(|c| similarity(query, c)).unwrap_or(0.0)
}

/// Case-insensitive substring test used as the candidate pre-filter.
pub fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
