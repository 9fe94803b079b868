//! Keyword tokenization and term-overlap scoring.
//!
//! The keyword score of a chunk is the fraction of distinct query terms
//! that occur anywhere in the chunk's question, answer, or tags. It is
//! bounded to `[0, 1]` so it can be fused with cosine similarity.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "how", "i", "if", "in", "is", "it", "me", "my", "of", "on", "or", "our", "the", "there",
    "this", "to", "we", "what", "when", "where", "which", "who", "with", "you", "your",
];

/// Lowercases, splits on non-alphanumeric characters, and drops stopwords
/// and single letters. Numbers are kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| t.chars().count() > 1 || t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOPWORDS.contains(t))
        .map(normalize)
        .collect()
}

// Folds simple plurals ("hours" -> "hour") so singular and plural match.
fn normalize(token: &str) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

/// Distinct query terms in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Fraction of `terms` present in `text`. Zero when there are no terms.
pub fn overlap_score(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let doc: HashSet<String> = tokenize(text).into_iter().collect();
    let matched = terms.iter().filter(|t| doc.contains(*t)).count();
    matched as f64 / terms.len() as f64
}
