//! Tokenization, keyword extraction, and similarity helpers shared by the
//! chunker, the search engines, and the temporal classifier.

use std::collections::HashSet;
use std::sync::LazyLock;

use sha2::{Digest, Sha256};

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "about", "above", "after", "again", "all", "am", "an", "and", "any", "are", "as",
        "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
        "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few",
        "for", "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers",
        "him", "his", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me",
        "more", "most", "my", "no", "nor", "not", "now", "of", "off", "on", "once", "only",
        "or", "other", "our", "ours", "out", "over", "own", "same", "she", "should", "so",
        "some", "such", "than", "that", "the", "their", "them", "then", "there", "these",
        "they", "this", "those", "through", "to", "too", "under", "until", "up", "very", "was",
        "we", "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will",
        "with", "would", "you", "your", "yours",
    ]
    .into_iter()
    .collect()
});

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(word)
}

/// Lowercase alphanumeric tokens. `_` and `-` stay inside a token so
/// identifiers like `max_connections` survive intact.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .map(|t| t.trim_matches('-').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Keywords of `text`: tokens that are not stop words and are at least
/// `min_len` chars long, de-duplicated in first-seen order.
pub fn extract_keywords(text: &str, min_len: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| t.chars().count() >= min_len && !is_stop_word(t))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

pub fn word_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard similarity of two word sets. Two empty sets are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Hex SHA-256 of a string.
pub fn content_hash(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// Hex SHA-256 of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Redis: default PORT is 6379, see max_connections."),
            vec!["redis", "default", "port", "is", "6379", "see", "max_connections"]
        );
    }

    #[test]
    fn test_extract_keywords_drops_stop_words_and_short_tokens() {
        let kws = extract_keywords("What is the default port of Redis on a VM", 3);
        assert_eq!(kws, vec!["default", "port", "redis"]);
    }

    #[test]
    fn test_extract_keywords_dedupes_preserving_order() {
        let kws = extract_keywords("cache redis cache eviction redis", 3);
        assert_eq!(kws, vec!["cache", "redis", "eviction"]);
    }

    #[test]
    fn test_jaccard() {
        let a = word_set("alpha beta gamma");
        let b = word_set("beta gamma delta");
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-9);
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-9);
        assert_eq!(jaccard(&a, &HashSet::new()), 0.0);
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello "));
    }

    #[test]
    fn test_snap_to_char_boundary() {
        let s = "a┌b";
        assert_eq!(snap_to_char_boundary(s, 2), 1);
        assert_eq!(snap_to_char_boundary(s, 10), s.len());
    }
}
