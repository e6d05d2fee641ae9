//! Tokenization shared by BM25 indexing and query processing (§4.2).
//!
//! Lowercase, split on non-word characters, drop tokens shorter than 2 characters,
//! strip a small closed set of Korean grammatical particles (keeping both the
//! stripped and original form for recall), and remove stopwords.

use once_cell::sync::Lazy;
use std::collections::HashSet;

static PARTICLES: &[&str] = &[
    "은", "는", "이", "가", "을", "를", "에", "의", "도", "와", "과", "로", "으로", "에서", "에게",
    "한테", "부터", "까지", "만", "보다",
];

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "is", "are", "was", "were", "be", "to", "of", "in", "on", "for",
        "and", "or", "it", "this", "that",
    ]
    .into_iter()
    .collect()
});

/// Strips one trailing particle from `token` if present, returning `None` when no
/// particle matched (so callers can decide whether to keep both forms).
fn strip_particle(token: &str) -> Option<&str> {
    for particle in PARTICLES {
        if token.len() > particle.len() && token.ends_with(particle) {
            return Some(&token[..token.len() - particle.len()]);
        }
    }
    None
}

/// Splits on any run of non-alphanumeric characters (ASCII and Unicode word chars).
fn split_words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Tokenizes `text` into a bag of terms suitable for BM25 indexing or querying.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in split_words(text) {
        if word.chars().count() < 2 {
            continue;
        }
        if STOPWORDS.contains(word.as_str()) {
            continue;
        }
        if let Some(stripped) = strip_particle(&word) {
            if stripped.chars().count() >= 2 {
                out.push(stripped.to_string());
            }
        }
        out.push(word);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_short_tokens_and_stopwords() {
        let tokens = tokenize("the cat is on a mat");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(tokens.contains(&"cat".to_string()));
        assert!(tokens.contains(&"mat".to_string()));
    }

    #[test]
    fn strips_korean_particle_but_keeps_original() {
        let tokens = tokenize("고양이는 매트 위에 있다");
        assert!(tokens.contains(&"고양이는".to_string()));
        assert!(tokens.contains(&"고양이".to_string()));
    }

    #[test]
    fn lowercases() {
        let tokens = tokenize("GPU Status");
        assert!(tokens.contains(&"gpu".to_string()));
        assert!(tokens.contains(&"status".to_string()));
    }
}
