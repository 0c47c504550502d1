//! Search-text tokenization and fuzzy ranking.
//!
//! A search value is split on whitespace, commas, and periods, with
//! double quotes allowed to protect spaces (for
//! `publisher:"some name"` tokens). Plain tokens are ranked against
//! an extension's name, publisher, and description: a token matches a
//! target when it is a case-folded subsequence of it, and the match
//! distance is the Levenshtein distance between token and target
//! (lower is closer). A token that matches no target at all
//! invalidates the whole search for that extension.

use strsim::levenshtein;

/// One parsed search token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchToken {
    /// `publisher:NAME` — exact publisher match, case-insensitive.
    Publisher(String),
    /// Anything else — fuzzy-ranked against the corpus.
    Text(String),
}

/// The fields of one extension a search runs against.
#[derive(Debug, Clone, Copy)]
pub struct SearchCorpus<'a> {
    pub name: &'a str,
    pub publisher: &'a str,
    pub description: &'a str,
}

/// Split a raw search value into tokens.
pub fn tokenize(text: &str) -> Vec<SearchToken> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in text.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if !in_quotes && (c.is_whitespace() || c == ',' || c == '.') => {
                push_token(&mut tokens, &mut current);
            }
            _ => current.push(ch),
        }
    }
    push_token(&mut tokens, &mut current);
    tokens
}

fn push_token(tokens: &mut Vec<SearchToken>, current: &mut String) {
    if current.is_empty() {
        return;
    }
    let raw = std::mem::take(current);
    match raw.strip_prefix("publisher:") {
        Some(value) => tokens.push(SearchToken::Publisher(value.to_string())),
        None => tokens.push(SearchToken::Text(raw)),
    }
}

/// Rank one token against one target: the Levenshtein distance when
/// the token is a case-folded subsequence of the target, else no
/// match.
pub fn fuzzy_rank(token: &str, target: &str) -> Option<usize> {
    let token = token.to_lowercase();
    let target = target.to_lowercase();
    if !is_subsequence(&token, &target) {
        return None;
    }
    Some(levenshtein(&token, &target))
}

fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut chars = haystack.chars();
    needle.chars().all(|n| chars.any(|h| h == n))
}

/// Rank every token against the corpus. Returns the full distance
/// vector, or `None` when any token fails to match, which drops the
/// extension from the result set.
pub fn rank(tokens: &[SearchToken], corpus: &SearchCorpus<'_>) -> Option<Vec<usize>> {
    let mut distances = Vec::new();
    for token in tokens {
        match token {
            SearchToken::Publisher(value) => {
                if !corpus.publisher.eq_ignore_ascii_case(value) {
                    return None;
                }
                distances.push(0);
            }
            SearchToken::Text(value) => {
                let mut matched = false;
                for target in [corpus.name, corpus.publisher, corpus.description] {
                    if let Some(distance) = fuzzy_rank(value, target) {
                        distances.push(distance);
                        matched = true;
                    }
                }
                if !matched {
                    return None;
                }
            }
        }
    }
    Some(distances)
}
