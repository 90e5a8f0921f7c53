//! Route keys and topic pattern matching.
//!
//! Topic route keys are dot-separated words. In binding patterns `*` matches
//! exactly one word and `#` matches zero or more words.

use std::fmt;
use std::sync::Arc;

use courier_core::AnyMessage;

/// Computes a route key from a message.
pub type RouteKeyFn = Arc<dyn Fn(&dyn AnyMessage) -> String + Send + Sync>;

/// How an exchange entity determines the route key of a message.
#[derive(Clone)]
pub enum RouteKey {
    /// The same key for every message.
    Static(String),
    /// A key computed from each message.
    Computed(RouteKeyFn),
}

impl RouteKey {
    /// Resolves the key for one message.
    pub fn resolve(&self, message: &dyn AnyMessage) -> String {
        match self {
            Self::Static(key) => key.clone(),
            Self::Computed(f) => f(message),
        }
    }

    /// Returns `true` for an empty static key.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Static(key) if key.is_empty())
    }
}

impl fmt::Debug for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(key) => f.debug_tuple("Static").field(key).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl From<&str> for RouteKey {
    fn from(key: &str) -> Self {
        Self::Static(key.to_string())
    }
}

impl From<String> for RouteKey {
    fn from(key: String) -> Self {
        Self::Static(key)
    }
}

/// Returns `true` if the topic `key` matches the binding `pattern`.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    };
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((literal, rest)) => {
            words.first().is_some_and(|word| word == literal) && match_words(rest, &words[1..])
        }
    }
}

/// Checks that a topic binding pattern is well formed.
///
/// Wildcards must occupy a whole word and no word may be empty.
pub fn validate_topic_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("topic pattern is empty".into());
    }
    for word in pattern.split('.') {
        if word.is_empty() {
            return Err(format!("topic pattern '{pattern}' has an empty word"));
        }
        if word != "*" && word != "#" && (word.contains('*') || word.contains('#')) {
            return Err(format!(
                "topic pattern '{pattern}' mixes a wildcard with text in '{word}'"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_one_word() {
        assert!(topic_matches("orders.*.created", "orders.eu.created"));
        assert!(!topic_matches("orders.*.created", "orders.created"));
        assert!(!topic_matches("orders.*.created", "orders.eu.west.created"));
    }

    #[test]
    fn test_hash_matches_zero_or_more_words() {
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.eu.created"));
        assert!(topic_matches("#.created", "orders.eu.created"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("orders.#", "invoices.created"));
    }

    #[test]
    fn test_literal_match() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.created.late"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_topic_pattern("orders.*.#").is_ok());
        assert!(validate_topic_pattern("orders..created").is_err());
        assert!(validate_topic_pattern("orders.cre*").is_err());
        assert!(validate_topic_pattern("").is_err());
    }
}
