//! Keyword and length classification of user queries.

use regex::Regex;

use crate::config::{ConfigError, Vocabulary};

/// Which predicates a query satisfied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryProfile {
    pub coding: bool,
    pub math: bool,
    pub writing: bool,
    pub long_context: bool,
    /// Query length in characters.
    pub chars: usize,
}

/// Compiled keyword predicates.
#[derive(Debug, Clone)]
pub struct QueryClassifier {
    coding: Option<Regex>,
    math: Option<Regex>,
    writing: Option<Regex>,
    long_context: Option<Regex>,
}

impl QueryClassifier {
    pub fn new(vocabulary: &Vocabulary) -> Result<Self, ConfigError> {
        Ok(Self {
            coding: word_matcher("coding", &vocabulary.coding)?,
            math: word_matcher("math", &vocabulary.math)?,
            writing: word_matcher("writing", &vocabulary.writing)?,
            long_context: word_matcher("long_context", &vocabulary.long_context)?,
        })
    }

    /// Evaluate every predicate independently.
    ///
    /// A query longer than `long_context_chars` is long-context regardless of
    /// its words.
    pub fn classify(&self, query: &str, long_context_chars: usize) -> QueryProfile {
        let chars = query.chars().count();
        QueryProfile {
            coding: matches(&self.coding, query),
            math: matches(&self.math, query),
            writing: matches(&self.writing, query),
            long_context: chars > long_context_chars || matches(&self.long_context, query),
            chars,
        }
    }
}

fn matches(matcher: &Option<Regex>, query: &str) -> bool {
    matcher.as_ref().is_some_and(|re| re.is_match(query))
}

/// Build a case-insensitive whole-word alternation; `None` for an empty list.
fn word_matcher(list: &str, terms: &[String]) -> Result<Option<Regex>, ConfigError> {
    let escaped: Vec<String> = terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(regex::escape)
        .collect();

    if escaped.is_empty() {
        return Ok(None);
    }

    let pattern = format!(r"(?i)\b(?:{})\b", escaped.join("|"));
    Regex::new(&pattern).map(Some).map_err(|e| {
        ConfigError::Validation(format!("routing.vocabulary.{} is not usable: {}", list, e))
    })
}
