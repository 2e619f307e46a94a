//! Tag sets with signed merge semantics
//!
//! A tag is a token matching `[A-Za-z][A-Za-z0-9=_.]*`, optionally prefixed
//! with `-`. The prefix only means something during [`Tags::merge`]: merging
//! `-foo` into a set removes `foo` instead of inserting anything. Tag sets
//! are unordered; the printable form sorts lexicographically.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::ModelError;

/// An unordered set of tag tokens
///
/// # Example
///
/// ```
/// use scout_core::Tags;
///
/// let mut tags = Tags::parse("apache unknown").unwrap();
/// tags.merge(&Tags::parse("-unknown httpd").unwrap());
/// assert_eq!(tags.to_string(), "{apache, httpd}");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(BTreeSet<String>);

impl Tags {
    /// Create an empty tag set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a whitespace-separated tag line
    ///
    /// Every token must match `-?[A-Za-z][A-Za-z0-9=_.]*`. An empty or
    /// all-whitespace line parses to an empty set.
    pub fn parse(line: &str) -> Result<Self, ModelError> {
        let mut tags = Tags::new();
        for word in line.split_whitespace() {
            if !is_tag_word_valid(word) {
                return Err(ModelError::InvalidTag {
                    line: line.to_string(),
                    tag: word.to_string(),
                });
            }
            tags.0.insert(word.to_string());
        }
        Ok(tags)
    }

    /// Merge another tag set into this one
    ///
    /// Tokens prefixed with `-` remove the unprefixed token; everything
    /// else is inserted. Idempotent once a fixed point is reached.
    pub fn merge(&mut self, other: &Tags) {
        for tag in other.iter() {
            if let Some(stripped) = tag.strip_prefix('-') {
                self.0.remove(stripped);
            } else {
                self.0.insert(tag.to_string());
            }
        }
    }

    /// Whether the exact token is present
    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    /// Insert a single token without validation
    pub fn insert(&mut self, tag: impl Into<String>) {
        self.0.insert(tag.into());
    }

    /// Number of tokens in the set
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate tokens in lexicographic order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.0.iter().cloned().collect::<Vec<_>>().join(", ");
        write!(f, "{{{joined}}}")
    }
}

fn is_tag_word_valid(word: &str) -> bool {
    // ^-?[a-zA-Z][a-zA-Z0-9=_.]*$
    let word = word.strip_prefix('-').unwrap_or(word);
    if word.is_empty() {
        return false;
    }
    word.chars().enumerate().all(|(i, c)| match c {
        'a'..='z' | 'A'..='Z' => true,
        '0'..='9' | '=' | '_' | '.' => i > 0,
        _ => false,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_line() {
        let tags = Tags::parse("apache apache=80 a_b a.b").unwrap();
        assert_eq!(tags.len(), 4);
        assert!(tags.contains("apache=80"));
    }

    #[test]
    fn parse_empty_line() {
        assert!(Tags::parse("").unwrap().is_empty());
        assert!(Tags::parse("   ").unwrap().is_empty());
    }

    #[test]
    fn parse_keeps_removal_tokens() {
        let tags = Tags::parse("-unknown").unwrap();
        assert!(tags.contains("-unknown"));
    }

    #[test]
    fn parse_rejects_forbidden_symbols() {
        for line in ["0tag", "_tag", "=tag", "ta g!", "-", "a-b"] {
            assert!(Tags::parse(line).is_err(), "line {line:?} should fail");
        }
    }

    #[test]
    fn merge_inserts_and_removes() {
        let mut tags = Tags::parse("apache unknown").unwrap();
        tags.merge(&Tags::parse("-unknown httpd").unwrap());
        assert!(tags.contains("apache"));
        assert!(tags.contains("httpd"));
        assert!(!tags.contains("unknown"));
    }

    #[test]
    fn merge_is_idempotent_at_fixed_point() {
        let mut tags = Tags::parse("a b").unwrap();
        let delta = Tags::parse("c -b").unwrap();
        tags.merge(&delta);
        let once = tags.clone();
        tags.merge(&delta);
        assert_eq!(tags, once);
    }

    #[test]
    fn display_sorts_lexicographically() {
        let tags = Tags::parse("zeta alpha mid").unwrap();
        assert_eq!(tags.to_string(), "{alpha, mid, zeta}");
    }
}
