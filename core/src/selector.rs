//! Boolean selector expressions over tag presence
//!
//! The grammar, loosest binding first:
//!
//! ```text
//! expr    := and (',' and)*          OR
//! and     := unary unary*            AND (space separated)
//! unary   := '!' unary | primary
//! primary := '*' | TAG | '(' expr ')'
//! ```
//!
//! A literal tag matches when the tag is present in the set; `*` matches
//! every set. Selectors are parsed at load time and never fail afterwards.

use std::fmt;

use crate::error::ModelError;
use crate::tags::Tags;

/// A parsed selector expression
///
/// # Example
///
/// ```
/// use scout_core::{Selector, Tags};
///
/// let sr = Selector::parse("apache, (nginx !stale)").unwrap();
/// assert!(sr.matches(&Tags::parse("nginx").unwrap()));
/// assert!(!sr.matches(&Tags::parse("nginx stale").unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// `*` - matches any tag set
    Any,
    /// A literal tag - matches when present
    Tag(String),
    /// `!expr` - negation
    Not(Box<Selector>),
    /// Space-separated conjunction
    And(Vec<Selector>),
    /// Comma-separated disjunction
    Or(Vec<Selector>),
}

impl Selector {
    /// Parse a selector expression
    ///
    /// An empty expression parses to [`Selector::Any`] so that optional
    /// selector fields in rule configuration mean "match everything".
    pub fn parse(expr: &str) -> Result<Self, ModelError> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Ok(Selector::Any);
        }
        let mut parser = Parser {
            expr,
            tokens,
            pos: 0,
        };
        let sr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error(format!("unexpected '{}'", parser.tokens[parser.pos])));
        }
        Ok(sr)
    }

    /// Evaluate the expression against a tag set
    pub fn matches(&self, tags: &Tags) -> bool {
        match self {
            Selector::Any => true,
            Selector::Tag(tag) => tags.contains(tag),
            Selector::Not(inner) => !inner.matches(tags),
            Selector::And(parts) => parts.iter().all(|p| p.matches(tags)),
            Selector::Or(parts) => parts.iter().any(|p| p.matches(tags)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    Not,
    Comma,
    Star,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Tag(t) => write!(f, "{t}"),
            Token::Not => write!(f, "!"),
            Token::Comma => write!(f, ","),
            Token::Star => write!(f, "*"),
            Token::Open => write!(f, "("),
            Token::Close => write!(f, ")"),
        }
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ModelError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            'a'..='z' | 'A'..='Z' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '=' || c == '_' || c == '.' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Tag(word));
            }
            other => {
                return Err(ModelError::InvalidSelector {
                    expr: expr.to_string(),
                    reason: format!("forbidden symbol '{other}'"),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    expr: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: String) -> ModelError {
        ModelError::InvalidSelector {
            expr: self.expr.to_string(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> Result<Selector, ModelError> {
        let mut parts = vec![self.and()?];
        while self.peek() == Some(&Token::Comma) {
            self.next();
            parts.push(self.and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Selector::Or(parts)
        })
    }

    fn and(&mut self) -> Result<Selector, ModelError> {
        let mut parts = vec![self.unary()?];
        while matches!(
            self.peek(),
            Some(Token::Tag(_) | Token::Not | Token::Star | Token::Open)
        ) {
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Selector::And(parts)
        })
    }

    fn unary(&mut self) -> Result<Selector, ModelError> {
        match self.next() {
            Some(Token::Not) => Ok(Selector::Not(Box::new(self.unary()?))),
            Some(Token::Star) => Ok(Selector::Any),
            Some(Token::Tag(tag)) => Ok(Selector::Tag(tag)),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(self.error("missing ')'".to_string())),
                }
            }
            Some(t) => Err(self.error(format!("unexpected '{t}'"))),
            None => Err(self.error("unexpected end of expression".to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tags(line: &str) -> Tags {
        Tags::parse(line).unwrap()
    }

    #[test]
    fn literal_matches_presence() {
        let sr = Selector::parse("apache").unwrap();
        assert!(sr.matches(&tags("apache php")));
        assert!(!sr.matches(&tags("nginx")));
    }

    #[test]
    fn star_matches_everything() {
        let sr = Selector::parse("*").unwrap();
        assert!(sr.matches(&tags("")));
        assert!(sr.matches(&tags("anything")));
    }

    #[test]
    fn empty_expression_matches_everything() {
        let sr = Selector::parse("").unwrap();
        assert_eq!(sr, Selector::Any);
        assert!(sr.matches(&tags("whatever")));
    }

    #[test]
    fn negation() {
        let sr = Selector::parse("!stale").unwrap();
        assert!(sr.matches(&tags("fresh")));
        assert!(!sr.matches(&tags("stale")));
    }

    #[test]
    fn space_means_and() {
        let sr = Selector::parse("apache php").unwrap();
        assert!(sr.matches(&tags("apache php mysql")));
        assert!(!sr.matches(&tags("apache")));
    }

    #[test]
    fn comma_means_or() {
        let sr = Selector::parse("apache, nginx").unwrap();
        assert!(sr.matches(&tags("apache")));
        assert!(sr.matches(&tags("nginx")));
        assert!(!sr.matches(&tags("caddy")));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let sr = Selector::parse("apache php, nginx").unwrap();
        assert!(sr.matches(&tags("nginx")));
        assert!(!sr.matches(&tags("php")));
        assert!(sr.matches(&tags("apache php")));
    }

    #[test]
    fn parentheses_group() {
        let sr = Selector::parse("(apache, nginx) !stale").unwrap();
        assert!(sr.matches(&tags("apache")));
        assert!(!sr.matches(&tags("apache stale")));
    }

    #[test]
    fn negated_group() {
        let sr = Selector::parse("!(a b)").unwrap();
        assert!(sr.matches(&tags("a")));
        assert!(!sr.matches(&tags("a b")));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["(a", "a)", "a,", ",a", "!", "a &", "()"] {
            assert!(Selector::parse(expr).is_err(), "expr {expr:?} should fail");
        }
    }
}
