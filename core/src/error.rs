//! Error types for the scout model

use thiserror::Error;

/// Error type for model parsing operations
///
/// Covers everything that can go wrong while turning user-written text
/// (tag lines, selector expressions) into model values. All of these are
/// load-time errors: a value that parses never fails later.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A tag line contains a token with a forbidden symbol
    #[error("tags '{line}' contains tag '{tag}' with forbidden symbol")]
    InvalidTag {
        /// The full tag line as written by the user
        line: String,
        /// The offending token
        tag: String,
    },

    /// A selector expression failed to parse
    #[error("selector '{expr}' parse error: {reason}")]
    InvalidSelector {
        /// The full selector expression as written by the user
        expr: String,
        /// What the parser objected to
        reason: String,
    },
}
