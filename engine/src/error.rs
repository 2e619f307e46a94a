//! Error types for the scout engine

use thiserror::Error;

use scout_core::ModelError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the scout engine
///
/// Everything here surfaces at load or startup time. Runtime failures
/// (template rendering, file writes, watch hiccups) are logged and
/// survived where they happen; the pipeline's job is to converge on
/// subsequent events, not to die on the first bad one.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed user configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed selector, tag line, or template
    #[error("{0}")]
    Parse(#[from] ModelError),

    /// A template failed to compile at load time
    #[error("template parse error: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),

    /// A configuration document failed to decode
    #[error("decode error: {0}")]
    Decode(#[from] serde_yaml::Error),

    /// Kubernetes client construction or platform failure
    #[error("kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<handlebars::TemplateError> for EngineError {
    fn from(err: handlebars::TemplateError) -> Self {
        EngineError::Template(Box::new(err))
    }
}

impl EngineError {
    /// Prefix a configuration error's message with its component context
    pub(crate) fn context(self, ctx: &str) -> EngineError {
        match self {
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_converts() {
        let err: EngineError = ModelError::InvalidSelector {
            expr: "a &".to_string(),
            reason: "forbidden symbol '&'".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn config_error_display() {
        let err = EngineError::Config("'rule->selector' not set (rule web[1])".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: 'rule->selector' not set (rule web[1])"
        );
    }
}
