//! Pipeline configuration documents and the event stream they arrive on
//!
//! A [`PipelineConfig`] is one user-written YAML document naming a pipeline
//! and holding the sub-configuration of each stage. Its identity is a
//! structural hash: two documents that decode to the same value hash equal
//! regardless of key order, and the supervisor uses that to skip no-op
//! reloads.

use serde::{Deserialize, Serialize};

use scout_core::hash::value_hash;

use crate::build;
use crate::discovery;
use crate::error::{EngineError, Result};
use crate::export;
use crate::tag;

/// One pipeline configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, used in log lines only
    #[serde(default)]
    pub name: String,
    /// Discovery stage configuration
    #[serde(default)]
    pub discovery: discovery::Config,
    /// Tag stage configuration
    #[serde(default)]
    pub tag: tag::Config,
    /// Build stage configuration
    #[serde(default)]
    pub build: build::Config,
    /// Export stage configuration
    #[serde(default)]
    pub export: export::Config,
}

impl PipelineConfig {
    /// Structural hash of the document, insensitive to field order
    ///
    /// Serialization cannot fail for this type; a failure would mean the
    /// document never decoded in the first place, so it degrades to the
    /// hash of a null value rather than panicking.
    pub fn hash(&self) -> u64 {
        let value = serde_yaml::to_value(self).unwrap_or(serde_yaml::Value::Null);
        value_hash(&value)
    }

    /// Validate the document shape before any stage is constructed
    ///
    /// Stage managers re-validate their own sections in depth; this only
    /// rejects documents with nothing to run.
    pub fn validate(&self) -> Result<()> {
        if self.discovery.k8s.is_empty() {
            return Err(EngineError::Config(
                "'discovery' not set, need at least 1 discoverer".to_string(),
            ));
        }
        if self.tag.is_empty() {
            return Err(EngineError::Config(
                "'tag' not set, need at least 1 rule".to_string(),
            ));
        }
        if self.build.is_empty() {
            return Err(EngineError::Config(
                "'build' not set, need at least 1 rule".to_string(),
            ));
        }
        Ok(())
    }
}

/// One change to the set of known configuration documents
///
/// `pipeline == None` means the source was removed. Sources are the
/// primary key in the supervisor's live set.
#[derive(Debug, Clone, Default)]
pub struct ConfigEvent {
    /// Stable identity of the document's origin (file path, cmap triple)
    pub source: String,
    /// The decoded document, or `None` for a removal
    pub pipeline: Option<PipelineConfig>,
}

impl ConfigEvent {
    /// An add-or-change event
    pub fn updated(source: impl Into<String>, pipeline: PipelineConfig) -> Self {
        Self {
            source: source.into(),
            pipeline: Some(pipeline),
        }
    }

    /// A removal event
    pub fn removed(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pipeline: None,
        }
    }
}
