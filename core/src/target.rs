//! The target / group / artifact model
//!
//! A [`Target`] is a single discovered endpoint plus metadata. Its identity
//! is its hash: two targets with equal hashes are the same discovered
//! entity, whatever else differs. Tags are the only field that mutates
//! after construction.
//!
//! A [`Group`] is a snapshot of targets from one source at one instant.
//! A group with zero targets means "this source is gone".
//!
//! An [`Artifact`] is what the pipeline hands to exporters: a rendered
//! configuration string plus the tags that route it. `stale` flips the
//! delta from "publish this" to "withdraw this".

use std::fmt::Debug;

use crate::tags::Tags;

/// A single discovered endpoint
///
/// Implementations carry the platform-specific fields (addresses, labels,
/// environment...) and expose them for template rendering through
/// [`Target::view`]. The engine itself only needs identity, tags, and a
/// human-readable handle for log lines.
pub trait Target: Debug + Send {
    /// Stable content hash over the target's semantic fields
    ///
    /// The tag carrier is excluded: tagging a target must not change
    /// its identity.
    fn hash(&self) -> u64;

    /// Human-readable target identifier, never used for identity
    fn tuid(&self) -> &str;

    /// The target's tag set
    fn tags(&self) -> &Tags;

    /// Mutable access to the tag set, for tagging and enrichment
    fn tags_mut(&mut self) -> &mut Tags;

    /// The target's fields as template-renderable data
    fn view(&self) -> serde_json::Value;
}

/// A snapshot of zero or more targets under one stable source
#[derive(Debug, Default)]
pub struct Group {
    /// Stable identity of the logical input this snapshot came from
    pub source: String,
    /// The targets; empty means the source is gone
    pub targets: Vec<Box<dyn Target>>,
}

impl Group {
    /// A removal signal for `source`
    pub fn empty(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            targets: Vec::new(),
        }
    }

    /// A snapshot of `targets` under `source`
    pub fn new(source: impl Into<String>, targets: Vec<Box<dyn Target>>) -> Self {
        Self {
            source: source.into(),
            targets,
        }
    }
}

/// A rendered configuration artifact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    /// The rendered template output, opaque to the engine
    pub conf: String,
    /// Tags routing this artifact to exporters
    pub tags: Tags,
    /// When true, the artifact should be withdrawn instead of published
    pub stale: bool,
}

impl Artifact {
    /// Mark a batch of artifacts stale, in place
    pub fn stale_all(mut artifacts: Vec<Artifact>) -> Vec<Artifact> {
        for a in &mut artifacts {
            a.stale = true;
        }
        artifacts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_has_no_targets() {
        let g = Group::empty("k8s/pod/default/web");
        assert_eq!(g.source, "k8s/pod/default/web");
        assert!(g.targets.is_empty());
    }

    #[test]
    fn stale_all_marks_every_artifact() {
        let batch = vec![
            Artifact {
                conf: "a".to_string(),
                ..Default::default()
            },
            Artifact {
                conf: "b".to_string(),
                ..Default::default()
            },
        ];
        let stale = Artifact::stale_all(batch);
        assert!(stale.iter().all(|a| a.stale));
    }
}
