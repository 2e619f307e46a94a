//! Reference-counted artifact cache for exporters
//!
//! Several targets may render to the same conf string. The sink should
//! show one line for as long as at least one of them is alive, so each
//! exporter counts fresh emissions per conf and only removes the entry
//! when stale emissions have balanced them out.

use std::collections::HashMap;

use scout_core::Artifact;

/// conf string -> live reference count
#[derive(Debug, Default)]
pub(crate) struct ConfCache {
    counts: HashMap<String, usize>,
}

impl ConfCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Apply one artifact delta; returns whether the visible set changed
    pub(crate) fn put(&mut self, artifact: &Artifact) -> bool {
        if !artifact.stale {
            let count = self.counts.entry(artifact.conf.clone()).or_insert(0);
            *count += 1;
            return *count == 1;
        }
        let Some(count) = self.counts.get_mut(&artifact.conf) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.counts.remove(&artifact.conf);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.counts.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterate the live conf strings, order unspecified
    pub(crate) fn confs(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(conf: &str) -> Artifact {
        Artifact {
            conf: conf.to_string(),
            ..Default::default()
        }
    }

    fn stale(conf: &str) -> Artifact {
        Artifact {
            conf: conf.to_string(),
            stale: true,
            ..Default::default()
        }
    }

    #[test]
    fn first_fresh_changes_visible_set() {
        let mut cache = ConfCache::new();
        assert!(cache.put(&fresh("X")));
        assert!(!cache.put(&fresh("X")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_only_removes_at_zero() {
        let mut cache = ConfCache::new();
        cache.put(&fresh("X"));
        cache.put(&fresh("X"));
        assert!(!cache.put(&stale("X")));
        assert_eq!(cache.len(), 1);
        assert!(cache.put(&stale("X")));
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_for_unknown_conf_is_noop() {
        let mut cache = ConfCache::new();
        assert!(!cache.put(&stale("never-seen")));
        assert!(cache.is_empty());
    }

    #[test]
    fn refcount_balances_fresh_and_stale() {
        // invariant: fresh - stale == current count
        let mut cache = ConfCache::new();
        for _ in 0..5 {
            cache.put(&fresh("X"));
        }
        for _ in 0..3 {
            cache.put(&stale("X"));
        }
        assert_eq!(cache.counts.get("X"), Some(&2));
    }
}
