//! Tag manager - rule-based tagging via conditional templates
//!
//! Each rule gates on a selector; each match inside a rule gates on its own
//! selector and a condition template rendered against the target. When the
//! trimmed output is exactly `"true"`, the rule's tags and then the match's
//! tags are merged into the target.
//!
//! Templates use strict missing-key semantics: a reference to a field the
//! target does not carry is a render error, which skips that match only.

pub mod funcmap;

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use scout_core::{Selector, Tags, Target};

use crate::error::{EngineError, Result};
use crate::pipeline::Tagger;

/// Tag stage configuration: a non-empty list of rules
pub type Config = Vec<RuleConfig>;

/// One tagging rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name, used in log lines only
    #[serde(default)]
    pub name: String,
    /// Gates the whole rule; mandatory
    #[serde(default)]
    pub selector: String,
    /// Tags merged on every successful match; mandatory
    #[serde(default)]
    pub tags: String,
    /// The rule's matches; at least one
    #[serde(default, rename = "match")]
    pub matches: Vec<MatchConfig>,
}

/// One conditional match inside a rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Optional extra gate; empty means match all
    #[serde(default)]
    pub selector: String,
    /// Tags merged when the condition holds; mandatory
    #[serde(default)]
    pub tags: String,
    /// Condition template returning a boolean string; mandatory
    #[serde(default)]
    pub expr: String,
}

pub(crate) fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.is_empty() {
        return Err(EngineError::Config(
            "empty config, need least 1 rule".to_string(),
        ));
    }
    for (i, rule) in cfg.iter().enumerate() {
        if rule.selector.is_empty() {
            return Err(EngineError::Config(format!(
                "'rule->selector' not set (rule {}[{}])",
                rule.name,
                i + 1
            )));
        }
        if rule.tags.is_empty() {
            return Err(EngineError::Config(format!(
                "'rule->tags' not set (rule {}[{}])",
                rule.name,
                i + 1
            )));
        }
        if rule.matches.is_empty() {
            return Err(EngineError::Config(format!(
                "'rule->match' not set, need at least 1 rule match (rule {}[{}])",
                rule.name,
                i + 1
            )));
        }
        for (j, m) in rule.matches.iter().enumerate() {
            if m.tags.is_empty() {
                return Err(EngineError::Config(format!(
                    "'rule->match->tags' not set (rule {}[{}]/match [{}])",
                    rule.name,
                    i + 1,
                    j + 1
                )));
            }
            if m.expr.is_empty() {
                return Err(EngineError::Config(format!(
                    "'rule->match->expr' not set (rule {}[{}]/match [{}])",
                    rule.name,
                    i + 1,
                    j + 1
                )));
            }
        }
    }
    Ok(())
}

struct TagRule {
    id: usize,
    selector: Selector,
    tags: Tags,
    matches: Vec<RuleMatch>,
}

struct RuleMatch {
    id: usize,
    selector: Selector,
    tags: Tags,
    template: String,
}

/// Applies the configured tagging rules to targets
pub struct TagManager {
    rules: Vec<TagRule>,
    templates: Handlebars<'static>,
}

impl TagManager {
    /// Parse and compile the rule set; every selector, tag line, and
    /// template is validated here so tagging never fails to parse later
    pub fn new(cfg: &Config) -> Result<Self> {
        validate_config(cfg).map_err(|e| e.context("tag manager config validation"))?;

        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        funcmap::register(&mut templates);

        let mut rules = Vec::with_capacity(cfg.len());
        for (i, rule_cfg) in cfg.iter().enumerate() {
            let mut rule = TagRule {
                id: i + 1,
                selector: Selector::parse(&rule_cfg.selector)?,
                tags: Tags::parse(&rule_cfg.tags)?,
                matches: Vec::with_capacity(rule_cfg.matches.len()),
            };
            for (j, match_cfg) in rule_cfg.matches.iter().enumerate() {
                let name = format!("{}/{}", i + 1, j + 1);
                templates.register_template_string(&name, &match_cfg.expr)?;
                rule.matches.push(RuleMatch {
                    id: j + 1,
                    selector: Selector::parse(&match_cfg.selector)?,
                    tags: Tags::parse(&match_cfg.tags)?,
                    template: name,
                });
            }
            rules.push(rule);
        }
        Ok(Self { rules, templates })
    }
}

impl Tagger for TagManager {
    fn tag(&self, target: &mut dyn Target) {
        let view = target.view();
        for rule in &self.rules {
            if !rule.selector.matches(target.tags()) {
                continue;
            }
            for m in &rule.matches {
                if !m.selector.matches(target.tags()) {
                    continue;
                }
                let rendered = match self.templates.render(&m.template, &view) {
                    Ok(out) => out,
                    Err(err) => {
                        warn!(
                            rule = rule.id,
                            match_id = m.id,
                            target = target.tuid(),
                            error = %err,
                            "failed to execute rule match"
                        );
                        continue;
                    }
                };
                if rendered.trim() != "true" {
                    continue;
                }
                target.tags_mut().merge(&rule.tags);
                target.tags_mut().merge(&m.tags);
                debug!(target = target.tuid(), tags = %target.tags(), "matched target");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::tests::StubTarget;

    fn config(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn manager(yaml: &str) -> TagManager {
        TagManager::new(&config(yaml)).unwrap()
    }

    /// Target with a scripted view for template rendering
    #[derive(Debug)]
    struct ViewTarget {
        inner: StubTarget,
        view: serde_json::Value,
    }

    impl ViewTarget {
        fn new(tags: &str, view: serde_json::Value) -> Self {
            let mut inner = StubTarget::new(1, "default_web_nginx_tcp_80");
            inner.tags_mut().merge(&Tags::parse(tags).unwrap());
            Self { inner, view }
        }
    }

    impl Target for ViewTarget {
        fn hash(&self) -> u64 {
            self.inner.hash()
        }
        fn tuid(&self) -> &str {
            self.inner.tuid()
        }
        fn tags(&self) -> &Tags {
            self.inner.tags()
        }
        fn tags_mut(&mut self) -> &mut Tags {
            self.inner.tags_mut()
        }
        fn view(&self) -> serde_json::Value {
            self.view.clone()
        }
    }

    const RULES: &str = r#"
- selector: unknown
  tags: -unknown apache
  match:
    - tags: apache_80
      expr: '{{eqAny PortNumber "80 8080"}}'
    - tags: apache_443
      expr: '{{equal PortNumber "443"}}'
"#;

    #[test]
    fn merges_rule_then_match_tags_on_true() {
        let mgr = manager(RULES);
        let mut target = ViewTarget::new(
            "unknown",
            serde_json::json!({"PortNumber": "80"}),
        );
        mgr.tag(&mut target);
        assert_eq!(target.tags().to_string(), "{apache, apache_80}");
    }

    #[test]
    fn rule_selector_gates_the_whole_rule() {
        let mgr = manager(RULES);
        let mut target = ViewTarget::new(
            "identified",
            serde_json::json!({"PortNumber": "80"}),
        );
        mgr.tag(&mut target);
        assert_eq!(target.tags().to_string(), "{identified}");
    }

    #[test]
    fn false_condition_merges_nothing() {
        let mgr = manager(RULES);
        let mut target = ViewTarget::new(
            "unknown",
            serde_json::json!({"PortNumber": "9090"}),
        );
        mgr.tag(&mut target);
        assert_eq!(target.tags().to_string(), "{unknown}");
    }

    #[test]
    fn render_error_skips_only_that_match() {
        // first match references a missing field, second still applies
        let mgr = manager(
            r#"
- selector: '*'
  tags: base
  match:
    - tags: a
      expr: '{{equal MissingField "x"}}'
    - tags: b
      expr: '{{equal PortNumber "80"}}'
"#,
        );
        let mut target = ViewTarget::new("", serde_json::json!({"PortNumber": "80"}));
        mgr.tag(&mut target);
        assert_eq!(target.tags().to_string(), "{b, base}");
    }

    #[test]
    fn match_selector_gates_individually() {
        let mgr = manager(
            r#"
- selector: '*'
  tags: base
  match:
    - selector: never
      tags: a
      expr: 'true'
    - tags: b
      expr: 'true'
"#,
        );
        let mut target = ViewTarget::new("", serde_json::json!({}));
        mgr.tag(&mut target);
        assert_eq!(target.tags().to_string(), "{b, base}");
    }

    // ========================================================================
    // Validation
    // ========================================================================

    #[test]
    fn rejects_empty_config() {
        assert!(TagManager::new(&Vec::new()).is_err());
    }

    #[test]
    fn rejects_missing_mandatory_fields() {
        for yaml in [
            "- tags: t\n  match: [{tags: t, expr: 'true'}]",
            "- selector: s\n  match: [{tags: t, expr: 'true'}]",
            "- selector: s\n  tags: t",
            "- selector: s\n  tags: t\n  match: [{expr: 'true'}]",
            "- selector: s\n  tags: t\n  match: [{tags: t}]",
        ] {
            assert!(TagManager::new(&config(yaml)).is_err(), "yaml {yaml:?}");
        }
    }

    #[test]
    fn rejects_unparseable_selector_and_template() {
        let bad_selector = "- selector: 'a &'\n  tags: t\n  match: [{tags: t, expr: 'true'}]";
        assert!(TagManager::new(&config(bad_selector)).is_err());

        let bad_template = "- selector: s\n  tags: t\n  match: [{tags: t, expr: '{{#if}}'}]";
        assert!(TagManager::new(&config(bad_template)).is_err());
    }
}
