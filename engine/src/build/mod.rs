//! Build manager - renders targets through templates into artifacts
//!
//! Structurally a sibling of the tag manager: rules gate on selectors, but
//! the leaf of each rule is an apply whose template output becomes an
//! artifact's conf string. The union of the rule's and the apply's tag sets
//! becomes the artifact's tags, which exporters later match against.

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use scout_core::{Artifact, Selector, Tags, Target};

use crate::error::{EngineError, Result};
use crate::pipeline::Builder;
use crate::tag::funcmap;

/// Build stage configuration: a non-empty list of rules
pub type Config = Vec<RuleConfig>;

/// One build rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name, used in log lines only
    #[serde(default)]
    pub name: String,
    /// Gates the whole rule; mandatory
    #[serde(default)]
    pub selector: String,
    /// Tags stamped on every artifact the rule produces; mandatory
    #[serde(default)]
    pub tags: String,
    /// The rule's applies; at least one
    #[serde(default)]
    pub apply: Vec<ApplyConfig>,
}

/// One template application inside a rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Gates this apply; mandatory
    #[serde(default)]
    pub selector: String,
    /// Extra tags for artifacts from this apply; optional
    #[serde(default)]
    pub tags: String,
    /// The configuration template; mandatory
    #[serde(default)]
    pub template: String,
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
        if rule.apply.is_empty() {
            return Err(EngineError::Config(format!(
                "'rule->apply' not set (rule {}[{}])",
                rule.name,
                i + 1
            )));
        }
        for (j, apply) in rule.apply.iter().enumerate() {
            if apply.selector.is_empty() {
                return Err(EngineError::Config(format!(
                    "'rule->apply->selector' not set (rule {}[{}]/apply [{}])",
                    rule.name,
                    i + 1,
                    j + 1
                )));
            }
            if apply.template.is_empty() {
                return Err(EngineError::Config(format!(
                    "'rule->apply->template' not set (rule {}[{}]/apply [{}])",
                    rule.name,
                    i + 1,
                    j + 1
                )));
            }
        }
    }
    Ok(())
}

struct BuildRule {
    id: usize,
    selector: Selector,
    tags: Tags,
    applies: Vec<RuleApply>,
}

struct RuleApply {
    id: usize,
    selector: Selector,
    tags: Tags,
    template: String,
}

/// Renders targets into configuration artifacts
pub struct BuildManager {
    rules: Vec<BuildRule>,
    templates: Handlebars<'static>,
}

impl BuildManager {
    /// Parse and compile the rule set
    pub fn new(cfg: &Config) -> Result<Self> {
        validate_config(cfg).map_err(|e| e.context("build manager config validation"))?;

        let mut templates = Handlebars::new();
        templates.set_strict_mode(true);
        funcmap::register(&mut templates);

        let mut rules = Vec::with_capacity(cfg.len());
        for (i, rule_cfg) in cfg.iter().enumerate() {
            let mut rule = BuildRule {
                id: i + 1,
                selector: Selector::parse(&rule_cfg.selector)?,
                tags: Tags::parse(&rule_cfg.tags)?,
                applies: Vec::with_capacity(rule_cfg.apply.len()),
            };
            for (j, apply_cfg) in rule_cfg.apply.iter().enumerate() {
                let name = format!("{}/{}", i + 1, j + 1);
                templates.register_template_string(&name, &apply_cfg.template)?;
                rule.applies.push(RuleApply {
                    id: j + 1,
                    selector: Selector::parse(&apply_cfg.selector)?,
                    tags: Tags::parse(&apply_cfg.tags)?,
                    template: name,
                });
            }
            rules.push(rule);
        }
        Ok(Self { rules, templates })
    }
}

impl Builder for BuildManager {
    fn build(&self, target: &dyn Target) -> Vec<Artifact> {
        let view = target.view();
        let mut artifacts = Vec::new();

        for rule in &self.rules {
            if !rule.selector.matches(target.tags()) {
                continue;
            }
            for apply in &rule.applies {
                if !apply.selector.matches(target.tags()) {
                    continue;
                }
                let conf = match self.templates.render(&apply.template, &view) {
                    Ok(out) => out,
                    Err(err) => {
                        warn!(
                            rule = rule.id,
                            apply = apply.id,
                            target = target.tuid(),
                            error = %err,
                            "failed to execute rule apply"
                        );
                        continue;
                    }
                };

                let mut tags = Tags::new();
                tags.merge(&rule.tags);
                tags.merge(&apply.tags);
                artifacts.push(Artifact {
                    conf,
                    tags,
                    stale: false,
                });
            }
        }

        if !artifacts.is_empty() {
            info!(
                count = artifacts.len(),
                target = target.tuid(),
                "built config(s) for target"
            );
        }
        artifacts
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

    /// Target with preset tags and a scripted view
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
- selector: apache
  tags: conf
  apply:
    - selector: apache
      tags: local
      template: 'apache {{Address}}'
"#;

    #[test]
    fn renders_matching_rule_into_artifact() {
        let mgr = BuildManager::new(&config(RULES)).unwrap();
        let target = ViewTarget::new(
            "apache",
            serde_json::json!({"Address": "10.0.0.5:80"}),
        );
        let artifacts = mgr.build(&target);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].conf, "apache 10.0.0.5:80");
        assert!(!artifacts[0].stale);
    }

    #[test]
    fn artifact_tags_are_rule_and_apply_union() {
        let mgr = BuildManager::new(&config(RULES)).unwrap();
        let target = ViewTarget::new("apache", serde_json::json!({"Address": "a:1"}));
        let artifacts = mgr.build(&target);
        assert_eq!(artifacts[0].tags.to_string(), "{conf, local}");
    }

    #[test]
    fn non_matching_target_builds_nothing() {
        let mgr = BuildManager::new(&config(RULES)).unwrap();
        let target = ViewTarget::new("nginx", serde_json::json!({"Address": "a:1"}));
        assert!(mgr.build(&target).is_empty());
    }

    #[test]
    fn render_error_skips_only_that_apply() {
        let mgr = BuildManager::new(&config(
            r#"
- selector: '*'
  tags: conf
  apply:
    - selector: '*'
      template: 'bad {{MissingField}}'
    - selector: '*'
      template: 'good {{Address}}'
"#,
        ))
        .unwrap();
        let target = ViewTarget::new("", serde_json::json!({"Address": "a:1"}));
        let artifacts = mgr.build(&target);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].conf, "good a:1");
    }

    #[test]
    fn rejects_missing_mandatory_fields() {
        for yaml in [
            "- tags: t\n  apply: [{selector: s, template: x}]",
            "- selector: s\n  apply: [{selector: s, template: x}]",
            "- selector: s\n  tags: t",
            "- selector: s\n  tags: t\n  apply: [{template: x}]",
            "- selector: s\n  tags: t\n  apply: [{selector: s}]",
        ] {
            assert!(BuildManager::new(&config(yaml)).is_err(), "yaml {yaml:?}");
        }
    }
}
