//! Template helpers shared by the tag and build managers
//!
//! All helpers are pure. `regexp` keeps a process-wide cache of compiled
//! patterns so rules that probe the same expression against thousands of
//! targets compile it once.

use std::collections::HashMap;
use std::sync::OnceLock;

use handlebars::{Handlebars, handlebars_helper};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value as Json;

/// Register every helper on a template registry
pub fn register(hb: &mut Handlebars<'_>) {
    hb.register_helper("glob", Box::new(glob));
    hb.register_helper("regexp", Box::new(regexp));
    hb.register_helper("eqAny", Box::new(eq_any));
    hb.register_helper("equal", Box::new(equal));
    hb.register_helper("hasKey", Box::new(has_key));
}

handlebars_helper!(glob: |value: str, pattern: str, *args| {
    glob_matches(value, pattern)
        || args.iter().any(|p| p.as_str().is_some_and(|p| glob_matches(value, p)))
});

handlebars_helper!(regexp: |value: str, pattern: str, *args| {
    regex_matches(value, pattern)
        || args.iter().any(|p| p.as_str().is_some_and(|p| regex_matches(value, p)))
});

handlebars_helper!(eq_any: |value: str, patterns: str| {
    patterns.split_whitespace().any(|p| p == value)
});

handlebars_helper!(equal: |value: str, candidate: str, *args| {
    value == candidate || args.iter().any(|c| c.as_str() == Some(value))
});

handlebars_helper!(has_key: |map: Json, key: str| {
    map.as_object().is_some_and(|m| m.contains_key(key))
});

fn glob_matches(value: &str, pattern: &str) -> bool {
    ::glob::Pattern::new(pattern).is_ok_and(|p| p.matches(value))
}

fn regex_matches(value: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let store = regex_store().lock();
    if let Some(cached) = store.get(pattern) {
        return cached.as_ref().is_some_and(|r| r.is_match(value));
    }
    drop(store);

    let compiled = Regex::new(pattern).ok();
    let matched = compiled.as_ref().is_some_and(|r| r.is_match(value));
    regex_store().lock().insert(pattern.to_string(), compiled);
    matched
}

fn regex_store() -> &'static Mutex<HashMap<String, Option<Regex>>> {
    static STORE: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(template: &str, data: &Json) -> String {
        let mut hb = Handlebars::new();
        register(&mut hb);
        hb.render_template(template, data).unwrap()
    }

    #[test]
    fn glob_matches_any_pattern() {
        let data = json!({"Image": "nginx:1.25"});
        assert_eq!(render(r#"{{glob Image "redis*" "nginx*"}}"#, &data), "true");
        assert_eq!(render(r#"{{glob Image "redis*"}}"#, &data), "false");
    }

    #[test]
    fn glob_invalid_pattern_is_no_match() {
        let data = json!({"Image": "nginx"});
        assert_eq!(render(r#"{{glob Image "[unclosed"}}"#, &data), "false");
    }

    #[test]
    fn regexp_matches_any_pattern() {
        let data = json!({"Name": "web-7f9c"});
        assert_eq!(render(r#"{{regexp Name "^db-" "^web-"}}"#, &data), "true");
        assert_eq!(render(r#"{{regexp Name "^db-"}}"#, &data), "false");
    }

    #[test]
    fn regexp_bad_pattern_is_no_match() {
        let data = json!({"Name": "web"});
        assert_eq!(render(r#"{{regexp Name "("}}"#, &data), "false");
        // second render hits the cached failure
        assert_eq!(render(r#"{{regexp Name "("}}"#, &data), "false");
    }

    #[test]
    fn eq_any_splits_on_whitespace() {
        let data = json!({"PortNumber": "8080"});
        assert_eq!(
            render(r#"{{eqAny PortNumber "80 8080 8888"}}"#, &data),
            "true"
        );
        assert_eq!(render(r#"{{eqAny PortNumber "80 443"}}"#, &data), "false");
    }

    #[test]
    fn equal_compares_each_candidate() {
        let data = json!({"PortProtocol": "TCP"});
        assert_eq!(
            render(r#"{{equal PortProtocol "UDP" "TCP"}}"#, &data),
            "true"
        );
        assert_eq!(render(r#"{{equal PortProtocol "UDP"}}"#, &data), "false");
    }

    #[test]
    fn has_key_checks_map_membership() {
        let data = json!({"Labels": {"app": "web"}});
        assert_eq!(render(r#"{{hasKey Labels "app"}}"#, &data), "true");
        assert_eq!(render(r#"{{hasKey Labels "tier"}}"#, &data), "false");
    }

    #[test]
    fn has_key_on_non_map_is_false() {
        let data = json!({"Name": "web"});
        assert_eq!(render(r#"{{hasKey Name "app"}}"#, &data), "false");
    }
}
