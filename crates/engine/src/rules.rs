//! Watcher and cache rule compilation.
//!
//! Rule values come straight out of plugin manifests and are untrusted.
//! Compilation fails closed: anything that is not `true` or a non-empty
//! array of usable strings becomes `Never`. Compiling is deterministic and
//! side-effect-free, so rules can be rebuilt on every reload.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Compiled predicate over request URLs.
#[derive(Debug, Clone, Default)]
pub enum UrlMatcher {
    #[default]
    Never,
    Always,
    Patterns(Vec<Regex>),
}

impl UrlMatcher {
    /// Coerce a raw rule value. Array entries are regular expressions;
    /// non-strings, empty strings, and unparsable patterns are dropped.
    pub fn compile(raw: &Value) -> Self {
        match raw {
            Value::Bool(true) => UrlMatcher::Always,
            Value::Array(entries) => {
                let patterns: Vec<Regex> = entries
                    .iter()
                    .filter_map(|e| e.as_str())
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| match Regex::new(s) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!(pattern = s, error = %e, "Dropping unparsable URL rule");
                            None
                        }
                    })
                    .collect();
                if patterns.is_empty() {
                    UrlMatcher::Never
                } else {
                    UrlMatcher::Patterns(patterns)
                }
            }
            _ => UrlMatcher::Never,
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            UrlMatcher::Never => false,
            UrlMatcher::Always => true,
            UrlMatcher::Patterns(patterns) => patterns.iter().any(|p| p.is_match(url)),
        }
    }
}

/// Compiled predicate over header names. Names are matched lower-cased.
#[derive(Debug, Clone, Default)]
pub enum HeaderMatcher {
    #[default]
    Never,
    Always,
    Names(Vec<String>),
}

impl HeaderMatcher {
    /// Coerce a raw rule value. Array entries are plain header names,
    /// lower-cased; no pattern compilation.
    pub fn compile(raw: &Value) -> Self {
        match raw {
            Value::Bool(true) => HeaderMatcher::Always,
            Value::Array(entries) => {
                let names: Vec<String> = entries
                    .iter()
                    .filter_map(|e| e.as_str())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_lowercase())
                    .collect();
                if names.is_empty() {
                    HeaderMatcher::Never
                } else {
                    HeaderMatcher::Names(names)
                }
            }
            _ => HeaderMatcher::Never,
        }
    }

    /// `name` must already be lower-cased.
    pub fn allows(&self, name: &str) -> bool {
        match self {
            HeaderMatcher::Never => false,
            HeaderMatcher::Always => true,
            HeaderMatcher::Names(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Which traffic gets reported to observers.
#[derive(Debug, Clone, Default)]
pub struct WatcherRules {
    pub request: UrlMatcher,
    pub response: UrlMatcher,
    pub headers: HeaderMatcher,
}

impl WatcherRules {
    /// Merge the defaults (match nothing) with a raw
    /// `networkWatcherRules` value.
    pub fn from_value(raw: Option<&Value>) -> Self {
        let mut rules = WatcherRules::default();
        if let Some(Value::Object(map)) = raw {
            if let Some(v) = map.get("request") {
                rules.request = UrlMatcher::compile(v);
            }
            if let Some(v) = map.get("response") {
                rules.response = UrlMatcher::compile(v);
            }
            if let Some(v) = map.get("headers") {
                rules.headers = HeaderMatcher::compile(v);
            }
        }
        rules
    }
}

/// Which request methods are eligible for caching, and for which URLs.
#[derive(Debug, Clone)]
pub struct CacheRules {
    methods: HashMap<String, UrlMatcher>,
}

impl Default for CacheRules {
    fn default() -> Self {
        let mut methods = HashMap::new();
        methods.insert("GET".to_string(), UrlMatcher::Always);
        methods.insert("POST".to_string(), UrlMatcher::Never);
        Self { methods }
    }
}

impl CacheRules {
    /// Merge the defaults (GET always, POST never) with a raw
    /// `networkCacheRules` value: an object mapping method names to rule
    /// values. Method names are matched case-insensitively.
    pub fn from_value(raw: Option<&Value>) -> Self {
        let mut rules = Self::default();
        if let Some(Value::Object(map)) = raw {
            for (method, value) in map {
                rules
                    .methods
                    .insert(method.to_uppercase(), UrlMatcher::compile(value));
            }
        }
        rules
    }

    pub fn method_matcher(&self, method: &str) -> &UrlMatcher {
        self.methods
            .get(&method.to_uppercase())
            .unwrap_or(&UrlMatcher::Never)
    }

    pub fn allows(&self, method: &str, url: &str) -> bool {
        self.method_matcher(method).matches(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_rules_fail_closed() {
        // Everything that is not `true` or a usable pattern list is Never
        for raw in [
            json!(false),
            json!(null),
            json!("string"),
            json!(42),
            json!({}),
            json!([]),
            json!([1, 2, 3]),
            json!(["", ""]),
            json!(["("]), // unparsable regex
        ] {
            assert!(
                matches!(UrlMatcher::compile(&raw), UrlMatcher::Never),
                "expected Never for {}",
                raw
            );
        }

        assert!(matches!(UrlMatcher::compile(&json!(true)), UrlMatcher::Always));
    }

    #[test]
    fn test_url_rules_keep_usable_patterns() {
        let matcher = UrlMatcher::compile(&json!(["api/v[0-9]+", 7, "", "assets"]));
        match &matcher {
            UrlMatcher::Patterns(patterns) => assert_eq!(patterns.len(), 2),
            other => panic!("expected patterns, got {:?}", other),
        }
        assert!(matcher.matches("https://x/api/v2/items"));
        assert!(matcher.matches("https://x/assets/app.js"));
        assert!(!matcher.matches("https://x/index.html"));
    }

    #[test]
    fn test_header_rules_lower_case_names() {
        let matcher = HeaderMatcher::compile(&json!(["Content-Type", "X-Token"]));
        assert!(matcher.allows("content-type"));
        assert!(matcher.allows("x-token"));
        assert!(!matcher.allows("authorization"));

        assert!(matches!(
            HeaderMatcher::compile(&json!("content-type")),
            HeaderMatcher::Never
        ));
    }

    #[test]
    fn test_watcher_rules_defaults_to_never() {
        let rules = WatcherRules::from_value(None);
        assert!(!rules.request.matches("https://x/y"));
        assert!(!rules.response.matches("https://x/y"));
        assert!(!rules.headers.allows("content-type"));

        let rules = WatcherRules::from_value(Some(&json!({ "request": true })));
        assert!(rules.request.matches("https://x/y"));
        assert!(!rules.response.matches("https://x/y"));
    }

    #[test]
    fn test_cache_rules_defaults() {
        let rules = CacheRules::default();
        assert!(rules.allows("GET", "https://x/y"));
        assert!(rules.allows("get", "https://x/y"));
        assert!(!rules.allows("POST", "https://x/y"));
        assert!(!rules.allows("PUT", "https://x/y"));
    }

    #[test]
    fn test_cache_rules_overrides() {
        let rules = CacheRules::from_value(Some(&json!({
            "get": ["assets"],
            "POST": true
        })));
        assert!(rules.allows("GET", "https://x/assets/app.js"));
        assert!(!rules.allows("GET", "https://x/api/items"));
        assert!(rules.allows("POST", "https://x/anything"));
    }
}
