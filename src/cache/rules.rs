//! Cache rule evaluation
//!
//! Rules are an ordered list. The first rule whose pattern, method set and
//! conditions all match decides cacheability and TTL; there is no
//! most-specific scoring. With no match the engine-wide defaults apply.
//!
//! ## Rule file format
//!
//! ```json
//! [
//!   { "pattern": "*/health*", "ttl_seconds": 30 },
//!   { "pattern": "*/admin/*", "enabled": false },
//!   {
//!     "pattern": "*/api/*",
//!     "methods": ["GET", "POST"],
//!     "ttl_seconds": 300,
//!     "conditions": { "status_codes": [200], "max_size": 1048576 }
//!   }
//! ]
//! ```

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::entry::Headers;
use super::error::CacheError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Optional conditions narrowing a rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    /// Request headers that must be present with exactly these values
    #[serde(default)]
    pub required_headers: BTreeMap<String, String>,
    /// Allowed response statuses (set-path only)
    #[serde(default)]
    pub status_codes: Option<Vec<u16>>,
    /// Minimum payload size in bytes
    #[serde(default)]
    pub min_size: Option<u64>,
    /// Maximum payload size in bytes
    #[serde(default)]
    pub max_size: Option<u64>,
}

/// A pattern-based cache policy entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRule {
    /// Glob matched case-insensitively against the full target URL
    pub pattern: String,
    /// Methods this rule applies to (absent = any)
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    /// TTL override
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: RuleConditions,
}

fn default_enabled() -> bool {
    true
}

impl CacheRule {
    /// Rule matching `pattern` for any method with default settings
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            methods: None,
            ttl_seconds: None,
            enabled: true,
            conditions: RuleConditions::default(),
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = Some(methods.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Rule list that behaves like the method-list fallback except that only
    /// 2xx responses are stored: a 2xx rule for `methods`, then a disabled
    /// catch-all.
    pub fn success_only(methods: &[String]) -> Vec<CacheRule> {
        let mut store = CacheRule::new("*");
        store.methods = Some(methods.to_vec());
        store.conditions.status_codes = Some((200..300).collect());
        vec![store, CacheRule::new("*").disabled()]
    }

    /// Whether a payload of `size` bytes satisfies the size bounds
    pub fn allows_size(&self, size: u64) -> bool {
        let min_ok = self.conditions.min_size.map(|min| size >= min).unwrap_or(true);
        let max_ok = self.conditions.max_size.map(|max| size <= max).unwrap_or(true);
        min_ok && max_ok
    }
}

/// Rule with its glob compiled once
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: CacheRule,
    pattern: Pattern,
}

impl CompiledRule {
    fn compile(rule: CacheRule) -> Result<Self, CacheError> {
        let pattern = Pattern::new(&rule.pattern).map_err(|e| CacheError::InvalidRule {
            pattern: rule.pattern.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { rule, pattern })
    }

    fn matches(&self, method: &str, url: &str, headers: &Headers, status: Option<u16>) -> bool {
        if let Some(ref methods) = self.rule.methods {
            if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
                return false;
            }
        }

        if !self.pattern.matches_with(url, MATCH_OPTIONS) {
            return false;
        }

        let headers_ok = self
            .rule
            .conditions
            .required_headers
            .iter()
            .all(|(name, expected)| {
                headers
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case(name) && v == expected)
            });
        if !headers_ok {
            return false;
        }

        match (status, &self.rule.conditions.status_codes) {
            (Some(code), Some(allowed)) => allowed.contains(&code),
            _ => true,
        }
    }
}

/// Engine-wide defaults used when no rule matches
#[derive(Debug, Clone)]
pub struct RuleDefaults {
    pub default_ttl_seconds: u64,
    pub cacheable_methods: Vec<String>,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            cacheable_methods: vec!["GET".to_string(), "HEAD".to_string()],
        }
    }
}

/// Ordered, first-match-wins rule evaluator.
///
/// The rule list is read on every request and replaced rarely, so readers
/// clone an `Arc` snapshot under a short read lock.
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<CompiledRule>>>,
    defaults: RuleDefaults,
}

impl RuleEngine {
    /// Compile `rules`; an invalid glob rejects the whole list
    pub fn new(rules: Vec<CacheRule>, defaults: RuleDefaults) -> Result<Self, CacheError> {
        let compiled = Self::compile_all(rules)?;
        Ok(Self {
            rules: RwLock::new(Arc::new(compiled)),
            defaults,
        })
    }

    /// Engine with no rules (defaults only)
    pub fn with_defaults(defaults: RuleDefaults) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            defaults,
        }
    }

    fn compile_all(rules: Vec<CacheRule>) -> Result<Vec<CompiledRule>, CacheError> {
        rules.into_iter().map(CompiledRule::compile).collect()
    }

    /// Atomically replace the rule list
    pub fn set_rules(&self, rules: Vec<CacheRule>) -> Result<(), CacheError> {
        let compiled = Arc::new(Self::compile_all(rules)?);
        let mut guard = self.rules.write().unwrap_or_else(|e| e.into_inner());
        *guard = compiled;
        Ok(())
    }

    /// Current rules in evaluation order
    pub fn rules(&self) -> Vec<CacheRule> {
        self.snapshot().iter().map(|c| c.rule.clone()).collect()
    }

    pub fn defaults(&self) -> &RuleDefaults {
        &self.defaults
    }

    fn snapshot(&self) -> Arc<Vec<CompiledRule>> {
        Arc::clone(&self.rules.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// First rule satisfied by the request (and response status, on the set path)
    pub fn matching_rule(
        &self,
        method: &str,
        url: &str,
        headers: &Headers,
        status: Option<u16>,
    ) -> Option<CacheRule> {
        self.snapshot()
            .iter()
            .find(|c| c.matches(method, url, headers, status))
            .map(|c| c.rule.clone())
    }

    /// Matched rule's `enabled` flag, else default-method membership
    pub fn is_cacheable(
        &self,
        method: &str,
        url: &str,
        headers: &Headers,
        status: Option<u16>,
    ) -> bool {
        match self.matching_rule(method, url, headers, status) {
            Some(rule) => rule.enabled,
            None => self.method_cacheable_by_default(method),
        }
    }

    /// Matched rule's TTL override, else the engine default
    pub fn ttl_for(&self, method: &str, url: &str, headers: &Headers, status: Option<u16>) -> u64 {
        self.matching_rule(method, url, headers, status)
            .and_then(|rule| rule.ttl_seconds)
            .unwrap_or(self.defaults.default_ttl_seconds)
    }

    /// Resolve rule, cacheability and TTL in one pass
    pub fn evaluate(
        &self,
        method: &str,
        url: &str,
        headers: &Headers,
        status: Option<u16>,
    ) -> RuleDecision {
        let rule = self.matching_rule(method, url, headers, status);
        let cacheable = match &rule {
            Some(r) => r.enabled,
            None => self.method_cacheable_by_default(method),
        };
        let ttl_seconds = rule
            .as_ref()
            .and_then(|r| r.ttl_seconds)
            .unwrap_or(self.defaults.default_ttl_seconds);
        RuleDecision {
            rule,
            cacheable,
            ttl_seconds,
        }
    }

    fn method_cacheable_by_default(&self, method: &str) -> bool {
        self.defaults
            .cacheable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Outcome of rule evaluation for one request
#[derive(Debug, Clone)]
pub struct RuleDecision {
    pub rule: Option<CacheRule>,
    pub cacheable: bool,
    pub ttl_seconds: u64,
}

impl RuleDecision {
    /// Size bounds from the matched rule (unbounded without one)
    pub fn allows_size(&self, size: u64) -> bool {
        self.rule.as_ref().map(|r| r.allows_size(size)).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rules: Vec<CacheRule>) -> RuleEngine {
        RuleEngine::new(rules, RuleDefaults::default()).unwrap()
    }

    #[test]
    fn test_rule_defaults_from_json() {
        let rule: CacheRule = serde_json::from_str(r#"{"pattern": "*/api/*"}"#).unwrap();
        assert!(rule.enabled);
        assert!(rule.methods.is_none());
        assert!(rule.ttl_seconds.is_none());
        assert_eq!(rule.conditions, RuleConditions::default());
    }

    #[test]
    fn test_first_match_wins() {
        let engine = engine(vec![
            CacheRule::new("*/health*").with_ttl(30),
            CacheRule::new("*").with_ttl(300),
        ]);
        let h = Headers::new();
        assert_eq!(engine.ttl_for("GET", "/api/health/live", &h, None), 30);
        assert_eq!(engine.ttl_for("GET", "/api/other", &h, None), 300);
    }

    #[test]
    fn test_no_match_uses_defaults() {
        let engine = engine(vec![CacheRule::new("*/only-this").with_ttl(5)]);
        let h = Headers::new();
        assert!(engine.matching_rule("GET", "/elsewhere", &h, None).is_none());
        assert_eq!(engine.ttl_for("GET", "/elsewhere", &h, None), 300);
        assert!(engine.is_cacheable("GET", "/elsewhere", &h, None));
        assert!(!engine.is_cacheable("POST", "/elsewhere", &h, None));
    }

    #[test]
    fn test_success_only_rules() {
        let methods = vec!["GET".to_string(), "HEAD".to_string()];
        let engine = engine(CacheRule::success_only(&methods));
        let h = Headers::new();

        assert!(engine.is_cacheable("GET", "/api/items", &h, None));
        assert!(engine.is_cacheable("GET", "/api/items", &h, Some(200)));
        assert!(engine.is_cacheable("HEAD", "/api/items", &h, Some(204)));
        assert!(!engine.is_cacheable("GET", "/api/items", &h, Some(503)));
        assert!(!engine.is_cacheable("GET", "/api/items", &h, Some(404)));
        assert!(!engine.is_cacheable("POST", "/api/items", &h, None));
        assert_eq!(engine.ttl_for("GET", "/api/items", &h, Some(200)), 300);
    }

    #[test]
    fn test_disabled_rule_blocks_caching() {
        let engine = engine(vec![CacheRule::new("*/admin/*").disabled()]);
        let h = Headers::new();
        assert!(!engine.is_cacheable("GET", "/admin/users", &h, None));
        assert!(engine.is_cacheable("GET", "/public/users", &h, None));
    }

    #[test]
    fn test_rule_enables_non_default_method() {
        let engine = engine(vec![CacheRule::new("*/search").with_methods(&["POST"])]);
        let h = Headers::new();
        assert!(engine.is_cacheable("post", "/api/search", &h, None));
        // Method mismatch falls through to defaults
        assert!(engine.is_cacheable("GET", "/api/search", &h, None));
        assert!(!engine.is_cacheable("DELETE", "/api/search", &h, None));
    }

    #[test]
    fn test_pattern_case_insensitive() {
        let engine = engine(vec![CacheRule::new("*/API/*").with_ttl(42)]);
        assert_eq!(engine.ttl_for("GET", "/api/things", &Headers::new(), None), 42);
    }

    #[test]
    fn test_required_headers() {
        let mut rule = CacheRule::new("*").with_ttl(10);
        rule.conditions
            .required_headers
            .insert("x-cache".into(), "yes".into());
        let engine = engine(vec![rule]);

        let mut with = Headers::new();
        with.insert("X-Cache".into(), "yes".into());
        let mut wrong = Headers::new();
        wrong.insert("x-cache".into(), "no".into());

        assert_eq!(engine.ttl_for("GET", "/x", &with, None), 10);
        assert_eq!(engine.ttl_for("GET", "/x", &wrong, None), 300);
        assert_eq!(engine.ttl_for("GET", "/x", &Headers::new(), None), 300);
    }

    #[test]
    fn test_status_only_checked_on_set_path() {
        let mut rule = CacheRule::new("*").with_ttl(60);
        rule.conditions.status_codes = Some(vec![200]);
        let engine = engine(vec![rule]);
        let h = Headers::new();

        assert!(engine.matching_rule("GET", "/x", &h, None).is_some());
        assert!(engine.matching_rule("GET", "/x", &h, Some(200)).is_some());
        assert!(engine.matching_rule("GET", "/x", &h, Some(500)).is_none());
    }

    #[test]
    fn test_size_bounds() {
        let mut rule = CacheRule::new("*");
        rule.conditions.min_size = Some(10);
        rule.conditions.max_size = Some(100);
        assert!(!rule.allows_size(5));
        assert!(rule.allows_size(10));
        assert!(rule.allows_size(100));
        assert!(!rule.allows_size(101));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = RuleEngine::new(vec![CacheRule::new("[unclosed")], RuleDefaults::default());
        assert!(matches!(result, Err(CacheError::InvalidRule { .. })));
    }

    #[test]
    fn test_set_rules_replaces_list() {
        let engine = engine(vec![CacheRule::new("*").with_ttl(1)]);
        engine
            .set_rules(vec![CacheRule::new("*").with_ttl(2)])
            .unwrap();
        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.ttl_for("GET", "/", &Headers::new(), None), 2);
    }

    #[test]
    fn test_evaluate_combines_decision() {
        let mut rule = CacheRule::new("*/big/*").with_ttl(90);
        rule.conditions.max_size = Some(4);
        let engine = engine(vec![rule]);
        let decision = engine.evaluate("GET", "/big/file", &Headers::new(), Some(200));
        assert!(decision.cacheable);
        assert_eq!(decision.ttl_seconds, 90);
        assert!(decision.allows_size(4));
        assert!(!decision.allows_size(5));
    }
}
