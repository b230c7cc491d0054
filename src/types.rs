//! Core data types for the documentation cache and learning loop

use crate::error::{DoclensError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

static CACHE_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9:._-]+$").expect("static regex"));

/// Sections served when no rule applies at all
pub const FALLBACK_SECTIONS: [&str; 2] = ["overview", "example"];

/// Token budget when no rule applies at all
pub const FALLBACK_MAX_TOKENS: i64 = 2000;

/// Word-count approximation of a token count
pub fn token_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

/// Convert stored unix seconds back into a timestamp
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Sanitized cache key, `framework` or `framework:component`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from classifier output
    pub fn new(framework: &str, component: Option<&str>) -> Result<Self> {
        let framework = framework.trim().to_lowercase();
        let raw = match component.map(str::trim).filter(|c| !c.is_empty()) {
            Some(component) => format!("{}:{}", framework, component.to_lowercase()),
            None => framework,
        };
        Self::parse(&raw)
    }

    /// Validate a raw key string
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(DoclensError::InvalidCacheKey("empty key".to_string()));
        }
        if raw.contains("..") || raw.starts_with('/') {
            return Err(DoclensError::InvalidCacheKey(format!(
                "path traversal in '{}'",
                raw
            )));
        }
        if !CACHE_KEY_PATTERN.is_match(raw) {
            return Err(DoclensError::InvalidCacheKey(format!(
                "illegal characters in '{}'",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn framework(&self) -> &str {
        framework_of(&self.0)
    }

    pub fn component(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, c)| c)
    }
}

/// Framework prefix of any key-shaped string
pub fn framework_of(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = DoclensError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Ordered mapping of section name to section text
///
/// Serializes as a JSON object in insertion order. Deserialization rejects
/// anything that is not an object of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sections(Vec<(String, String)>);

impl Sections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the original position on replace
    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        let name = name.into();
        let text = text.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = text,
            None => self.0.push((name, text)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.as_str())
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, t)| (n.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Sections {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut sections = Sections::new();
        for (k, v) in iter {
            sections.insert(k, v);
        }
        sections
    }
}

impl Serialize for Sections {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, text) in &self.0 {
            map.serialize_entry(name, text)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Sections {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SectionsVisitor;

        impl<'de> Visitor<'de> for SectionsVisitor {
            type Value = Sections;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of section name to text")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Sections, A::Error> {
                let mut sections = Sections::new();
                while let Some((name, text)) = access.next_entry::<String, String>()? {
                    sections.insert(name, text);
                }
                Ok(sections)
            }
        }

        deserializer.deserialize_map(SectionsVisitor)
    }
}

/// A cached documentation entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: CacheKey,
    pub framework: String,
    pub component: Option<String>,
    pub full_content: String,
    pub sections: Sections,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A/B test arm a delivery was served under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Control,
    Test,
}

impl Arm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arm::Control => "control",
            Arm::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "control" => Some(Arm::Control),
            "test" => Some(Arm::Test),
            _ => None,
        }
    }
}

/// A delivery to be appended to the ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    pub session_id: String,
    pub cache_key: String,
    pub operation_type: String,
    pub sections_provided: Vec<String>,
    pub tokens_used: i64,
    pub tool_name: String,
    pub tool_input: String,
    pub file_path: Option<String>,
    pub experiment: Option<(String, Arm)>,
}

/// One delivery event plus its outcome and analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub log_id: i64,
    pub session_id: String,
    pub cache_key: String,
    pub operation_type: String,
    pub sections_provided: Vec<String>,
    pub tokens_used: i64,
    pub tool_name: String,
    pub tool_input: String,
    pub file_path: Option<String>,
    pub timestamp: DateTime<Utc>,

    pub session_complete: Option<bool>,
    pub follow_up_actions: Option<Vec<String>>,

    pub effectiveness_score: Option<f64>,
    pub effectiveness_reason: Option<String>,
    pub confidence_score: Option<f64>,
    pub analyzed_at: Option<DateTime<Utc>>,

    pub experiment_id: Option<String>,
    pub experiment_arm: Option<Arm>,
}

impl SessionRecord {
    pub fn framework(&self) -> &str {
        framework_of(&self.cache_key)
    }

    pub fn is_analyzed(&self) -> bool {
        self.analyzed_at.is_some()
    }
}

/// Provenance recorded on learned rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningMetadata {
    pub confidence: f64,
    pub based_on_sessions: i64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub pattern_enhanced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_test_winner: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedOperation {
    pub next_operation: String,
    pub confidence: f64,
    pub priority: String,
}

/// Hints copied into a rule from sequence analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternHints {
    #[serde(default)]
    pub predicted_next_operations: Vec<PredictedOperation>,
    #[serde(default)]
    pub high_effectiveness_context: bool,
    #[serde(default = "default_priority")]
    pub preload_priority: String,
}

fn default_priority() -> String {
    "medium".to_string()
}

/// Section list plus token budget for one (framework, operation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub sections: Vec<String>,
    pub max_tokens: i64,
    #[serde(
        rename = "_learning_metadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub metadata: Option<LearningMetadata>,
    #[serde(
        rename = "_pattern_data",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pattern: Option<PatternHints>,
}

impl ExtractionRule {
    pub fn new(sections: &[&str], max_tokens: i64) -> Self {
        Self {
            sections: sections.iter().map(|s| s.to_string()).collect(),
            max_tokens,
            metadata: None,
            pattern: None,
        }
    }

    pub fn fallback() -> Self {
        Self::new(&FALLBACK_SECTIONS, FALLBACK_MAX_TOKENS)
    }

    pub fn confidence(&self) -> Option<f64> {
        self.metadata.as_ref().map(|m| m.confidence)
    }

    pub fn based_on_sessions(&self) -> i64 {
        self.metadata.as_ref().map_or(0, |m| m.based_on_sessions)
    }
}

/// A derived rule awaiting validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRule {
    pub framework: String,
    pub operation: String,
    pub rule: ExtractionRule,
}

/// Name of the reserved fallback rule key
pub const DEFAULTS_KEY: &str = "defaults";

/// The rule document: `{ defaults: rule, <framework>: { <op>: rule } }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct RuleSet {
    pub defaults: Option<ExtractionRule>,
    pub frameworks: BTreeMap<String, BTreeMap<String, ExtractionRule>>,
}

impl RuleSet {
    /// Minimal rule set written when no rule file exists
    pub fn starter() -> Self {
        let mut set = RuleSet {
            defaults: Some(ExtractionRule::new(&["overview", "example", "usage"], 2000)),
            frameworks: BTreeMap::new(),
        };
        set.set(
            "react",
            "create",
            ExtractionRule::new(&["components", "hooks", "example"], 2500),
        );
        set.set(
            "react",
            "style",
            ExtractionRule::new(&["styling", "css", "example"], 2000),
        );
        set
    }

    pub fn get(&self, framework: &str, operation: &str) -> Option<&ExtractionRule> {
        self.frameworks.get(framework)?.get(operation)
    }

    pub fn set(&mut self, framework: &str, operation: &str, rule: ExtractionRule) {
        self.frameworks
            .entry(framework.to_string())
            .or_default()
            .insert(operation.to_string(), rule);
    }

    /// Resolve the rule to serve: specific rule, framework defaults,
    /// global defaults, then the built-in fallback
    pub fn lookup(&self, framework: &str, operation: &str) -> ExtractionRule {
        let per_framework = self.frameworks.get(framework);
        per_framework
            .and_then(|ops| ops.get(operation))
            .or_else(|| per_framework.and_then(|ops| ops.get(DEFAULTS_KEY)))
            .or(self.defaults.as_ref())
            .cloned()
            .unwrap_or_else(ExtractionRule::fallback)
    }

    /// Every (framework, operation, rule), defaults excluded
    pub fn rules(&self) -> impl Iterator<Item = (&str, &str, &ExtractionRule)> {
        self.frameworks.iter().flat_map(|(fw, ops)| {
            ops.iter()
                .map(move |(op, rule)| (fw.as_str(), op.as_str(), rule))
        })
    }
}

impl TryFrom<Value> for RuleSet {
    type Error = DoclensError;

    fn try_from(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(DoclensError::corruption("rule set", "document is not an object"));
        };

        let mut set = RuleSet::default();
        for (key, value) in map {
            if key == DEFAULTS_KEY {
                let rule = serde_json::from_value(value)
                    .map_err(|e| DoclensError::corruption("rule set", format!("defaults: {}", e)))?;
                set.defaults = Some(rule);
                continue;
            }

            let Value::Object(ops) = value else {
                return Err(DoclensError::corruption(
                    "rule set",
                    format!("framework '{}' is not an object", key),
                ));
            };
            for (op, rule) in ops {
                let rule = serde_json::from_value(rule).map_err(|e| {
                    DoclensError::corruption("rule set", format!("{}:{}: {}", key, op, e))
                })?;
                set.set(&key, &op, rule);
            }
        }
        Ok(set)
    }
}

impl From<RuleSet> for Value {
    fn from(set: RuleSet) -> Self {
        let mut map = Map::new();
        if let Some(defaults) = set.defaults {
            map.insert(
                DEFAULTS_KEY.to_string(),
                serde_json::to_value(defaults).unwrap_or(Value::Null),
            );
        }
        for (fw, ops) in set.frameworks {
            let ops: Map<String, Value> = ops
                .into_iter()
                .map(|(op, rule)| (op, serde_json::to_value(rule).unwrap_or(Value::Null)))
                .collect();
            map.insert(fw, Value::Object(ops));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_forms() {
        let key = CacheKey::new("React", Some("Button")).unwrap();
        assert_eq!(key.as_str(), "react:button");
        assert_eq!(key.framework(), "react");
        assert_eq!(key.component(), Some("button"));

        let bare = CacheKey::new("vue", None).unwrap();
        assert_eq!(bare.as_str(), "vue");
        assert_eq!(bare.component(), None);
    }

    #[test]
    fn test_cache_key_rejects_traversal() {
        assert!(CacheKey::parse("../etc/passwd").is_err());
        assert!(CacheKey::parse("/react").is_err());
        assert!(CacheKey::parse("react button").is_err());
        assert!(CacheKey::parse("").is_err());
        assert!(CacheKey::parse("next.js:app-router_v2").is_ok());
    }

    #[test]
    fn test_sections_keep_order() {
        let sections: Sections = vec![("zeta", "z"), ("alpha", "a"), ("mid", "m")]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&sections).unwrap();
        assert_eq!(json, r#"{"zeta":"z","alpha":"a","mid":"m"}"#);

        let back: Sections = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sections);
        assert_eq!(back.names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_sections_reject_non_mapping() {
        assert!(serde_json::from_str::<Sections>("null").is_err());
        assert!(serde_json::from_str::<Sections>(r#"["a","b"]"#).is_err());
        assert!(serde_json::from_str::<Sections>(r#"{"a":1}"#).is_err());
    }

    #[test]
    fn test_rule_lookup_order() {
        let mut set = RuleSet::starter();
        set.set("react", "defaults", ExtractionRule::new(&["api"], 1200));

        assert_eq!(set.lookup("react", "create").max_tokens, 2500);
        assert_eq!(set.lookup("react", "debug").sections, vec!["api"]);
        assert_eq!(set.lookup("vue", "create").max_tokens, 2000);

        let empty = RuleSet::default();
        assert_eq!(empty.lookup("vue", "create"), ExtractionRule::fallback());
    }

    #[test]
    fn test_rule_set_json_shape() {
        let json = serde_json::json!({
            "defaults": {"sections": ["overview"], "max_tokens": 1500},
            "react": {
                "create": {
                    "sections": ["hooks", "example"],
                    "max_tokens": 1800,
                    "_learning_metadata": {
                        "confidence": 0.82,
                        "based_on_sessions": 12,
                        "last_updated": "2024-01-01T00:00:00Z"
                    }
                }
            }
        });

        let set = RuleSet::try_from(json.clone()).unwrap();
        let rule = set.get("react", "create").unwrap();
        assert_eq!(rule.confidence(), Some(0.82));
        assert_eq!(rule.based_on_sessions(), 12);

        let back = Value::from(set);
        assert_eq!(back["react"]["create"]["max_tokens"], 1800);
        assert_eq!(back["defaults"]["sections"][0], "overview");
    }

    #[test]
    fn test_rule_set_rejects_bad_shape() {
        let err = RuleSet::try_from(serde_json::json!({"react": [1, 2]})).unwrap_err();
        assert!(err.is_corruption());

        let err = RuleSet::try_from(serde_json::json!({"react": {"create": {"max_tokens": 5}}}))
            .unwrap_err();
        assert!(err.to_string().contains("react:create"));
    }

    #[test]
    fn test_token_count_is_word_count() {
        assert_eq!(token_count("useState  lets\nyou add state"), 5);
        assert_eq!(token_count(""), 0);
    }
}
