//! Structural normalization of a parsed rule document

use crate::types::{LearningMetadata, PatternHints, DEFAULTS_KEY, FALLBACK_MAX_TOKENS, FALLBACK_SECTIONS};
use serde_json::{json, Map, Value};

const METADATA_KEY: &str = "_learning_metadata";
const PATTERN_KEY: &str = "_pattern_data";

fn fallback_rule() -> Value {
    json!({
        "sections": FALLBACK_SECTIONS,
        "max_tokens": FALLBACK_MAX_TOKENS,
    })
}

/// Fix one rule object in place, returning a description of every fix
fn repair_rule(label: &str, rule: &mut Map<String, Value>) -> Vec<String> {
    let mut fixes = Vec::new();

    let sections: Option<Vec<Value>> = match rule.get("sections") {
        Some(Value::Array(items)) => {
            let names: Vec<Value> = items.iter().filter(|v| v.is_string()).cloned().collect();
            (!names.is_empty()).then_some(names)
        }
        _ => None,
    };
    match sections {
        Some(names) => {
            if rule.get("sections").and_then(Value::as_array).map(Vec::len) != Some(names.len()) {
                fixes.push(format!("Dropped non-string sections in {}", label));
                rule.insert("sections".to_string(), Value::Array(names));
            }
        }
        None => {
            fixes.push(format!("Fixed missing sections in {}", label));
            rule.insert("sections".to_string(), json!(FALLBACK_SECTIONS));
        }
    }

    let budget_ok = rule
        .get("max_tokens")
        .and_then(Value::as_i64)
        .is_some_and(|t| t > 0);
    if !budget_ok {
        fixes.push(format!("Fixed invalid max_tokens in {}", label));
        rule.insert("max_tokens".to_string(), json!(FALLBACK_MAX_TOKENS));
    }

    if let Some(meta) = rule.get(METADATA_KEY) {
        if serde_json::from_value::<LearningMetadata>(meta.clone()).is_err() {
            fixes.push(format!("Dropped unreadable learning metadata in {}", label));
            rule.remove(METADATA_KEY);
        }
    }
    if let Some(hints) = rule.get(PATTERN_KEY) {
        if serde_json::from_value::<PatternHints>(hints.clone()).is_err() {
            fixes.push(format!("Dropped unreadable pattern data in {}", label));
            rule.remove(PATTERN_KEY);
        }
    }

    fixes
}

/// Normalize a rule document so it parses as a rule set
///
/// Guarantees a `defaults` rule, drops framework entries that are not
/// objects, and gives every rule a non-empty section list and a positive
/// budget. Returns one message per fix.
pub fn normalize_rule_document(document: &mut Value) -> Vec<String> {
    let mut fixes = Vec::new();
    if !document.is_object() {
        fixes.push("Replaced non-object rules document".to_string());
        *document = Value::Object(Map::new());
    }
    let Value::Object(root) = document else {
        return fixes;
    };

    match root.get_mut(DEFAULTS_KEY) {
        Some(Value::Object(rule)) => fixes.extend(repair_rule(DEFAULTS_KEY, rule)),
        Some(_) => {
            fixes.push("Replaced invalid defaults rule".to_string());
            root.insert(DEFAULTS_KEY.to_string(), fallback_rule());
        }
        None => {
            fixes.push("Added missing defaults rule".to_string());
            root.insert(DEFAULTS_KEY.to_string(), fallback_rule());
        }
    }

    let frameworks: Vec<String> = root
        .keys()
        .filter(|k| k.as_str() != DEFAULTS_KEY)
        .cloned()
        .collect();
    for framework in frameworks {
        if !root.get(&framework).is_some_and(Value::is_object) {
            fixes.push(format!("Removed invalid framework entry {}", framework));
            root.remove(&framework);
            continue;
        }
        let Some(Value::Object(ops)) = root.get_mut(&framework) else {
            continue;
        };
        for (operation, rule) in ops.iter_mut() {
            let label = format!("{}:{}", framework, operation);
            match rule {
                Value::Object(map) => fixes.extend(repair_rule(&label, map)),
                _ => {
                    fixes.push(format!("Replaced invalid rule {}", label));
                    *rule = fallback_rule();
                }
            }
        }
    }

    fixes
}
