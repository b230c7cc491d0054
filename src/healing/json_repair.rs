//! Best-effort repair of malformed JSON payloads
//!
//! Fixes are purely syntactic and applied in a fixed order, re-parsing after
//! each one. All of them track string spans (both quote styles), so text
//! inside a string value is never rewritten. This targets the small, flat
//! documents stored in the cache and rule file; it is not a general JSON
//! recovery library.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonFix {
    TrailingCommas,
    BareKeys,
    SingleQuotes,
    BalanceBrackets,
}

impl JsonFix {
    pub const ORDER: [JsonFix; 4] = [
        JsonFix::TrailingCommas,
        JsonFix::BareKeys,
        JsonFix::SingleQuotes,
        JsonFix::BalanceBrackets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JsonFix::TrailingCommas => "removed_trailing_commas",
            JsonFix::BareKeys => "quoted_keys",
            JsonFix::SingleQuotes => "single_to_double_quotes",
            JsonFix::BalanceBrackets => "balanced_brackets",
        }
    }

    fn apply(&self, input: &str) -> String {
        match self {
            JsonFix::TrailingCommas => strip_trailing_commas(input),
            JsonFix::BareKeys => quote_bare_keys(input),
            JsonFix::SingleQuotes => normalize_single_quotes(input),
            JsonFix::BalanceBrackets => balance_brackets(input),
        }
    }
}

impl fmt::Display for JsonFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successfully parsed payload and the fixes it needed
#[derive(Debug, Clone, PartialEq)]
pub struct RepairedJson {
    pub text: String,
    pub value: Value,
    pub fixes: Vec<JsonFix>,
}

impl RepairedJson {
    pub fn was_repaired(&self) -> bool {
        !self.fixes.is_empty()
    }
}

#[derive(Debug, Clone, Error)]
#[error("JSON could not be repaired (attempted: {}): {error}", fmt_fixes(.attempted))]
pub struct RepairFailure {
    pub attempted: Vec<JsonFix>,
    pub error: String,
}

fn fmt_fixes(fixes: &[JsonFix]) -> String {
    if fixes.is_empty() {
        return "none".to_string();
    }
    fixes
        .iter()
        .map(JsonFix::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse `input`, applying fixes in order until it parses
pub fn repair_json(input: &str) -> Result<RepairedJson, RepairFailure> {
    let mut text = input.trim().to_string();
    let mut error = match serde_json::from_str::<Value>(&text) {
        Ok(value) => {
            return Ok(RepairedJson {
                text,
                value,
                fixes: Vec::new(),
            })
        }
        Err(e) => e.to_string(),
    };

    let mut fixes = Vec::new();
    for fix in JsonFix::ORDER {
        let fixed = fix.apply(&text);
        if fixed == text {
            continue;
        }
        text = fixed;
        fixes.push(fix);

        match serde_json::from_str::<Value>(&text) {
            Ok(value) => return Ok(RepairedJson { text, value, fixes }),
            Err(e) => error = e.to_string(),
        }
    }

    Err(RepairFailure {
        attempted: fixes,
        error,
    })
}

/// Tracks whether the scanner is inside a string literal
#[derive(Default)]
struct StringState {
    quote: Option<char>,
    escaped: bool,
}

impl StringState {
    /// Feed one character; returns true if it belongs to a string literal
    fn feed(&mut self, c: char) -> bool {
        match self.quote {
            Some(q) => {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == q {
                    self.quote = None;
                }
                true
            }
            None if c == '"' || c == '\'' => {
                self.quote = Some(c);
                true
            }
            None => false,
        }
    }
}

fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut state = StringState::default();

    for (i, &c) in chars.iter().enumerate() {
        if state.feed(c) {
            out.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn is_key_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '-'
}

fn quote_bare_keys(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut state = StringState::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if state.feed(c) {
            out.push(c);
            i += 1;
            continue;
        }
        if !is_key_start(c) {
            out.push(c);
            i += 1;
            continue;
        }

        let start = i;
        while i < chars.len() && is_key_char(chars[i]) {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();

        let next = chars[i..].iter().find(|n| !n.is_whitespace());
        let prev = out.chars().rev().find(|p| !p.is_whitespace());
        if next == Some(&':') && matches!(prev, Some('{') | Some(',')) {
            out.push('"');
            out.push_str(&word);
            out.push('"');
        } else {
            out.push_str(&word);
        }
    }
    out
}

fn normalize_single_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    let mut in_double = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_double {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_double = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_double = true;
                out.push(c);
            }
            '\'' => {
                out.push('"');
                while let Some(inner) = chars.next() {
                    match inner {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(other) => {
                                out.push('\\');
                                out.push(other);
                            }
                            None => out.push('\\'),
                        },
                        '"' => out.push_str("\\\""),
                        '\'' => break,
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

fn balance_brackets(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut state = StringState::default();

    for c in input.chars() {
        if state.feed(c) {
            out.push(c);
            continue;
        }
        match c {
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                // Unmatched closers are dropped
                if stack.last() == Some(&c) {
                    stack.pop();
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    if let Some(q) = state.quote {
        out.push(q);
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    strip_trailing_commas(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_json_needs_no_fixes() {
        let repaired = repair_json(r#"{"a": [1, 2]}"#).unwrap();
        assert!(!repaired.was_repaired());
        assert_eq!(repaired.value["a"][1], 2);
    }

    #[test]
    fn test_mixed_damage_heals() {
        let repaired = repair_json("{name: 'react', sections: ['a','b',],}").unwrap();
        assert_eq!(
            repaired.fixes,
            vec![JsonFix::TrailingCommas, JsonFix::BareKeys, JsonFix::SingleQuotes]
        );
        assert_eq!(repaired.value["name"], "react");
        assert_eq!(repaired.value["sections"], serde_json::json!(["a", "b"]));

        let reparsed: Value = serde_json::from_str(&repaired.text).unwrap();
        assert_eq!(reparsed, repaired.value);
    }

    #[test]
    fn test_string_contents_are_untouched() {
        let repaired = repair_json(r#"{"hooks": "use it: like, this,}", example: 'it\'s "fine"'}"#)
            .unwrap();
        assert_eq!(repaired.value["hooks"], "use it: like, this,}");
        assert_eq!(repaired.value["example"], "it's \"fine\"");
    }

    #[test]
    fn test_brackets_are_balanced() {
        let repaired = repair_json(r#"{"a": {"b": [1, 2"#).unwrap();
        assert_eq!(repaired.fixes, vec![JsonFix::BalanceBrackets]);
        assert_eq!(repaired.value["a"]["b"][1], 2);

        let extra = repair_json(r#"{"a": 1}}]"#).unwrap();
        assert_eq!(extra.value["a"], 1);

        let dangling = repair_json(r#"{"overview": "text", "#).unwrap();
        assert_eq!(dangling.value["overview"], "text");
    }

    #[test]
    fn test_unrepairable_lists_attempts() {
        let err = repair_json("{a: 'x' 'y'}").unwrap_err();
        assert!(err.attempted.contains(&JsonFix::BareKeys));
        assert!(err.attempted.contains(&JsonFix::SingleQuotes));
        assert!(err.to_string().contains("quoted_keys"));

        let err = repair_json("not json at all").unwrap_err();
        assert!(err.to_string().contains("could not be repaired"));
    }

    proptest! {
        #[test]
        fn prop_repair_never_panics(input in ".{0,200}") {
            let _ = repair_json(&input);
        }

        #[test]
        fn prop_valid_objects_pass_through(
            entries in prop::collection::btree_map("[a-z_]{1,8}", "[ -~]{0,20}", 0..6)
        ) {
            let text = serde_json::to_string(&entries).unwrap();
            let repaired = repair_json(&text).unwrap();
            prop_assert!(repaired.fixes.is_empty());
            prop_assert_eq!(repaired.value, serde_json::to_value(&entries).unwrap());
        }
    }
}
