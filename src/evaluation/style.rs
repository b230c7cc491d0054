//! Usage-style analysis over recently scored deliveries
//!
//! The documentation preference derived here scales the token budget of
//! every rule the deriver emits.

use crate::types::SessionRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How much documentation this user tends to benefit from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocPreference {
    Light,
    #[default]
    Balanced,
    Comprehensive,
}

impl DocPreference {
    /// Scale a base budget: comprehensive x1.3 (max 4000), light x0.8 (min 1000)
    pub fn scale_budget(&self, base: i64) -> i64 {
        match self {
            DocPreference::Comprehensive => ((base as f64 * 1.3) as i64).min(4000),
            DocPreference::Light => ((base as f64 * 0.8) as i64).max(1000),
            DocPreference::Balanced => base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationUsage {
    pub operation: String,
    pub frequency: usize,
    pub avg_effectiveness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkUsage {
    pub framework: String,
    pub usage_count: usize,
    pub avg_effectiveness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub operation: String,
    pub avg_tokens: f64,
    pub min_tokens: i64,
    pub max_tokens: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleAnalysis {
    pub window_days: i64,
    pub operation_preferences: Vec<OperationUsage>,
    pub framework_preferences: Vec<FrameworkUsage>,
    pub token_usage: Vec<TokenUsage>,
    pub primary_activity: Option<String>,
    pub preferred_frameworks: Vec<String>,
    pub documentation_preference: DocPreference,
}

#[derive(Default)]
struct Tally {
    count: usize,
    score: f64,
    tokens: i64,
    min_tokens: i64,
    max_tokens: i64,
}

impl Tally {
    fn add(&mut self, score: f64, tokens: i64) {
        if self.count == 0 {
            self.min_tokens = tokens;
            self.max_tokens = tokens;
        } else {
            self.min_tokens = self.min_tokens.min(tokens);
            self.max_tokens = self.max_tokens.max(tokens);
        }
        self.count += 1;
        self.score += score;
        self.tokens += tokens;
    }

    fn mean_score(&self) -> f64 {
        self.score / self.count as f64
    }
}

/// Summarize operation and framework usage of scored records
pub fn analyze_style(records: &[SessionRecord], window_days: i64) -> StyleAnalysis {
    let mut by_operation: BTreeMap<&str, Tally> = BTreeMap::new();
    let mut by_framework: BTreeMap<&str, Tally> = BTreeMap::new();

    for record in records {
        let Some(score) = record.effectiveness_score else {
            continue;
        };
        by_operation
            .entry(record.operation_type.as_str())
            .or_default()
            .add(score, record.tokens_used);
        by_framework
            .entry(record.framework())
            .or_default()
            .add(score, record.tokens_used);
    }

    let mut operation_preferences: Vec<OperationUsage> = by_operation
        .iter()
        .map(|(op, t)| OperationUsage {
            operation: op.to_string(),
            frequency: t.count,
            avg_effectiveness: t.mean_score(),
        })
        .collect();
    operation_preferences.sort_by(|a, b| b.frequency.cmp(&a.frequency));

    let mut framework_preferences: Vec<FrameworkUsage> = by_framework
        .iter()
        .map(|(fw, t)| FrameworkUsage {
            framework: fw.to_string(),
            usage_count: t.count,
            avg_effectiveness: t.mean_score(),
        })
        .collect();
    framework_preferences.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));

    let token_usage = by_operation
        .iter()
        .map(|(op, t)| TokenUsage {
            operation: op.to_string(),
            avg_tokens: t.tokens as f64 / t.count as f64,
            min_tokens: t.min_tokens,
            max_tokens: t.max_tokens,
        })
        .collect();

    let documentation_preference = if operation_preferences.is_empty() {
        DocPreference::Balanced
    } else {
        let mean = operation_preferences
            .iter()
            .map(|o| o.avg_effectiveness)
            .sum::<f64>()
            / operation_preferences.len() as f64;
        if mean > 0.8 {
            DocPreference::Comprehensive
        } else if mean < 0.6 {
            DocPreference::Light
        } else {
            DocPreference::Balanced
        }
    };

    StyleAnalysis {
        window_days,
        primary_activity: operation_preferences.first().map(|o| o.operation.clone()),
        preferred_frameworks: framework_preferences
            .iter()
            .take(2)
            .map(|f| f.framework.clone())
            .collect(),
        operation_preferences,
        framework_preferences,
        token_usage,
        documentation_preference,
    }
}
