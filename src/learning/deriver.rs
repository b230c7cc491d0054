//! Candidate rule derivation from section aggregates

use crate::config::LearningConfig;
use crate::evaluation::{DocPreference, PatternAnalysis};
use crate::storage::SectionAggregate;
use crate::types::{CandidateRule, ExtractionRule, LearningMetadata, PatternHints};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Names appended, in order, when too few sections qualify
pub const DEFAULT_PADDING: [&str; 4] = ["overview", "example", "usage", "api"];

const MIN_SECTIONS: usize = 2;
const PADDED_SECTIONS: usize = 4;
const MIN_BUDGET: i64 = 1500;
const MAX_BUDGET: i64 = 3000;
const BUDGET_HEADROOM: f64 = 1.2;

/// Knobs of the derivation, normally taken from [`LearningConfig`]
#[derive(Debug, Clone)]
pub struct DeriverSettings {
    pub effectiveness_floor: f64,
    pub min_section_sessions: usize,
    pub max_sections: usize,
}

impl Default for DeriverSettings {
    fn default() -> Self {
        Self::from(&LearningConfig::default())
    }
}

impl From<&LearningConfig> for DeriverSettings {
    fn from(config: &LearningConfig) -> Self {
        Self {
            effectiveness_floor: config.effectiveness_floor,
            min_section_sessions: config.min_section_sessions,
            max_sections: config.max_sections,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Derive one candidate rule per (framework, operation) group
///
/// Groups where no section clears the effectiveness floor produce no
/// candidate. Emitted rules always carry at least two sections and a
/// positive token budget.
pub fn derive(
    aggregates: &[SectionAggregate],
    preference: DocPreference,
    patterns: Option<&PatternAnalysis>,
    settings: &DeriverSettings,
    now: DateTime<Utc>,
) -> Vec<CandidateRule> {
    let mut groups: BTreeMap<(&str, &str), Vec<&SectionAggregate>> = BTreeMap::new();
    for agg in aggregates {
        groups
            .entry((agg.framework.as_str(), agg.operation.as_str()))
            .or_default()
            .push(agg);
    }

    let mut candidates = Vec::new();
    for ((framework, operation), group) in groups {
        let mut effective: Vec<&SectionAggregate> = group
            .into_iter()
            .filter(|s| {
                s.avg_effectiveness > settings.effectiveness_floor
                    && s.count >= settings.min_section_sessions
            })
            .collect();
        if effective.is_empty() {
            continue;
        }
        effective.sort_by(|a, b| b.avg_effectiveness.total_cmp(&a.avg_effectiveness));

        let mut sections: Vec<String> = Vec::new();
        for agg in effective.iter().take(settings.max_sections.max(1)) {
            if !sections.contains(&agg.section) {
                sections.push(agg.section.clone());
            }
        }
        if sections.len() < MIN_SECTIONS {
            for name in DEFAULT_PADDING {
                if sections.len() >= PADDED_SECTIONS {
                    break;
                }
                if !sections.iter().any(|s| s == name) {
                    sections.push(name.to_string());
                }
            }
        }

        let n = effective.len() as f64;
        let mean_volume = effective.iter().map(|s| s.count as f64).sum::<f64>() / n;
        let base = ((mean_volume * BUDGET_HEADROOM) as i64).clamp(MIN_BUDGET, MAX_BUDGET);
        let max_tokens = preference.scale_budget(base);

        let confidence = round2(effective.iter().map(|s| s.avg_confidence).sum::<f64>() / n);
        let based_on_sessions = effective.iter().map(|s| s.count as i64).sum();

        let pattern = patterns.and_then(|p| {
            let predicted = p.predictions_for(operation).to_vec();
            let preload = p.recommends_preload(operation);
            if predicted.is_empty() && !preload {
                return None;
            }
            Some(PatternHints {
                predicted_next_operations: predicted,
                high_effectiveness_context: preload,
                preload_priority: if preload { "high" } else { "medium" }.to_string(),
            })
        });

        candidates.push(CandidateRule {
            framework: framework.to_string(),
            operation: operation.to_string(),
            rule: ExtractionRule {
                sections,
                max_tokens,
                metadata: Some(LearningMetadata {
                    confidence,
                    based_on_sessions,
                    last_updated: now,
                    pattern_enhanced: pattern
                        .as_ref()
                        .is_some_and(|h| !h.predicted_next_operations.is_empty()),
                    ab_test_winner: None,
                    test_id: None,
                    improvement_pct: None,
                }),
                pattern,
            },
        });
    }

    candidates
}
