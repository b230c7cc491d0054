//! Effectiveness report built from section aggregates

use crate::storage::SectionAggregate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPerformance {
    pub avg_effectiveness: f64,
    pub total_usage: usize,
    pub top_sections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionScore {
    pub framework: String,
    pub operation: String,
    pub section: String,
    pub score: f64,
    pub usage: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessReport {
    pub period_days: i64,
    pub generated_at: DateTime<Utc>,
    /// framework -> operation -> performance
    pub framework_performance: BTreeMap<String, BTreeMap<String, OperationPerformance>>,
    pub total_groups: usize,
    pub avg_effectiveness: f64,
    pub top_sections: Vec<SectionScore>,
    pub low_sections: Vec<SectionScore>,
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Summarize aggregates per framework/operation and overall
pub fn effectiveness_report(
    aggregates: &[SectionAggregate],
    period_days: i64,
    now: DateTime<Utc>,
) -> EffectivenessReport {
    let mut groups: BTreeMap<(&str, &str), Vec<&SectionAggregate>> = BTreeMap::new();
    for agg in aggregates {
        groups
            .entry((agg.framework.as_str(), agg.operation.as_str()))
            .or_default()
            .push(agg);
    }

    let mut framework_performance: BTreeMap<String, BTreeMap<String, OperationPerformance>> =
        BTreeMap::new();
    for ((framework, operation), mut sections) in groups.iter().map(|(k, v)| (*k, v.clone())) {
        sections.sort_by(|a, b| b.avg_effectiveness.total_cmp(&a.avg_effectiveness));
        let avg = sections.iter().map(|s| s.avg_effectiveness).sum::<f64>() / sections.len() as f64;
        framework_performance
            .entry(framework.to_string())
            .or_default()
            .insert(
                operation.to_string(),
                OperationPerformance {
                    avg_effectiveness: round3(avg),
                    total_usage: sections.iter().map(|s| s.count).sum(),
                    top_sections: sections.iter().take(3).map(|s| s.section.clone()).collect(),
                },
            );
    }

    let mut all: Vec<&SectionAggregate> = aggregates.iter().collect();
    all.sort_by(|a, b| b.avg_effectiveness.total_cmp(&a.avg_effectiveness));

    let to_score = |s: &&SectionAggregate| SectionScore {
        framework: s.framework.clone(),
        operation: s.operation.clone(),
        section: s.section.clone(),
        score: round3(s.avg_effectiveness),
        usage: s.count,
    };

    let avg_effectiveness = if all.is_empty() {
        0.0
    } else {
        round3(all.iter().map(|s| s.avg_effectiveness).sum::<f64>() / all.len() as f64)
    };

    EffectivenessReport {
        period_days,
        generated_at: now,
        framework_performance,
        total_groups: groups.len(),
        avg_effectiveness,
        top_sections: all.iter().take(5).map(to_score).collect(),
        low_sections: all
            .iter()
            .skip(all.len().saturating_sub(5))
            .filter(|s| s.avg_effectiveness < 0.5)
            .map(to_score)
            .collect(),
    }
}
