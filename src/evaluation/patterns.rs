//! Operation-sequence analysis for predictive hints
//!
//! Scored deliveries are split into activity runs wherever two consecutive
//! deliveries are more than `gap` apart. Runs shorter than two deliveries
//! are ignored.

use crate::types::{PredictedOperation, SessionRecord};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const MIN_RUN_LENGTH: usize = 2;
const MIN_PREDICTION_CONFIDENCE: f64 = 0.1;
const HIGH_PRIORITY_CONFIDENCE: f64 = 0.3;
const EFFECTIVE_SCORE: f64 = 0.7;
const MIN_CONTEXT_OCCURRENCES: usize = 3;
const PRELOAD_EFFECTIVENESS: f64 = 0.8;
const PRELOAD_OCCURRENCES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePattern {
    pub sequence: Vec<String>,
    pub count: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkTransition {
    pub from: String,
    pub to: String,
    pub count: usize,
}

/// Operations that scored well after a given run of previous operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveContext {
    pub context: Vec<String>,
    pub operations: Vec<String>,
    pub avg_effectiveness: f64,
    pub frequency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloadRecommendation {
    pub context: Vec<String>,
    pub recommended_operations: Vec<String>,
    pub effectiveness: f64,
    pub priority: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub window_days: i64,
    pub total_sequences: usize,
    pub common_sequences: Vec<SequencePattern>,
    pub framework_transitions: Vec<FrameworkTransition>,
    pub high_effectiveness_contexts: Vec<EffectiveContext>,
    pub next_operation_predictions: BTreeMap<String, Vec<PredictedOperation>>,
    pub preload_recommendations: Vec<PreloadRecommendation>,
}

impl PatternAnalysis {
    pub fn predictions_for(&self, operation: &str) -> &[PredictedOperation] {
        self.next_operation_predictions
            .get(operation)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn recommends_preload(&self, operation: &str) -> bool {
        self.preload_recommendations
            .iter()
            .any(|r| r.recommended_operations.iter().any(|o| o == operation))
    }
}

fn split_runs(records: &[SessionRecord], gap: Duration) -> Vec<Vec<&SessionRecord>> {
    let mut sorted: Vec<&SessionRecord> = records
        .iter()
        .filter(|r| r.effectiveness_score.is_some())
        .collect();
    sorted.sort_by_key(|r| (r.timestamp, r.log_id));

    let mut runs: Vec<Vec<&SessionRecord>> = Vec::new();
    let mut current: Vec<&SessionRecord> = Vec::new();
    for record in sorted {
        if let Some(prev) = current.last() {
            if record.timestamp - prev.timestamp > gap {
                runs.push(std::mem::take(&mut current));
            }
        }
        current.push(record);
    }
    if !current.is_empty() {
        runs.push(current);
    }

    runs.retain(|run| run.len() >= MIN_RUN_LENGTH);
    runs
}

fn most_common<K: Ord + Clone>(counts: BTreeMap<K, usize>, n: usize) -> Vec<(K, usize)> {
    let mut items: Vec<(K, usize)> = counts.into_iter().collect();
    // Stable sort keeps key order among ties
    items.sort_by(|a, b| b.1.cmp(&a.1));
    items.truncate(n);
    items
}

/// Find common operation sequences and the contexts that precede
/// highly effective deliveries
pub fn analyze_patterns(records: &[SessionRecord], window_days: i64, gap: Duration) -> PatternAnalysis {
    let runs = split_runs(records, gap);
    if runs.is_empty() {
        return PatternAnalysis {
            window_days,
            ..Default::default()
        };
    }

    let mut sequence_counts: BTreeMap<Vec<String>, usize> = BTreeMap::new();
    let mut transition_counts: BTreeMap<(String, String), usize> = BTreeMap::new();
    let mut contexts: BTreeMap<Vec<String>, Vec<(String, f64)>> = BTreeMap::new();

    for run in &runs {
        let ops: Vec<&str> = run.iter().map(|r| r.operation_type.as_str()).collect();
        for window in ops.windows(2).chain(ops.windows(3)) {
            let key = window.iter().map(|s| s.to_string()).collect();
            *sequence_counts.entry(key).or_default() += 1;
        }

        for pair in run.windows(2) {
            let (from, to) = (pair[0].framework(), pair[1].framework());
            if from != to {
                *transition_counts
                    .entry((from.to_string(), to.to_string()))
                    .or_default() += 1;
            }
        }

        for (i, step) in run.iter().enumerate() {
            let score = step.effectiveness_score.unwrap_or(0.0);
            if score <= EFFECTIVE_SCORE || i == 0 {
                continue;
            }
            let context = ops[i.saturating_sub(2)..i]
                .iter()
                .map(|s| s.to_string())
                .collect();
            contexts
                .entry(context)
                .or_default()
                .push((step.operation_type.clone(), score));
        }
    }

    let total = runs.len();
    let common_sequences: Vec<SequencePattern> = most_common(sequence_counts, 10)
        .into_iter()
        .map(|(sequence, count)| SequencePattern {
            sequence,
            count,
            confidence: count as f64 / total as f64,
        })
        .collect();

    let framework_transitions = most_common(transition_counts, 5)
        .into_iter()
        .map(|((from, to), count)| FrameworkTransition { from, to, count })
        .collect();

    let high_effectiveness_contexts: Vec<EffectiveContext> = contexts
        .into_iter()
        .filter(|(_, hits)| hits.len() >= MIN_CONTEXT_OCCURRENCES)
        .map(|(context, hits)| {
            let operations: BTreeSet<String> = hits.iter().map(|(op, _)| op.clone()).collect();
            EffectiveContext {
                context,
                operations: operations.into_iter().collect(),
                avg_effectiveness: hits.iter().map(|(_, s)| s).sum::<f64>() / hits.len() as f64,
                frequency: hits.len(),
            }
        })
        .collect();

    let mut next_operation_predictions: BTreeMap<String, Vec<PredictedOperation>> = BTreeMap::new();
    for pattern in &common_sequences {
        if pattern.sequence.len() != 2 || pattern.confidence <= MIN_PREDICTION_CONFIDENCE {
            continue;
        }
        next_operation_predictions
            .entry(pattern.sequence[0].clone())
            .or_default()
            .push(PredictedOperation {
                next_operation: pattern.sequence[1].clone(),
                confidence: pattern.confidence,
                priority: if pattern.confidence > HIGH_PRIORITY_CONFIDENCE {
                    "high".to_string()
                } else {
                    "medium".to_string()
                },
            });
    }

    let preload_recommendations = high_effectiveness_contexts
        .iter()
        .filter(|c| c.avg_effectiveness > PRELOAD_EFFECTIVENESS && c.frequency >= PRELOAD_OCCURRENCES)
        .map(|c| PreloadRecommendation {
            context: c.context.clone(),
            recommended_operations: c.operations.clone(),
            effectiveness: c.avg_effectiveness,
            priority: if c.avg_effectiveness > 0.9 { "high" } else { "medium" }.to_string(),
        })
        .collect();

    PatternAnalysis {
        window_days,
        total_sequences: total,
        common_sequences,
        framework_transitions,
        high_effectiveness_contexts,
        next_operation_predictions,
        preload_recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn at(log_id: i64, key: &str, op: &str, score: f64, ts: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            log_id,
            session_id: "s".to_string(),
            cache_key: key.to_string(),
            operation_type: op.to_string(),
            sections_provided: vec![],
            tokens_used: 1000,
            tool_name: "Write".to_string(),
            tool_input: String::new(),
            file_path: None,
            timestamp: ts,
            session_complete: Some(true),
            follow_up_actions: None,
            effectiveness_score: Some(score),
            effectiveness_reason: None,
            confidence_score: Some(0.6),
            analyzed_at: Some(ts),
            experiment_id: None,
            experiment_arm: None,
        }
    }

    /// `runs` activity bursts of create -> style -> test, a day apart
    fn bursts(runs: usize, test_score: f64) -> Vec<SessionRecord> {
        let start = Utc::now() - Duration::days(10);
        let mut records = Vec::new();
        for r in 0..runs {
            let base = start + Duration::days(r as i64);
            let id = (r * 3) as i64;
            records.push(at(id, "react", "create", 0.8, base));
            records.push(at(id + 1, "react", "style", 0.75, base + Duration::minutes(5)));
            records.push(at(id + 2, "vue", "test", test_score, base + Duration::minutes(10)));
        }
        records
    }

    #[test]
    fn test_runs_split_on_gap() {
        let analysis = analyze_patterns(&bursts(3, 0.9), 14, Duration::hours(1));
        assert_eq!(analysis.total_sequences, 3);

        let pair = analysis
            .common_sequences
            .iter()
            .find(|p| p.sequence == vec!["create", "style"])
            .unwrap();
        assert_eq!(pair.count, 3);
        assert!((pair.confidence - 1.0).abs() < 1e-9);
        assert_eq!(analysis.framework_transitions[0].from, "react");
        assert_eq!(analysis.framework_transitions[0].to, "vue");
    }

    #[test]
    fn test_next_operation_predictions() {
        let analysis = analyze_patterns(&bursts(4, 0.9), 14, Duration::hours(1));
        let predicted = analysis.predictions_for("create");
        assert_eq!(predicted.len(), 1);
        assert_eq!(predicted[0].next_operation, "style");
        assert_eq!(predicted[0].priority, "high");
        assert!(analysis.predictions_for("test").is_empty());
    }

    #[test]
    fn test_preload_needs_five_effective_occurrences() {
        let few = analyze_patterns(&bursts(4, 0.95), 14, Duration::hours(1));
        assert!(!few.recommends_preload("test"));
        assert!(!few.high_effectiveness_contexts.is_empty());

        let many = analyze_patterns(&bursts(5, 0.95), 14, Duration::hours(1));
        assert!(many.recommends_preload("test"));
        assert_eq!(many.preload_recommendations[0].priority, "high");
    }

    #[test]
    fn test_single_delivery_runs_are_ignored() {
        let now = Utc::now();
        let records = vec![
            at(1, "react", "create", 0.9, now - Duration::hours(5)),
            at(2, "react", "style", 0.9, now),
        ];
        let analysis = analyze_patterns(&records, 14, Duration::hours(1));
        assert_eq!(analysis.total_sequences, 0);
        assert!(analysis.common_sequences.is_empty());
    }
}
