//! Effectiveness scoring of delivered documentation
//!
//! A [`Scorer`] turns one [`SessionRecord`] into a score, a human-readable
//! reason and a confidence. The default [`HeuristicScorer`] combines signed
//! contributions from structured outcome signals:
//!
//! | Signal                                   | Contribution |
//! |------------------------------------------|--------------|
//! | session completed / not completed        | +0.3 / -0.2  |
//! | a follow-up tag mentions an error        | -0.3         |
//! | a follow-up tag shows a new doc lookup   | -0.4         |
//! | tokens within 500..=3000 / outside       | +0.1 / -0.1  |
//! | known-good (framework, operation) pair   | +0.1         |
//!
//! The base score is 0.5 and the result is clamped to [0, 1]. The function
//! reads nothing but the record, so replaying a record replays its score.

use crate::types::SessionRecord;
use serde::{Deserialize, Serialize};

const BASE_SCORE: f64 = 0.5;
const BASE_CONFIDENCE: f64 = 0.7;
const MIN_CONFIDENCE: f64 = 0.1;

/// Result of scoring one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effectiveness {
    pub score: f64,
    pub reason: String,
    pub confidence: f64,
}

/// Strategy for judging a delivery
pub trait Scorer: Send + Sync {
    fn score(&self, record: &SessionRecord) -> Effectiveness;
}

/// Deterministic pattern-matching scorer
#[derive(Debug, Clone)]
pub struct HeuristicScorer {
    /// Substrings marking a follow-up as an error
    pub error_markers: Vec<String>,

    /// Substrings marking a follow-up as a fresh documentation lookup
    pub lookup_markers: Vec<String>,

    /// Inclusive token band considered appropriate
    pub token_band: (i64, i64),

    /// (framework, operation) pairs known to work well
    pub preferred_pairs: Vec<(String, String)>,
}

impl Default for HeuristicScorer {
    fn default() -> Self {
        Self {
            error_markers: vec!["error".to_string()],
            lookup_markers: vec!["context7".to_string(), "doc_lookup".to_string()],
            token_band: (500, 3000),
            preferred_pairs: vec![("react".to_string(), "create".to_string())],
        }
    }
}

impl HeuristicScorer {
    fn any_tag_matches(tags: &[String], markers: &[String]) -> bool {
        tags.iter().any(|tag| {
            let tag = tag.to_lowercase();
            markers.iter().any(|m| tag.contains(m.as_str()))
        })
    }
}

impl Scorer for HeuristicScorer {
    fn score(&self, record: &SessionRecord) -> Effectiveness {
        let mut score = BASE_SCORE;
        let mut confidence = BASE_CONFIDENCE;
        let mut reasons: Vec<&str> = Vec::new();

        match record.session_complete {
            Some(true) => {
                score += 0.3;
                reasons.push("session completed successfully");
            }
            Some(false) => {
                score -= 0.2;
                reasons.push("session was not completed");
            }
            None => confidence -= 0.2,
        }

        let follow_ups = record.follow_up_actions.as_deref().unwrap_or(&[]);
        if follow_ups.is_empty() {
            confidence -= 0.1;
        } else {
            if Self::any_tag_matches(follow_ups, &self.error_markers) {
                score -= 0.3;
                reasons.push("errors occurred after using cached context");
            }
            if Self::any_tag_matches(follow_ups, &self.lookup_markers) {
                score -= 0.4;
                reasons.push("user immediately sought different documentation");
            }
        }

        let (low, high) = self.token_band;
        if record.tokens_used > high {
            score -= 0.1;
            reasons.push("high token usage may indicate inefficient context");
        } else if record.tokens_used < low {
            score -= 0.1;
            reasons.push("very low token usage may indicate insufficient context");
        } else {
            score += 0.1;
            reasons.push("appropriate token usage");
        }

        let framework = record.framework();
        if self
            .preferred_pairs
            .iter()
            .any(|(fw, op)| fw == framework && *op == record.operation_type)
        {
            score += 0.1;
            reasons.push("good framework-operation alignment");
        }

        Effectiveness {
            score: score.clamp(0.0, 1.0),
            reason: format!("Analysis based on: {}", reasons.join(", ")),
            confidence: confidence.clamp(MIN_CONFIDENCE, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn record(complete: Option<bool>, follow_ups: Option<Vec<&str>>, tokens: i64) -> SessionRecord {
        SessionRecord {
            log_id: 1,
            session_id: "s".to_string(),
            cache_key: "vue:router".to_string(),
            operation_type: "debug".to_string(),
            sections_provided: vec!["overview".to_string()],
            tokens_used: tokens,
            tool_name: "Edit".to_string(),
            tool_input: String::new(),
            file_path: None,
            timestamp: Utc::now(),
            session_complete: complete,
            follow_up_actions: follow_ups.map(|f| f.into_iter().map(String::from).collect()),
            effectiveness_score: None,
            effectiveness_reason: None,
            confidence_score: None,
            analyzed_at: None,
            experiment_id: None,
            experiment_arm: None,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_completed_session_in_band() {
        let result = HeuristicScorer::default().score(&record(Some(true), Some(vec!["commit"]), 1200));
        assert!(approx(result.score, 0.9));
        assert!(approx(result.confidence, 0.7));
        assert!(result.reason.contains("session completed successfully"));
    }

    #[test]
    fn test_unknown_outcome_lowers_confidence() {
        let result = HeuristicScorer::default().score(&record(None, None, 1200));
        assert!(approx(result.score, 0.6));
        assert!(approx(result.confidence, 0.4));
    }

    #[test]
    fn test_errors_and_lookup_clamp_to_zero() {
        let result = HeuristicScorer::default().score(&record(
            Some(false),
            Some(vec!["TypeError in build", "context7 lookup"]),
            5000,
        ));
        // 0.5 - 0.2 - 0.3 - 0.4 - 0.1 < 0
        assert_eq!(result.score, 0.0);
        assert!(result.reason.contains("sought different documentation"));
    }

    #[test]
    fn test_preferred_pair_bonus() {
        let mut rec = record(Some(true), Some(vec!["commit"]), 1000);
        rec.cache_key = "react:button".to_string();
        rec.operation_type = "create".to_string();
        let result = HeuristicScorer::default().score(&rec);
        assert_eq!(result.score, 1.0);
        assert!(result.reason.contains("alignment"));
    }

    #[test]
    fn test_scoring_is_replayable() {
        let scorer = HeuristicScorer::default();
        let rec = record(Some(false), Some(vec!["retry"]), 200);
        assert_eq!(scorer.score(&rec), scorer.score(&rec));
    }

    proptest! {
        #[test]
        fn prop_score_and_confidence_stay_in_bounds(
            complete in prop::option::of(any::<bool>()),
            follow_ups in prop::option::of(prop::collection::vec(
                prop_oneof![
                    Just("error: build failed".to_string()),
                    Just("context7 lookup".to_string()),
                    Just("DOC_LOOKUP".to_string()),
                    "\\PC{0,16}",
                ],
                0..6,
            )),
            tokens in any::<i64>(),
            framework in prop_oneof![Just("react".to_string()), "[a-z]{1,8}"],
            operation in prop_oneof![Just("create".to_string()), "[a-z]{1,8}"],
        ) {
            let mut rec = record(complete, None, tokens);
            rec.follow_up_actions = follow_ups;
            rec.cache_key = framework;
            rec.operation_type = operation;

            let result = HeuristicScorer::default().score(&rec);
            prop_assert!((0.0..=1.0).contains(&result.score));
            prop_assert!((0.1..=1.0).contains(&result.confidence));
        }
    }
}
