//! Rule validation and the A/B controller
//!
//! Candidate rules pass through two gates:
//!
//! 1. **Shape validation** over the whole batch. Any rule with no sections
//!    or a non-positive budget rejects the batch; large swings only warn.
//! 2. **Change decision** per pair. A first rule is committed directly, a
//!    risky change starts an experiment, a better-supported one replaces the
//!    active rule, anything else is kept out.
//!
//! Experiments are run by [`ABController`]: arm assignment by weighted coin
//! flip, result bookkeeping, and the final recommendation.

use crate::config::{ChangeThresholds, ExperimentConfig};
use crate::error::Result;
use crate::storage::{ABTest, ExperimentStore, TestStatus};
use crate::types::{framework_of, Arm, CandidateRule, ExtractionRule, RuleSet, SessionRecord};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::debug;

const DEFAULT_OLD_TOKENS: i64 = 2000;
const DEFAULT_CANDIDATE_CONFIDENCE: f64 = 0.5;
const MAX_REMOVED_SECTIONS: usize = 2;
const LOW_CONFIDENCE: f64 = 0.3;
const LOW_SESSIONS: i64 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_rules: usize,
    pub frameworks_affected: Vec<String>,
    pub warning_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub summary: ValidationSummary,
}

/// Check a candidate batch against the rules currently in force
pub fn validate_rule_shape(existing: &RuleSet, candidates: &[CandidateRule]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut frameworks = BTreeSet::new();

    for candidate in candidates {
        let pair = format!("{}:{}", candidate.framework, candidate.operation);
        let rule = &candidate.rule;
        frameworks.insert(candidate.framework.clone());

        if rule.sections.is_empty() {
            errors.push(format!("{} has no sections defined", pair));
        }
        if rule.max_tokens <= 0 {
            errors.push(format!(
                "{} has a non-positive token budget ({})",
                pair, rule.max_tokens
            ));
        }

        let old = existing.get(&candidate.framework, &candidate.operation);
        let old_tokens = old.map_or(DEFAULT_OLD_TOKENS, |r| r.max_tokens);
        if rule.max_tokens > old_tokens * 2 {
            warnings.push(format!(
                "{} token budget increased dramatically: {} -> {}",
                pair, old_tokens, rule.max_tokens
            ));
        } else if (rule.max_tokens as f64) < old_tokens as f64 * 0.5 {
            warnings.push(format!(
                "{} token budget decreased significantly: {} -> {}",
                pair, old_tokens, rule.max_tokens
            ));
        }

        if let Some(old) = old {
            let removed = old
                .sections
                .iter()
                .filter(|s| !rule.sections.contains(s))
                .count();
            if removed > MAX_REMOVED_SECTIONS {
                warnings.push(format!("{} removes {} sections", pair, removed));
            }
        }

        if let Some(meta) = &rule.metadata {
            if meta.confidence < LOW_CONFIDENCE {
                warnings.push(format!(
                    "{} has low confidence: {:.2}",
                    pair, meta.confidence
                ));
            }
            if meta.based_on_sessions < LOW_SESSIONS {
                warnings.push(format!(
                    "{} based on few sessions: {}",
                    pair, meta.based_on_sessions
                ));
            }
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        summary: ValidationSummary {
            total_rules: candidates.len(),
            frameworks_affected: frameworks.into_iter().collect(),
            warning_count: warnings.len(),
            error_count: errors.len(),
        },
        errors,
        warnings,
    }
}

/// What to do with one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDecision {
    /// No rule yet; commit directly
    Commit,
    /// Risky change; run an experiment against the active rule
    Experiment,
    /// Better supported; replace the active rule directly
    Replace,
    /// Not worth changing
    Keep,
}

/// Decide between direct commit, experiment, replacement and no change
pub fn decide(
    active: Option<&ExtractionRule>,
    candidate: &ExtractionRule,
    thresholds: &ChangeThresholds,
) -> ChangeDecision {
    let Some(active) = active else {
        return ChangeDecision::Commit;
    };
    if should_ab_test(active, candidate, thresholds) {
        ChangeDecision::Experiment
    } else if should_update(active, candidate, thresholds) {
        ChangeDecision::Replace
    } else {
        ChangeDecision::Keep
    }
}

/// A change large enough to need an experiment
pub fn should_ab_test(
    active: &ExtractionRule,
    candidate: &ExtractionRule,
    thresholds: &ChangeThresholds,
) -> bool {
    let token_delta = (candidate.max_tokens - active.max_tokens).abs() as f64;
    if token_delta > active.max_tokens as f64 * thresholds.token_change_ratio {
        return true;
    }

    let old: BTreeSet<&String> = active.sections.iter().collect();
    let new: BTreeSet<&String> = candidate.sections.iter().collect();
    let changed = old.symmetric_difference(&new).count();
    if changed as f64 > active.sections.len() as f64 * thresholds.section_change_ratio {
        return true;
    }

    let confidence = candidate
        .confidence()
        .unwrap_or(DEFAULT_CANDIDATE_CONFIDENCE);
    confidence > thresholds.high_confidence
        && candidate.based_on_sessions() >= thresholds.high_confidence_sessions
}

/// A candidate with materially more support than the active rule
pub fn should_update(
    active: &ExtractionRule,
    candidate: &ExtractionRule,
    thresholds: &ChangeThresholds,
) -> bool {
    let confidence = candidate.confidence().unwrap_or(0.0);
    if confidence < thresholds.min_confidence {
        return false;
    }

    let sessions = candidate.based_on_sessions();
    if sessions as f64 > active.based_on_sessions() as f64 * thresholds.session_growth_factor {
        return true;
    }

    let active_confidence = active
        .confidence()
        .unwrap_or(DEFAULT_CANDIDATE_CONFIDENCE);
    confidence > active_confidence + thresholds.confidence_gain
        && sessions >= thresholds.confidence_gain_sessions
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    AdoptTestRule,
    KeepControlRule,
    NoSignificantDifference,
    Inconclusive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAnalysis {
    pub test_id: String,
    pub framework: String,
    pub operation: String,
    pub status: TestStatus,
    pub control_sessions: usize,
    pub test_sessions: usize,
    pub control_avg_effectiveness: f64,
    pub test_avg_effectiveness: f64,
    pub improvement: f64,
    pub improvement_pct: f64,
    pub recommendation: Recommendation,
    pub sufficient_data: bool,
    pub duration_days: i64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn round_to(v: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (v * factor).round() / factor
}

/// Compare both arms of a test
pub fn analyze_test(test: &ABTest, settings: &ExperimentConfig) -> ExperimentAnalysis {
    let control_avg = mean(&test.control_effectiveness);
    let test_avg = mean(&test.test_effectiveness);
    let sufficient_data = test.control_sessions() >= settings.min_sessions_per_arm
        && test.test_sessions() >= settings.min_sessions_per_arm;

    let (improvement, improvement_pct) = if control_avg > 0.0 {
        let delta = test_avg - control_avg;
        (delta, delta / control_avg * 100.0)
    } else {
        (0.0, 0.0)
    };

    let recommendation = if !sufficient_data {
        Recommendation::Inconclusive
    } else if improvement_pct > settings.improvement_threshold_pct {
        Recommendation::AdoptTestRule
    } else if improvement_pct < -settings.improvement_threshold_pct {
        Recommendation::KeepControlRule
    } else {
        Recommendation::NoSignificantDifference
    };

    ExperimentAnalysis {
        test_id: test.test_id.clone(),
        framework: test.framework.clone(),
        operation: test.operation.clone(),
        status: test.status,
        control_sessions: test.control_sessions(),
        test_sessions: test.test_sessions(),
        control_avg_effectiveness: round_to(control_avg, 3),
        test_avg_effectiveness: round_to(test_avg, 3),
        improvement: round_to(improvement, 3),
        improvement_pct: round_to(improvement_pct, 1),
        recommendation,
        sufficient_data,
        duration_days: (test.end_date - test.start_date).num_days(),
    }
}

/// Runs experiments for risky rule changes
pub struct ABController {
    store: ExperimentStore,
    settings: ExperimentConfig,
    thresholds: ChangeThresholds,
    rng: Mutex<StdRng>,
}

impl ABController {
    pub fn new(store: ExperimentStore, settings: ExperimentConfig, thresholds: ChangeThresholds) -> Self {
        Self::with_rng(store, settings, thresholds, StdRng::from_entropy())
    }

    /// Deterministic arm assignment
    pub fn with_seed(
        store: ExperimentStore,
        settings: ExperimentConfig,
        thresholds: ChangeThresholds,
        seed: u64,
    ) -> Self {
        Self::with_rng(store, settings, thresholds, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        store: ExperimentStore,
        settings: ExperimentConfig,
        thresholds: ChangeThresholds,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            settings,
            thresholds,
            rng: Mutex::new(rng),
        }
    }

    pub fn store(&self) -> &ExperimentStore {
        &self.store
    }

    pub fn settings(&self) -> &ExperimentConfig {
        &self.settings
    }

    pub fn decide(&self, active: Option<&ExtractionRule>, candidate: &ExtractionRule) -> ChangeDecision {
        decide(active, candidate, &self.thresholds)
    }

    /// Weighted coin flip: `Test` with probability `traffic_split`
    pub fn assign_arm(&self, traffic_split: f64) -> Arm {
        let roll: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.gen(),
            Err(poisoned) => poisoned.into_inner().gen(),
        };
        if roll < traffic_split {
            Arm::Test
        } else {
            Arm::Control
        }
    }

    /// Start an experiment of `candidate` against `control`
    pub async fn start_experiment_at(
        &self,
        framework: &str,
        operation: &str,
        control: ExtractionRule,
        candidate: ExtractionRule,
        now: DateTime<Utc>,
    ) -> Result<ABTest> {
        let duration = chrono::Duration::from_std(self.settings.duration)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let test = ABTest {
            test_id: generate_test_id(framework, operation, now),
            framework: framework.to_string(),
            operation: operation.to_string(),
            control_rule: control,
            test_rule: candidate,
            start_date: now,
            end_date: now + duration,
            traffic_split: self.settings.traffic_split,
            status: TestStatus::Active,
            completed_at: None,
            finalized_at: None,
            control_effectiveness: Vec::new(),
            test_effectiveness: Vec::new(),
        };
        self.store.create(&test).await?;
        Ok(test)
    }

    /// The rule to serve for a pair while it is experimenting
    ///
    /// Returns `None` when no experiment is active; an expired test is
    /// completed on the way.
    pub async fn serve_at(
        &self,
        framework: &str,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(ABTest, Arm)>> {
        let Some(test) = self.store.active_for(framework, operation).await? else {
            return Ok(None);
        };
        if test.is_expired_at(now) {
            self.store.complete_expired_at(now).await?;
            return Ok(None);
        }
        let arm = self.assign_arm(test.traffic_split);
        debug!(test_id = %test.test_id, arm = arm.as_str(), "Serving experiment arm");
        Ok(Some((test, arm)))
    }

    /// Record a scored session in the experiment it belongs to
    ///
    /// Uses the arm recorded at delivery time when present; otherwise an
    /// active experiment for the session's pair gets a coin-flipped arm.
    /// Returns the experiment and arm the score landed in.
    pub async fn record_session_at(
        &self,
        record: &SessionRecord,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, Arm)>> {
        let target = match (&record.experiment_id, record.experiment_arm) {
            (Some(test_id), Some(arm)) => Some((test_id.clone(), arm)),
            _ => self
                .store
                .active_for(framework_of(&record.cache_key), &record.operation_type)
                .await?
                .map(|test| {
                    let arm = self.assign_arm(test.traffic_split);
                    (test.test_id, arm)
                }),
        };

        let Some((test_id, arm)) = target else {
            return Ok(None);
        };
        let recorded = self
            .store
            .record_result_at(&test_id, arm, score, Some(record.log_id), now)
            .await?;
        Ok(recorded.then_some((test_id, arm)))
    }

    pub async fn analyze(&self, test_id: &str) -> Result<Option<ExperimentAnalysis>> {
        Ok(self
            .store
            .get(test_id)
            .await?
            .map(|test| analyze_test(&test, &self.settings)))
    }

    /// Analysis of every stored test, best improvement first
    pub async fn list_results(&self) -> Result<Vec<ExperimentAnalysis>> {
        let mut results: Vec<ExperimentAnalysis> = self
            .store
            .list_all()
            .await?
            .iter()
            .map(|test| analyze_test(test, &self.settings))
            .collect();
        results.sort_by(|a, b| b.improvement_pct.total_cmp(&a.improvement_pct));
        Ok(results)
    }
}

/// `test_` plus eight hex digits of a digest over pair and start time
pub fn generate_test_id(framework: &str, operation: &str, now: DateTime<Utc>) -> String {
    let digest = Sha256::digest(
        format!(
            "{}:{}:{}",
            framework,
            operation,
            now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
        )
        .as_bytes(),
    );
    let hex: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("test_{}", hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::test_support::create_test_db;
    use crate::types::LearningMetadata;
    use chrono::Duration;

    fn rule(sections: &[&str], max_tokens: i64, confidence: f64, sessions: i64) -> ExtractionRule {
        let mut rule = ExtractionRule::new(sections, max_tokens);
        rule.metadata = Some(LearningMetadata {
            confidence,
            based_on_sessions: sessions,
            last_updated: Utc::now(),
            pattern_enhanced: false,
            ab_test_winner: None,
            test_id: None,
            improvement_pct: None,
        });
        rule
    }

    fn candidate(fw: &str, op: &str, rule: ExtractionRule) -> CandidateRule {
        CandidateRule {
            framework: fw.to_string(),
            operation: op.to_string(),
            rule,
        }
    }

    fn test_with_scores(control: Vec<f64>, test: Vec<f64>) -> ABTest {
        let start = Utc::now() - Duration::days(8);
        ABTest {
            test_id: "test_0000abcd".to_string(),
            framework: "react".to_string(),
            operation: "create".to_string(),
            control_rule: ExtractionRule::new(&["overview"], 2000),
            test_rule: ExtractionRule::new(&["hooks"], 2000),
            start_date: start,
            end_date: start + Duration::days(7),
            traffic_split: 0.5,
            status: TestStatus::Completed,
            completed_at: Some(Utc::now()),
            finalized_at: None,
            control_effectiveness: control,
            test_effectiveness: test,
        }
    }

    #[test]
    fn test_shape_validation_rejects_batch() {
        let report = validate_rule_shape(
            &RuleSet::default(),
            &[
                candidate("react", "create", rule(&["hooks", "example"], 2000, 0.8, 10)),
                candidate("vue", "debug", rule(&[], 2000, 0.8, 10)),
                candidate("vue", "style", rule(&["css"], 0, 0.8, 10)),
            ],
        );
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].contains("vue:debug has no sections"));
        assert_eq!(report.summary.frameworks_affected, vec!["react", "vue"]);
    }

    #[test]
    fn test_shape_validation_warns_on_swings() {
        let mut existing = RuleSet::default();
        existing.set("react", "create", ExtractionRule::new(&["a", "b", "c", "d"], 1000));

        let report = validate_rule_shape(
            &existing,
            &[candidate("react", "create", rule(&["x", "y"], 2500, 0.2, 2))],
        );
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 4);
        assert!(report.warnings[0].contains("increased dramatically: 1000 -> 2500"));
        assert!(report.warnings[1].contains("removes 4 sections"));
    }

    #[test]
    fn test_first_rule_is_committed() {
        let thresholds = ChangeThresholds::default();
        let new = rule(&["hooks"], 5000, 0.95, 50);
        assert_eq!(decide(None, &new, &thresholds), ChangeDecision::Commit);
    }

    #[test]
    fn test_large_changes_start_experiments() {
        let thresholds = ChangeThresholds::default();
        let active = rule(&["overview", "example"], 2000, 0.6, 10);

        let bigger = rule(&["overview", "example"], 2700, 0.6, 10);
        assert_eq!(decide(Some(&active), &bigger, &thresholds), ChangeDecision::Experiment);

        let reshuffled = rule(&["overview", "hooks"], 2000, 0.6, 10);
        assert_eq!(
            decide(Some(&active), &reshuffled, &thresholds),
            ChangeDecision::Experiment
        );

        let confident = rule(&["overview", "example"], 2000, 0.85, 10);
        assert_eq!(
            decide(Some(&active), &confident, &thresholds),
            ChangeDecision::Experiment
        );
    }

    #[test]
    fn test_better_support_replaces_directly() {
        let thresholds = ChangeThresholds::default();
        let active = rule(&["overview", "example"], 2000, 0.6, 10);

        let more_data = rule(&["overview", "example"], 2100, 0.6, 16);
        assert_eq!(decide(Some(&active), &more_data, &thresholds), ChangeDecision::Replace);

        let more_confident = rule(&["example", "overview"], 2000, 0.75, 5);
        assert_eq!(
            decide(Some(&active), &more_confident, &thresholds),
            ChangeDecision::Replace
        );

        let same = rule(&["overview", "example"], 2000, 0.6, 12);
        assert_eq!(decide(Some(&active), &same, &thresholds), ChangeDecision::Keep);

        let weak = rule(&["overview", "example"], 2000, 0.2, 100);
        assert_eq!(decide(Some(&active), &weak, &thresholds), ChangeDecision::Keep);
    }

    #[test]
    fn test_adopt_on_twelve_percent_gain() {
        let analysis = analyze_test(
            &test_with_scores(vec![0.50; 25], vec![0.56; 25]),
            &ExperimentConfig::default(),
        );
        assert!(analysis.sufficient_data);
        assert_eq!(analysis.improvement_pct, 12.0);
        assert_eq!(analysis.recommendation, Recommendation::AdoptTestRule);
        assert_eq!(analysis.control_avg_effectiveness, 0.5);
        assert_eq!(analysis.duration_days, 7);
    }

    #[test]
    fn test_recommendation_bands() {
        let settings = ExperimentConfig::default();
        let worse = analyze_test(&test_with_scores(vec![0.6; 20], vec![0.5; 20]), &settings);
        assert_eq!(worse.recommendation, Recommendation::KeepControlRule);

        let flat = analyze_test(&test_with_scores(vec![0.6; 20], vec![0.61; 20]), &settings);
        assert_eq!(flat.recommendation, Recommendation::NoSignificantDifference);

        let thin = analyze_test(&test_with_scores(vec![0.5; 19], vec![0.9; 30]), &settings);
        assert_eq!(thin.recommendation, Recommendation::Inconclusive);
        assert!(!thin.sufficient_data);

        let zero = analyze_test(&test_with_scores(vec![0.0; 20], vec![0.9; 20]), &settings);
        assert_eq!(zero.improvement_pct, 0.0);
        assert_eq!(zero.recommendation, Recommendation::NoSignificantDifference);
    }

    #[test]
    fn test_id_format() {
        let id = generate_test_id("react", "create", Utc::now());
        assert!(id.starts_with("test_"));
        assert_eq!(id.len(), 13);
        assert!(id[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_traffic_split_extremes() {
        let (db, _temp) = create_test_db().await;
        let controller = ABController::with_seed(
            ExperimentStore::new(db),
            ExperimentConfig::default(),
            ChangeThresholds::default(),
            7,
        );
        assert!((0..50).all(|_| controller.assign_arm(1.0) == Arm::Test));
        assert!((0..50).all(|_| controller.assign_arm(0.0) == Arm::Control));
    }

    #[tokio::test]
    async fn test_session_scores_land_in_active_experiment() {
        let (db, _temp) = create_test_db().await;
        let controller = ABController::with_seed(
            ExperimentStore::new(db),
            ExperimentConfig::default(),
            ChangeThresholds::default(),
            42,
        );
        let now = Utc::now();
        let test = controller
            .start_experiment_at(
                "react",
                "create",
                ExtractionRule::new(&["overview"], 2000),
                ExtractionRule::new(&["hooks"], 2000),
                now,
            )
            .await
            .unwrap();

        let record = SessionRecord {
            log_id: 9,
            session_id: "abcd1234".to_string(),
            cache_key: "react:button".to_string(),
            operation_type: "create".to_string(),
            sections_provided: vec!["hooks".to_string()],
            tokens_used: 900,
            tool_name: "Write".to_string(),
            tool_input: String::new(),
            file_path: None,
            timestamp: now,
            session_complete: Some(true),
            follow_up_actions: None,
            effectiveness_score: None,
            effectiveness_reason: None,
            confidence_score: None,
            analyzed_at: None,
            experiment_id: Some(test.test_id.clone()),
            experiment_arm: Some(Arm::Control),
        };
        let landed = controller.record_session_at(&record, 0.7, now).await.unwrap();
        assert_eq!(landed, Some((test.test_id.clone(), Arm::Control)));

        let unassigned = SessionRecord {
            experiment_id: None,
            experiment_arm: None,
            ..record.clone()
        };
        let landed = controller
            .record_session_at(&unassigned, 0.8, now)
            .await
            .unwrap();
        assert!(landed.is_some());

        let other_pair = SessionRecord {
            cache_key: "vue".to_string(),
            ..unassigned
        };
        assert!(controller
            .record_session_at(&other_pair, 0.8, now)
            .await
            .unwrap()
            .is_none());

        let stored = controller.store().get(&test.test_id).await.unwrap().unwrap();
        assert_eq!(stored.control_sessions() + stored.test_sessions(), 2);
    }
}
