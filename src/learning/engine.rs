//! The learning cycle
//!
//! One cycle scores a bounded batch of unanalyzed deliveries, feeds the
//! scores of experimenting pairs into their tests, derives candidate rules
//! from the recent window and applies them through validation and the
//! change decision. Cycles are single-flight; a second concurrent call
//! fails with [`DoclensError::AlreadyRunning`].

use super::deriver::{derive, DeriverSettings};
use super::rules::RuleStore;
use super::validator::{
    analyze_test, validate_rule_shape, ABController, ChangeDecision, ExperimentAnalysis,
    Recommendation, ValidationReport,
};
use crate::config::{Config, LearningConfig};
use crate::error::{DoclensError, Result};
use crate::evaluation::{
    analyze_patterns, analyze_style, effectiveness_report, EffectivenessReport, HeuristicScorer,
    PatternAnalysis, Scorer, StyleAnalysis,
};
use crate::healing::SelfHealer;
use crate::storage::{aggregate_sections, LedgerStatus, SessionLedger, TestStatus};
use crate::types::{CandidateRule, ExtractionRule, LearningMetadata, RuleSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Gap that splits two deliveries into separate activity runs
const ACTIVITY_GAP_HOURS: i64 = 1;

/// Confidence recorded on an adopted test rule that carried none
const ADOPTED_CONFIDENCE: f64 = 0.8;

/// Sections of the `defaults` rule written when the rule file has none
const DEFAULT_RULE_SECTIONS: [&str; 3] = ["overview", "example", "usage"];
const DEFAULT_RULE_TOKENS: i64 = 2000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringSummary {
    pub analyzed: usize,
    pub failures: usize,
    pub experiment_results: usize,
    pub budget_exhausted: bool,
}

/// What happened to a batch of candidate rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub validation: ValidationReport,
    pub rules_updated: Vec<String>,
    pub experiments_started: Vec<String>,
    pub skipped: Vec<String>,
    pub defaults_added: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningCycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub scoring: ScoringSummary,
    pub candidates: usize,
    pub applied: ApplyOutcome,
    pub style: StyleAnalysis,
    pub patterns: PatternAnalysis,
    pub effectiveness: EffectivenessReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizeReport {
    pub tests_completed: usize,
    pub tests_finalized: usize,
    pub rules_adopted: Vec<String>,
    pub old_tests_purged: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStatus {
    pub ledger: LedgerStatus,
    pub rules_file_exists: bool,
    pub rule_count: usize,
    pub active_experiments: usize,
    pub pending_experiments: usize,
}

pub struct LearningEngine {
    ledger: SessionLedger,
    controller: Arc<ABController>,
    rules: RuleStore,
    healer: SelfHealer,
    scorer: Arc<dyn Scorer>,
    settings: LearningConfig,
    min_group_sessions: usize,
    running: Mutex<()>,
}

impl LearningEngine {
    pub fn new(
        config: &Config,
        ledger: SessionLedger,
        controller: Arc<ABController>,
        rules: RuleStore,
        healer: SelfHealer,
    ) -> Self {
        Self {
            ledger,
            controller,
            rules,
            healer,
            scorer: Arc::new(HeuristicScorer::default()),
            settings: config.learning.clone(),
            min_group_sessions: config.ledger.min_group_sessions,
            running: Mutex::new(()),
        }
    }

    /// Replace the default heuristic scorer
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn controller(&self) -> &ABController {
        &self.controller
    }

    pub async fn run_cycle(&self) -> Result<LearningCycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<LearningCycleReport> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| DoclensError::AlreadyRunning)?;
        let started = Instant::now();
        info!("Starting learning cycle");

        let scoring = self
            .score_batch(self.settings.batch_size, now, started)
            .await?;

        let window = self
            .ledger
            .analyzed_in_window_at(self.settings.window_days, now)
            .await?;
        let style = analyze_style(&window, self.settings.window_days);

        let pattern_records = self
            .ledger
            .analyzed_in_window_at(self.settings.pattern_window_days, now)
            .await?;
        let patterns = analyze_patterns(
            &pattern_records,
            self.settings.pattern_window_days,
            chrono::Duration::hours(ACTIVITY_GAP_HOURS),
        );

        let aggregates = aggregate_sections(&window, self.min_group_sessions);
        let candidates = derive(
            &aggregates,
            style.documentation_preference,
            Some(&patterns),
            &DeriverSettings::from(&self.settings),
            now,
        );

        let applied = match self.apply_candidates_at(&candidates, now).await {
            Ok(outcome) => outcome,
            Err(DoclensError::Validation(errors)) => {
                warn!(errors = errors.len(), "Candidate rules rejected");
                ApplyOutcome {
                    validation: ValidationReport {
                        valid: false,
                        errors,
                        ..Default::default()
                    },
                    ..Default::default()
                }
            }
            Err(e) => return Err(e),
        };

        let report = LearningCycleReport {
            started_at: now,
            duration_ms: started.elapsed().as_millis() as u64,
            candidates: candidates.len(),
            effectiveness: effectiveness_report(&aggregates, self.settings.window_days, now),
            scoring,
            applied,
            style,
            patterns,
        };
        info!(
            analyzed = report.scoring.analyzed,
            rules_updated = report.applied.rules_updated.len(),
            experiments_started = report.applied.experiments_started.len(),
            "Learning cycle complete"
        );
        Ok(report)
    }

    /// Score up to `limit` pending deliveries without deriving rules
    pub async fn score_pending(&self, limit: usize) -> Result<ScoringSummary> {
        self.score_pending_at(limit, Utc::now()).await
    }

    pub async fn score_pending_at(&self, limit: usize, now: DateTime<Utc>) -> Result<ScoringSummary> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| DoclensError::AlreadyRunning)?;
        self.score_batch(limit, now, Instant::now()).await
    }

    /// Score unanalyzed deliveries; one failure never stops the batch
    async fn score_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        started: Instant,
    ) -> Result<ScoringSummary> {
        let batch = self.ledger.fetch_unanalyzed_at(limit, now).await?;
        let mut summary = ScoringSummary::default();

        for record in &batch {
            if started.elapsed() >= self.settings.time_budget {
                info!(remaining = batch.len() - summary.analyzed - summary.failures, "Scoring time budget exhausted");
                summary.budget_exhausted = true;
                break;
            }

            let effectiveness = self.scorer.score(record);
            if let Err(e) = self
                .ledger
                .record_analysis_at(
                    record.log_id,
                    effectiveness.score,
                    &effectiveness.reason,
                    effectiveness.confidence,
                    now,
                )
                .await
            {
                warn!(log_id = record.log_id, "Failed to record analysis: {}", e);
                summary.failures += 1;
                continue;
            }
            summary.analyzed += 1;

            match self
                .controller
                .record_session_at(record, effectiveness.score, now)
                .await
            {
                Ok(Some((test_id, arm))) => {
                    debug!(log_id = record.log_id, %test_id, arm = arm.as_str(), "Experiment result");
                    summary.experiment_results += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(log_id = record.log_id, "Failed to record experiment result: {}", e),
            }
        }

        Ok(summary)
    }

    /// Take the rule file lock and load the rules, routing an unreadable
    /// file through rule repair first
    async fn load_rules_locked(&self) -> Result<(MutexGuard<'_, ()>, RuleSet)> {
        let guard = self.rules.lock().await;
        match self.rules.load().await {
            Ok(rules) => return Ok((guard, rules)),
            Err(e) if e.is_corruption() => {
                warn!("Rule file unreadable, repairing: {}", e);
                drop(guard);
            }
            Err(e) => return Err(e),
        }

        self.healer.repair_rules().await?;
        let guard = self.rules.lock().await;
        let rules = self.rules.load().await?;
        Ok((guard, rules))
    }

    /// Validate a candidate batch and apply each candidate's decision
    ///
    /// An invalid batch applies nothing and fails with
    /// [`DoclensError::Validation`]. Pairs that are experimenting, or whose
    /// test awaits finalize, are skipped.
    pub async fn apply_candidates_at(
        &self,
        candidates: &[CandidateRule],
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let (_guard, mut rules) = self.load_rules_locked().await?;

        let validation = validate_rule_shape(&rules, candidates);
        if !validation.valid {
            return Err(DoclensError::Validation(validation.errors));
        }
        for warning in &validation.warnings {
            debug!("Rule change warning: {}", warning);
        }

        let mut outcome = ApplyOutcome {
            validation,
            ..Default::default()
        };
        let mut changed = !self.rules.exists().await?;

        for candidate in candidates {
            let (framework, operation) = (&candidate.framework, &candidate.operation);
            let pair = format!("{}:{}", framework, operation);

            match self.is_experimenting(framework, operation).await {
                Ok(false) => {}
                Ok(true) => {
                    outcome
                        .skipped
                        .push(format!("{} has an experiment in progress", pair));
                    continue;
                }
                Err(e) => {
                    warn!("Skipping {}: {}", pair, e);
                    outcome.skipped.push(format!("{}: {}", pair, e));
                    continue;
                }
            }

            let active = rules.get(framework, operation).cloned();
            match self.controller.decide(active.as_ref(), &candidate.rule) {
                ChangeDecision::Commit | ChangeDecision::Replace => {
                    rules.set(framework, operation, candidate.rule.clone());
                    outcome.rules_updated.push(pair);
                    changed = true;
                }
                ChangeDecision::Experiment => {
                    let control = active.unwrap_or_else(ExtractionRule::fallback);
                    match self
                        .controller
                        .start_experiment_at(framework, operation, control, candidate.rule.clone(), now)
                        .await
                    {
                        Ok(test) => outcome.experiments_started.push(test.test_id),
                        Err(e) => {
                            warn!("Could not start experiment for {}: {}", pair, e);
                            outcome.skipped.push(format!("{}: {}", pair, e));
                        }
                    }
                }
                ChangeDecision::Keep => debug!("Keeping active rule for {}", pair),
            }
        }

        if rules.defaults.is_none() {
            rules.defaults = Some(ExtractionRule::new(&DEFAULT_RULE_SECTIONS, DEFAULT_RULE_TOKENS));
            outcome.defaults_added = true;
            changed = true;
        }
        if changed {
            self.rules.save(&rules).await?;
        }
        Ok(outcome)
    }

    async fn is_experimenting(&self, framework: &str, operation: &str) -> Result<bool> {
        let store = self.controller.store();
        Ok(store.active_for(framework, operation).await?.is_some()
            || store.pending_for(framework, operation).await?.is_some())
    }

    pub async fn finalize(&self) -> Result<FinalizeReport> {
        self.finalize_at(Utc::now()).await
    }

    /// Complete expired tests, adopt winning test rules, mark every
    /// completed test finalized and purge old tests
    pub async fn finalize_at(&self, now: DateTime<Utc>) -> Result<FinalizeReport> {
        let store = self.controller.store();
        let settings = self.controller.settings();

        let mut report = FinalizeReport {
            tests_completed: store.complete_expired_at(now).await?.len(),
            ..Default::default()
        };

        let pending = store.completed_unfinalized().await?;
        if !pending.is_empty() {
            let (_guard, mut rules) = self.load_rules_locked().await?;

            let mut adopted = false;
            for test in &pending {
                let analysis = analyze_test(test, settings);
                if !(analysis.sufficient_data
                    && analysis.recommendation == Recommendation::AdoptTestRule)
                {
                    continue;
                }
                rules.set(&test.framework, &test.operation, adopted_rule(test, &analysis, now));
                report.rules_adopted.push(format!("{}:{}", test.framework, test.operation));
                adopted = true;
                info!(
                    test_id = %test.test_id,
                    improvement_pct = analysis.improvement_pct,
                    "Adopted test rule for {}:{}", test.framework, test.operation
                );
            }
            if adopted {
                self.rules.save(&rules).await?;
            }

            for test in &pending {
                if store.mark_finalized_at(&test.test_id, now).await? {
                    report.tests_finalized += 1;
                }
            }
        }

        let retention = chrono::Duration::from_std(settings.retention)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        report.old_tests_purged = store.purge_started_before(now - retention).await?;
        Ok(report)
    }

    pub async fn status(&self) -> Result<LearningStatus> {
        let tests = self.controller.store().list_all().await?;
        let rule_count = match self.rules.load().await {
            Ok(rules) => rules.rules().count(),
            Err(e) => {
                warn!("Rule file unreadable: {}", e);
                0
            }
        };

        Ok(LearningStatus {
            ledger: self.ledger.status().await?,
            rules_file_exists: self.rules.exists().await?,
            rule_count,
            active_experiments: tests
                .iter()
                .filter(|t| t.status == TestStatus::Active)
                .count(),
            pending_experiments: tests
                .iter()
                .filter(|t| t.status == TestStatus::Completed && t.finalized_at.is_none())
                .count(),
        })
    }

    pub async fn effectiveness(&self, days: i64) -> Result<EffectivenessReport> {
        let aggregates = self.ledger.aggregate_effectiveness(days).await?;
        Ok(effectiveness_report(&aggregates, days, Utc::now()))
    }

    pub async fn experiments(&self) -> Result<Vec<ExperimentAnalysis>> {
        self.controller.list_results().await
    }
}

fn adopted_rule(
    test: &crate::storage::ABTest,
    analysis: &ExperimentAnalysis,
    now: DateTime<Utc>,
) -> ExtractionRule {
    let previous = test.test_rule.metadata.as_ref();
    ExtractionRule {
        metadata: Some(LearningMetadata {
            confidence: previous.map_or(ADOPTED_CONFIDENCE, |m| m.confidence),
            based_on_sessions: previous.map_or(0, |m| m.based_on_sessions),
            last_updated: now,
            pattern_enhanced: previous.is_some_and(|m| m.pattern_enhanced),
            ab_test_winner: Some(true),
            test_id: Some(test.test_id.clone()),
            improvement_pct: Some(analysis.improvement_pct),
        }),
        ..test.test_rule.clone()
    }
}
