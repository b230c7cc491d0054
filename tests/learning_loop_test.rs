//! End-to-end tests of scoring, derivation, experiments and finalize

mod common;

use chrono::{Duration, Utc};
use common::{append_scored, delivery, open_test_system};
use doclens_core::evaluation::DocPreference;
use doclens_core::learning::{derive, DeriverSettings, Recommendation};
use doclens_core::storage::TestStatus;
use doclens_core::{Arm, DoclensError, ExtractionRule, RuleSet};

#[tokio::test]
async fn test_hooks_sessions_aggregate_and_derive() {
    let system = open_test_system().await;
    let doclens = &system.doclens;
    let now = Utc::now();

    for score in [0.9, 0.8, 0.85] {
        append_scored(
            doclens,
            &delivery("react:button", "create", &["hooks"]),
            score,
            0.7,
            now - Duration::hours(3),
        )
        .await;
    }

    let aggregates = doclens
        .ledger()
        .aggregate_effectiveness_at(7, now)
        .await
        .unwrap();
    assert_eq!(aggregates.len(), 1);
    let hooks = &aggregates[0];
    assert_eq!(
        (hooks.framework.as_str(), hooks.operation.as_str(), hooks.section.as_str()),
        ("react", "create", "hooks")
    );
    assert!((hooks.avg_effectiveness - 0.85).abs() < 1e-9);
    assert_eq!(hooks.count, 3);

    let candidates = derive(
        &aggregates,
        DocPreference::Balanced,
        None,
        &DeriverSettings::default(),
        now,
    );
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].framework, "react");
    assert_eq!(candidates[0].operation, "create");
    assert!(candidates[0].rule.sections.contains(&"hooks".to_string()));
}

#[tokio::test]
async fn test_ab_improvement_recommends_adoption() {
    let system = open_test_system().await;
    let controller = system.doclens.controller();
    let start = Utc::now() - Duration::days(1);

    let test = controller
        .start_experiment_at(
            "react",
            "create",
            ExtractionRule::new(&["components", "example"], 2500),
            ExtractionRule::new(&["hooks", "example"], 1800),
            start,
        )
        .await
        .unwrap();

    for i in 0..25 {
        let at = start + Duration::minutes(i);
        assert!(controller
            .store()
            .record_result_at(&test.test_id, Arm::Control, 0.50, None, at)
            .await
            .unwrap());
        assert!(controller
            .store()
            .record_result_at(&test.test_id, Arm::Test, 0.56, None, at)
            .await
            .unwrap());
    }

    let analysis = controller.analyze(&test.test_id).await.unwrap().unwrap();
    assert_eq!(analysis.control_sessions, 25);
    assert_eq!(analysis.test_sessions, 25);
    assert_eq!(analysis.improvement_pct, 12.0);
    assert!(analysis.sufficient_data);
    assert_eq!(analysis.recommendation, Recommendation::AdoptTestRule);
}

#[tokio::test]
async fn test_second_active_experiment_for_pair_is_rejected() {
    let system = open_test_system().await;
    let controller = system.doclens.controller();
    let now = Utc::now();

    controller
        .start_experiment_at(
            "vue",
            "style",
            ExtractionRule::new(&["css"], 2000),
            ExtractionRule::new(&["styling"], 2000),
            now,
        )
        .await
        .unwrap();
    let second = controller
        .start_experiment_at(
            "vue",
            "style",
            ExtractionRule::new(&["css"], 2000),
            ExtractionRule::new(&["tailwind"], 2000),
            now + Duration::seconds(1),
        )
        .await;
    assert!(matches!(second, Err(DoclensError::ExperimentActive { .. })));
}

#[tokio::test]
async fn test_cycle_experiment_and_finalize() {
    let system = open_test_system().await;
    let doclens = &system.doclens;
    doclens.rules().save(&RuleSet::starter()).await.unwrap();
    let now = Utc::now();

    // Balanced scores give a 1500 token budget, far below the active 2500
    for score in [0.7, 0.75, 0.65] {
        append_scored(
            doclens,
            &delivery("react", "create", &["hooks", "example"]),
            score,
            0.7,
            now - Duration::hours(2),
        )
        .await;
    }

    let report = doclens.engine().run_cycle_at(now).await.unwrap();
    assert!(report.applied.validation.valid);
    assert_eq!(report.applied.experiments_started.len(), 1);
    let test_id = report.applied.experiments_started[0].clone();

    let test = doclens.controller().store().get(&test_id).await.unwrap().unwrap();
    assert_eq!(test.status, TestStatus::Active);
    assert_eq!(test.control_rule.max_tokens, 2500);
    assert!(test.test_rule.sections.contains(&"hooks".to_string()));
    assert!(test.test_rule.max_tokens < 2500);

    for i in 0..20 {
        let at = now + Duration::hours(i);
        let store = doclens.controller().store();
        store
            .record_result_at(&test_id, Arm::Control, 0.5, None, at)
            .await
            .unwrap();
        store
            .record_result_at(&test_id, Arm::Test, 0.7, None, at)
            .await
            .unwrap();
    }

    // Nothing to finalize while the test is still running
    let early = doclens.engine().finalize_at(now + Duration::days(1)).await.unwrap();
    assert_eq!(early.tests_completed, 0);
    assert!(early.rules_adopted.is_empty());

    let done = doclens.engine().finalize_at(now + Duration::days(8)).await.unwrap();
    assert_eq!(done.tests_completed, 1);
    assert_eq!(done.tests_finalized, 1);
    assert_eq!(done.rules_adopted, vec!["react:create"]);

    let rules = doclens.rules().load().await.unwrap();
    let adopted = rules.get("react", "create").unwrap();
    assert_eq!(adopted.sections, test.test_rule.sections);
    let meta = adopted.metadata.as_ref().unwrap();
    assert_eq!(meta.test_id.as_deref(), Some(test_id.as_str()));
    assert_eq!(meta.ab_test_winner, Some(true));

    // Past the retention window the test is purged
    let later = doclens.engine().finalize_at(now + Duration::days(31)).await.unwrap();
    assert_eq!(later.old_tests_purged, 1);
    assert!(doclens.controller().store().get(&test_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_learning_cycle_scores_pending_sessions() {
    let system = open_test_system().await;
    let doclens = &system.doclens;
    let now = Utc::now();

    let ledger = doclens.ledger();
    let good = ledger
        .append_at(&delivery("react:form", "create", &["hooks"]), now - Duration::hours(1))
        .await
        .unwrap();
    ledger
        .record_outcome(good, Some(true), &["tests_passed".to_string()])
        .await
        .unwrap();
    let bad = ledger
        .append_at(&delivery("react:form", "create", &["api"]), now - Duration::hours(1))
        .await
        .unwrap();
    ledger
        .record_outcome(bad, Some(false), &["error: build failed".to_string()])
        .await
        .unwrap();

    let report = doclens.engine().run_cycle_at(now).await.unwrap();
    assert_eq!(report.scoring.analyzed, 2);
    assert_eq!(report.scoring.failures, 0);

    let good = ledger.get(good).await.unwrap().unwrap();
    let bad = ledger.get(bad).await.unwrap().unwrap();
    assert!(good.effectiveness_score.unwrap() > bad.effectiveness_score.unwrap());

    // Analyzed records are never picked up again
    let again = doclens.engine().run_cycle_at(now).await.unwrap();
    assert_eq!(again.scoring.analyzed, 0);
    assert!(doclens.rules().exists().await.unwrap());
}
