//! Rule learning
//!
//! Scored deliveries are aggregated into candidate extraction rules, which
//! are validated and either committed to the rule file directly or gated
//! behind an A/B experiment.
//!
//! - **Rules**: the JSON rule file and its writer lock
//! - **Deriver**: aggregates to candidate rules
//! - **Validator**: shape checks, the change decision and the A/B controller
//! - **Engine**: the learning cycle and the finalize step

pub mod deriver;
pub mod engine;
pub mod rules;
pub mod validator;

pub use deriver::{derive, DeriverSettings, DEFAULT_PADDING};
pub use engine::{
    ApplyOutcome, FinalizeReport, LearningCycleReport, LearningEngine, LearningStatus,
    ScoringSummary,
};
pub use rules::RuleStore;
pub use validator::{
    analyze_test, generate_test_id, validate_rule_shape, ABController, ChangeDecision,
    ExperimentAnalysis, Recommendation, ValidationReport, ValidationSummary,
};
