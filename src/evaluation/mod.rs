//! Evaluation of delivered documentation
//!
//! - **Scorer**: judges one delivery from its structured outcome signals
//! - **Style**: usage style over a window, which scales token budgets
//! - **Patterns**: operation sequences, used as predictive rule hints
//! - **Report**: per framework/operation effectiveness summary

pub mod patterns;
pub mod report;
pub mod scorer;
pub mod style;

pub use patterns::{analyze_patterns, PatternAnalysis, PreloadRecommendation};
pub use report::{effectiveness_report, EffectivenessReport, OperationPerformance};
pub use scorer::{Effectiveness, HeuristicScorer, Scorer};
pub use style::{analyze_style, DocPreference, StyleAnalysis};
