//! Doclens - a self-tuning documentation cache
//!
//! Caches framework documentation split into named sections, serves the
//! minimal relevant subset under a token budget, and continuously revises
//! which sections to serve from the observed effectiveness of past
//! deliveries.
//!
//! # Architecture
//!
//! - **Storage**: SQLite cache, session ledger and A/B test records
//! - **Delivery**: rule lookup, section selection, ledger append
//! - **Evaluation**: effectiveness scoring, style and pattern analysis
//! - **Learning**: rule derivation, validation, experiments, finalize
//! - **Healing**: repair of corrupted cache rows and rule files
//!
//! # Example
//!
//! ```ignore
//! use doclens_core::{Config, DeliveryRequest, Doclens};
//!
//! #[tokio::main]
//! async fn main() -> doclens_core::Result<()> {
//!     let doclens = Doclens::open(Config::resolve(None)?).await?;
//!
//!     doclens
//!         .delivery()
//!         .store_document("react", Some("button"), "# Hooks\nuseState...")
//!         .await?;
//!
//!     let delivery = doclens
//!         .deliver(&DeliveryRequest {
//!             framework: "react".to_string(),
//!             operation: "create".to_string(),
//!             component: Some("button".to_string()),
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     // Later, score deliveries and revise the rules
//!     let report = doclens.engine().run_cycle().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod evaluation;
pub mod export;
pub mod healing;
pub mod learning;
pub mod storage;
pub mod system;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use delivery::{
    select_sections, Classification, Classifier, Delivery, DeliveryRequest, DeliveryService,
    MarkdownSplitter, SectionSplitter,
};
pub use error::{DoclensError, Result};
pub use evaluation::{HeuristicScorer, Scorer};
pub use healing::{HealthReport, HealthVerdict, SelfHealer};
pub use learning::{ABController, LearningEngine, RuleStore};
pub use storage::{CacheStore, Database, ExperimentStore, SessionLedger};
pub use system::Doclens;
pub use types::{
    Arm, CacheEntry, CacheKey, CandidateRule, ExtractionRule, NewSession, RuleSet, Sections,
    SessionRecord,
};
