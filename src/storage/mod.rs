//! Storage layer for Doclens
//!
//! SQLite-backed persistence for cache entries, the delivery ledger and A/B
//! test records. All three share one pooled [`Database`].

pub mod cache;
pub mod experiments;
pub mod ledger;
pub mod sqlite;

pub use cache::{CacheStats, CacheStore, RawCacheRow};
pub use experiments::{ABTest, ExperimentStore, TestStatus};
pub use ledger::{aggregate_sections, LedgerStatus, SectionAggregate, SessionLedger};
pub use sqlite::Database;
