//! Common test utilities and helpers

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use doclens_core::{Config, Doclens, NewSession};
use tempfile::TempDir;

/// An opened system whose database and rule file live in a temp dir
pub struct TestSystem {
    pub doclens: Doclens,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.db_path = dir.path().join("doclens.db");
    config.storage.rules_path = dir.path().join("rules.json");
    config
}

pub async fn open_test_system() -> TestSystem {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let doclens = Doclens::open(test_config(&dir))
        .await
        .expect("Failed to open test system");
    TestSystem { doclens, dir }
}

pub fn delivery(key: &str, operation: &str, sections: &[&str]) -> NewSession {
    NewSession {
        session_id: "test0001".to_string(),
        cache_key: key.to_string(),
        operation_type: operation.to_string(),
        sections_provided: sections.iter().map(|s| s.to_string()).collect(),
        tokens_used: 1200,
        tool_name: "Write".to_string(),
        tool_input: "{}".to_string(),
        ..Default::default()
    }
}

/// Append a delivery and record a fixed analysis for it
pub async fn append_scored(
    doclens: &Doclens,
    session: &NewSession,
    score: f64,
    confidence: f64,
    at: DateTime<Utc>,
) -> i64 {
    let log_id = doclens
        .ledger()
        .append_at(session, at)
        .await
        .expect("append failed");
    doclens
        .ledger()
        .record_analysis_at(log_id, score, "fixed", confidence, at)
        .await
        .expect("analysis failed");
    log_id
}
