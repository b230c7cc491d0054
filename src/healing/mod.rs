//! Self-healing layer
//!
//! Detects and repairs structural corruption without ever failing a read:
//!
//! - **JSON repair**: ordered syntactic fixes for malformed payloads
//! - **Cache repair**: purge expired rows, repair or drop unreadable
//!   sections, correct drifted token counts
//! - **Rule repair**: recreate, restore or normalize the rule file
//! - **Database check**: required tables and indexes plus an integrity check
//!
//! Routines serialize with each other through the healer lock, and rule
//! repair additionally takes the rule file lock. Every run is recorded in
//! the healing event log; failures to record are only logged.

pub mod events;
pub mod json_repair;
pub mod rule_repair;

pub use events::{HealingEvent, HealingLog};
pub use json_repair::{repair_json, JsonFix, RepairFailure, RepairedJson};
pub use rule_repair::normalize_rule_document;

use crate::error::{DoclensError, Result};
use crate::learning::RuleStore;
use crate::storage::sqlite::{REQUIRED_INDEXES, REQUIRED_TABLES};
use crate::storage::{CacheStore, Database, ExperimentStore, RawCacheRow};
use crate::types::{token_count, RuleSet, Sections};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Relative token-count drift that triggers a correction
const TOKEN_DRIFT: f64 = 0.5;

/// Outcome of one repair routine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub validated: usize,
    pub corrupted: usize,
    pub repaired: usize,
    pub removed: usize,
    pub issues_found: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
}

impl RepairReport {
    fn issue(&mut self, message: String) {
        debug!("{}", message);
        self.issues_found.push(message);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub accessible: bool,
    pub missing_tables: Vec<String>,
    pub missing_indexes: Vec<String>,
    pub integrity: Option<String>,
    pub repairs_made: Vec<String>,
    pub issues_found: Vec<String>,
}

impl DatabaseHealth {
    pub fn integrity_ok(&self) -> bool {
        self.integrity.as_deref() == Some("ok")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    MinorIssues,
    NeedsAttention,
}

impl HealthVerdict {
    pub fn from_issue_count(issues: usize) -> Self {
        match issues {
            0 => HealthVerdict::Healthy,
            1..=3 => HealthVerdict::MinorIssues,
            _ => HealthVerdict::NeedsAttention,
        }
    }
}

/// Snapshot of the process-wide healing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealingMetrics {
    pub json_fixes: u64,
    pub cache_repairs: u64,
    pub rule_recoveries: u64,
    pub database_repairs: u64,
}

#[derive(Default)]
struct HealingCounters {
    json_fixes: AtomicU64,
    cache_repairs: AtomicU64,
    rule_recoveries: AtomicU64,
    database_repairs: AtomicU64,
}

impl HealingCounters {
    fn snapshot(&self) -> HealingMetrics {
        HealingMetrics {
            json_fixes: self.json_fixes.load(Ordering::Relaxed),
            cache_repairs: self.cache_repairs.load(Ordering::Relaxed),
            rule_recoveries: self.rule_recoveries.load(Ordering::Relaxed),
            database_repairs: self.database_repairs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub verdict: HealthVerdict,
    pub total_issues: usize,
    pub database: DatabaseHealth,
    pub cache: RepairReport,
    pub rules: RepairReport,
    pub experiments: RepairReport,
    pub metrics: HealingMetrics,
}

#[derive(Clone)]
pub struct SelfHealer {
    db: Database,
    cache: CacheStore,
    rules: RuleStore,
    experiments: ExperimentStore,
    log: HealingLog,
    lock: Arc<Mutex<()>>,
    counters: Arc<HealingCounters>,
}

impl SelfHealer {
    pub fn new(db: Database, cache: CacheStore, rules: RuleStore) -> Self {
        Self {
            log: HealingLog::new(db.clone()),
            experiments: ExperimentStore::new(db.clone()),
            db,
            cache,
            rules,
            lock: Arc::new(Mutex::new(())),
            counters: Arc::new(HealingCounters::default()),
        }
    }

    pub fn metrics(&self) -> HealingMetrics {
        self.counters.snapshot()
    }

    /// Recent healing events, newest first
    pub async fn history(&self, days: i64) -> Result<Vec<HealingEvent>> {
        self.log.history_at(days, Utc::now()).await
    }

    async fn record(&self, action: &str, details: Value, success: bool, now: DateTime<Utc>) {
        if let Err(e) = self.log.record_at(action, &details, success, now).await {
            warn!("Failed to record healing event {}: {}", action, e);
        }
    }

    /// Repair a payload, counting successful fixes
    pub fn heal_json(&self, input: &str) -> std::result::Result<RepairedJson, RepairFailure> {
        let repaired = repair_json(input)?;
        if repaired.was_repaired() {
            self.counters.json_fixes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(repaired)
    }

    pub async fn repair_cache(&self) -> Result<RepairReport> {
        self.repair_cache_at(Utc::now()).await
    }

    /// Validate every cache row, repairing what can be repaired
    ///
    /// Rows are checked against a snapshot; every write is conditional on
    /// the snapshotted state, so an entry refreshed by a concurrent put is
    /// left alone.
    pub async fn repair_cache_at(&self, now: DateTime<Utc>) -> Result<RepairReport> {
        let _guard = self.lock.lock().await;
        let mut report = RepairReport::default();

        for row in self.cache.list_raw().await? {
            self.repair_cache_row(&row, now, &mut report).await?;
        }

        self.counters
            .cache_repairs
            .fetch_add(report.repaired as u64, Ordering::Relaxed);
        self.record("cache_repair", json!(report), true, now).await;
        Ok(report)
    }

    async fn repair_cache_row(
        &self,
        row: &RawCacheRow,
        now: DateTime<Utc>,
        report: &mut RepairReport,
    ) -> Result<()> {
        report.validated += 1;
        let key = row.cache_key.as_str();

        if row.expires_at <= now.timestamp() {
            if self.cache.remove_expired(key, now).await? {
                report.removed += 1;
                report.issue(format!("Expired entry: {}", key));
            } else {
                debug!(cache_key = %key, "Entry refreshed since snapshot, kept");
            }
            return Ok(());
        }

        if let Err(e) = serde_json::from_str::<Sections>(&row.sections) {
            report.corrupted += 1;
            report.issue(format!("Corrupted sections in {}: {}", key, e));

            let healed = self
                .heal_json(&row.sections)
                .ok()
                .and_then(|r| serde_json::from_value::<Sections>(r.value).ok());
            match healed {
                Some(sections) => {
                    let fixed = serde_json::to_string(&sections)?;
                    if self.cache.replace_sections(key, &row.sections, &fixed).await? {
                        report.repaired += 1;
                        info!(cache_key = %key, "Repaired cache sections");
                    } else {
                        debug!(cache_key = %key, "Sections rewritten since snapshot, kept");
                        return Ok(());
                    }
                }
                None => {
                    if self.cache.remove_if_sections(key, &row.sections).await? {
                        report.removed += 1;
                        warn!(cache_key = %key, "Removed unrepairable cache entry");
                    }
                    return Ok(());
                }
            }
        }

        let actual = token_count(&row.full_content);
        let drift = (actual - row.total_tokens).abs() as f64;
        if drift > row.total_tokens as f64 * TOKEN_DRIFT
            && self
                .cache
                .correct_total_tokens(key, &row.full_content, row.total_tokens, actual)
                .await?
        {
            report.repaired += 1;
            report.issue(format!(
                "Fixed token count for {}: {} -> {}",
                key, row.total_tokens, actual
            ));
        }
        Ok(())
    }

    pub async fn repair_rules(&self) -> Result<RepairReport> {
        self.repair_rules_at(Utc::now()).await
    }

    /// Recreate, restore or normalize the rule file
    pub async fn repair_rules_at(&self, now: DateTime<Utc>) -> Result<RepairReport> {
        let _guard = self.lock.lock().await;
        let _rules_guard = self.rules.lock().await;
        let mut report = RepairReport::default();

        let result = self.repair_rules_locked(&mut report, now).await;
        let success = result.is_ok();
        if let Err(e) = &result {
            report.issue(format!("Rule repair failed: {}", e));
        }
        self.counters
            .rule_recoveries
            .fetch_add(report.repaired as u64, Ordering::Relaxed);
        self.record("rule_repair", json!(report), success, now).await;
        result.map(|_| report)
    }

    async fn repair_rules_locked(&self, report: &mut RepairReport, now: DateTime<Utc>) -> Result<()> {
        let Some(raw) = self.rules.read_raw().await? else {
            self.rules.save(&RuleSet::starter()).await?;
            report.repaired += 1;
            report.issue("Created default rules file".to_string());
            return Ok(());
        };

        let mut dirty = false;
        let mut document = match serde_json::from_str::<Value>(&raw) {
            Ok(value) => value,
            Err(e) => {
                report.corrupted += 1;
                report.issue(format!("Rules file is not valid JSON: {}", e));
                report.backup_path = Some(self.rules.write_backup(&raw, now).await?);
                dirty = true;

                match self.heal_json(&raw) {
                    Ok(repaired) => {
                        report.repaired += 1;
                        let fixes: Vec<&str> = repaired.fixes.iter().map(JsonFix::as_str).collect();
                        report.issue(format!("Repaired rules JSON: {}", fixes.join(", ")));
                        repaired.value
                    }
                    Err(failure) => {
                        report.repaired += 1;
                        report.issue(format!("Restored default rules: {}", failure));
                        Value::from(RuleSet::starter())
                    }
                }
            }
        };

        report.validated = document
            .as_object()
            .map_or(0, |root| root.values().map(|v| v.as_object().map_or(1, |o| o.len())).sum());

        let fixes = normalize_rule_document(&mut document);
        if !fixes.is_empty() {
            dirty = true;
            report.repaired += fixes.len();
            for fix in fixes {
                report.issue(fix);
            }
        }

        // The normalized document must now load
        RuleSet::try_from(document.clone())
            .map_err(|e| DoclensError::corruption("rule file", e.to_string()))?;

        if dirty {
            self.rules.save_value(&document).await?;
            info!(repairs = report.repaired, "Rewrote rule file");
        }
        Ok(())
    }

    pub async fn repair_experiments(&self) -> Result<RepairReport> {
        self.repair_experiments_at(Utc::now()).await
    }

    /// Take experiments whose stored rules no longer parse out of service
    pub async fn repair_experiments_at(&self, now: DateTime<Utc>) -> Result<RepairReport> {
        let _guard = self.lock.lock().await;
        let mut report = RepairReport {
            validated: self.experiments.count().await?,
            ..Default::default()
        };

        for test_id in self.experiments.retire_unreadable_at(now).await? {
            report.corrupted += 1;
            report.removed += 1;
            report.issue(format!("Retired unreadable experiment: {}", test_id));
        }

        self.record("experiment_repair", json!(report), true, now).await;
        Ok(report)
    }

    /// Check required schema objects and integrity, re-applying the schema
    /// when anything is missing
    pub async fn check_database(&self) -> Result<DatabaseHealth> {
        let now = Utc::now();
        let _guard = self.lock.lock().await;
        let mut health = DatabaseHealth {
            accessible: true,
            missing_tables: Vec::new(),
            missing_indexes: Vec::new(),
            integrity: None,
            repairs_made: Vec::new(),
            issues_found: Vec::new(),
        };

        let (tables, indexes) = match self.db.schema_objects().await {
            Ok(objects) => objects,
            Err(e) => {
                health.accessible = false;
                health.issues_found.push(format!("Database access error: {}", e));
                self.record("database_health", json!(health), false, now).await;
                return Ok(health);
            }
        };

        health.missing_tables = REQUIRED_TABLES
            .iter()
            .filter(|t| !tables.iter().any(|have| have == *t))
            .map(|t| t.to_string())
            .collect();
        health.missing_indexes = REQUIRED_INDEXES
            .iter()
            .filter(|i| !indexes.iter().any(|have| have == *i))
            .map(|i| i.to_string())
            .collect();
        for table in &health.missing_tables {
            health.issues_found.push(format!("Missing table {}", table));
        }
        for index in &health.missing_indexes {
            health.issues_found.push(format!("Missing index {}", index));
        }

        match self.db.integrity_check().await {
            Ok(verdict) => {
                if verdict != "ok" {
                    health
                        .issues_found
                        .push(format!("Database integrity issue: {}", verdict));
                }
                health.integrity = Some(verdict);
            }
            Err(e) => health
                .issues_found
                .push(format!("Integrity check failed: {}", e)),
        }

        if !health.missing_tables.is_empty() || !health.missing_indexes.is_empty() {
            match self.db.reapply_schema().await {
                Ok(()) => {
                    health.repairs_made.push("Re-applied database schema".to_string());
                    self.counters.database_repairs.fetch_add(1, Ordering::Relaxed);
                    info!("Re-applied database schema");
                }
                Err(e) => health
                    .issues_found
                    .push(format!("Schema repair failed: {}", e)),
            }
        }

        let ok = health.issues_found.is_empty();
        self.record("database_health", json!(health), ok, now).await;
        Ok(health)
    }

    /// Database check, cache repair and rule repair in one pass
    pub async fn run_comprehensive(&self) -> Result<HealthReport> {
        let database = self.check_database().await?;
        let cache = self.repair_cache().await?;
        let rules = self.repair_rules().await?;
        let experiments = self.repair_experiments().await?;

        let total_issues = database.issues_found.len()
            + cache.issues_found.len()
            + rules.issues_found.len()
            + experiments.issues_found.len();
        let verdict = HealthVerdict::from_issue_count(total_issues);
        info!(issues = total_issues, ?verdict, "Health check complete");

        Ok(HealthReport {
            timestamp: Utc::now(),
            verdict,
            total_issues,
            database,
            cache,
            rules,
            experiments,
            metrics: self.metrics(),
        })
    }
}
