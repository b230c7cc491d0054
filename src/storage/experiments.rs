//! Durable A/B test records
//!
//! One row per test in `ab_tests`, one row per scored session in
//! `ab_test_results`. A unique partial index keeps at most one active test
//! per (framework, operation); results are only accepted while a test is
//! active, so a completed test's arrays are frozen.

use crate::error::{DoclensError, Result};
use crate::storage::sqlite::Database;
use crate::types::{from_unix, Arm, ExtractionRule};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Active,
    Completed,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Active => "active",
            TestStatus::Completed => "completed",
        }
    }
}

/// A controlled experiment between the active rule and a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ABTest {
    pub test_id: String,
    pub framework: String,
    pub operation: String,
    pub control_rule: ExtractionRule,
    pub test_rule: ExtractionRule,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub traffic_split: f64,
    pub status: TestStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub control_effectiveness: Vec<f64>,
    pub test_effectiveness: Vec<f64>,
}

impl ABTest {
    pub fn control_sessions(&self) -> usize {
        self.control_effectiveness.len()
    }

    pub fn test_sessions(&self) -> usize {
        self.test_effectiveness.len()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.end_date
    }

    /// The rule served to a given arm
    pub fn rule_for(&self, arm: Arm) -> &ExtractionRule {
        match arm {
            Arm::Control => &self.control_rule,
            Arm::Test => &self.test_rule,
        }
    }
}

const TEST_COLUMNS: &str = "test_id, framework, operation, control_rule, test_rule, start_date,
     end_date, traffic_split, status, completed_at, finalized_at";

struct TestRow {
    test_id: String,
    framework: String,
    operation: String,
    control_rule: String,
    test_rule: String,
    start_date: i64,
    end_date: i64,
    traffic_split: f64,
    status: String,
    completed_at: Option<i64>,
    finalized_at: Option<i64>,
}

impl TestRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            test_id: row.get(0)?,
            framework: row.get(1)?,
            operation: row.get(2)?,
            control_rule: row.get(3)?,
            test_rule: row.get(4)?,
            start_date: row.get(5)?,
            end_date: row.get(6)?,
            traffic_split: row.get(7)?,
            status: row.get(8)?,
            completed_at: row.get(9)?,
            finalized_at: row.get(10)?,
        })
    }
}

fn parse_rules(row: &TestRow) -> Result<(ExtractionRule, ExtractionRule)> {
    let parse = |raw: &str, which: &str| -> Result<ExtractionRule> {
        serde_json::from_str(raw).map_err(|e| {
            DoclensError::corruption(format!("{} rule of {}", which, row.test_id), e.to_string())
        })
    };
    Ok((parse(&row.control_rule, "control")?, parse(&row.test_rule, "test")?))
}

/// Load full tests (with their result arrays) for the given WHERE clause.
/// Rows whose rules no longer parse are skipped; `retire_unreadable_at`
/// takes them out of service.
fn load_tests(
    conn: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ABTest>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ab_tests {} ORDER BY start_date ASC, test_id ASC",
        TEST_COLUMNS, where_clause
    ))?;
    let rows = stmt
        .query_map(args, TestRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut results_stmt =
        conn.prepare("SELECT arm, score FROM ab_test_results WHERE test_id = ? ORDER BY result_id")?;

    let mut tests = Vec::with_capacity(rows.len());
    for row in rows {
        let mut control = Vec::new();
        let mut test = Vec::new();
        let scores = results_stmt.query_map(params![row.test_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?;
        for score in scores {
            let (arm, value) = score?;
            match Arm::parse(&arm) {
                Some(Arm::Control) => control.push(value),
                Some(Arm::Test) => test.push(value),
                None => {}
            }
        }

        let (control_rule, test_rule) = match parse_rules(&row) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(test_id = %row.test_id, "Skipping unreadable experiment: {}", e);
                continue;
            }
        };

        tests.push(ABTest {
            control_rule,
            test_rule,
            test_id: row.test_id,
            framework: row.framework,
            operation: row.operation,
            start_date: from_unix(row.start_date),
            end_date: from_unix(row.end_date),
            traffic_split: row.traffic_split,
            status: if row.status == "completed" {
                TestStatus::Completed
            } else {
                TestStatus::Active
            },
            completed_at: row.completed_at.map(from_unix),
            finalized_at: row.finalized_at.map(from_unix),
            control_effectiveness: control,
            test_effectiveness: test,
        });
    }
    Ok(tests)
}

fn complete_expired_in(conn: &Connection, now_ts: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT test_id FROM ab_tests WHERE status = 'active' AND end_date < ?")?;
    let ids = stmt
        .query_map(params![now_ts], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    conn.execute(
        "UPDATE ab_tests SET status = 'completed', completed_at = ?
         WHERE status = 'active' AND end_date < ?",
        params![now_ts, now_ts],
    )?;
    Ok(ids)
}

/// A/B test persistence
#[derive(Clone)]
pub struct ExperimentStore {
    db: Database,
}

impl ExperimentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new active test; fails if the pair already has one
    pub async fn create(&self, test: &ABTest) -> Result<()> {
        let control = serde_json::to_string(&test.control_rule)?;
        let candidate = serde_json::to_string(&test.test_rule)?;
        let t = test.clone();

        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let active: Option<String> = tx
                    .query_row(
                        "SELECT test_id FROM ab_tests
                         WHERE framework = ? AND operation = ? AND status = 'active'",
                        params![t.framework, t.operation],
                        |row| row.get(0),
                    )
                    .optional()?;
                if active.is_some() {
                    return Err(DoclensError::ExperimentActive {
                        framework: t.framework,
                        operation: t.operation,
                    });
                }

                // Any remaining constraint failure (a test id clash) is a storage error
                tx.execute(
                    "INSERT INTO ab_tests
                     (test_id, framework, operation, control_rule, test_rule, start_date,
                      end_date, traffic_split, status)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active')",
                    params![
                        t.test_id,
                        t.framework,
                        t.operation,
                        control,
                        candidate,
                        t.start_date.timestamp(),
                        t.end_date.timestamp(),
                        t.traffic_split
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        info!(test_id = %test.test_id, "Started experiment for {}:{}", test.framework, test.operation);
        Ok(())
    }

    pub async fn get(&self, test_id: &str) -> Result<Option<ABTest>> {
        let test_id = test_id.to_string();
        self.db
            .interact(move |conn| {
                Ok(load_tests(conn, "WHERE test_id = ?", params![test_id])?.pop())
            })
            .await
    }

    pub async fn active_for(&self, framework: &str, operation: &str) -> Result<Option<ABTest>> {
        self.find_for(framework, operation, "AND status = 'active'")
            .await
    }

    /// A completed test that finalize has not handled yet
    pub async fn pending_for(&self, framework: &str, operation: &str) -> Result<Option<ABTest>> {
        self.find_for(
            framework,
            operation,
            "AND status = 'completed' AND finalized_at IS NULL",
        )
        .await
    }

    async fn find_for(
        &self,
        framework: &str,
        operation: &str,
        extra: &'static str,
    ) -> Result<Option<ABTest>> {
        let framework = framework.to_string();
        let operation = operation.to_string();
        self.db
            .interact(move |conn| {
                let clause = format!("WHERE framework = ? AND operation = ? {}", extra);
                Ok(load_tests(conn, &clause, params![framework, operation])?.pop())
            })
            .await
    }

    pub async fn list_all(&self) -> Result<Vec<ABTest>> {
        self.db.interact(|conn| load_tests(conn, "", params![])).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.db
            .interact(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM ab_tests", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await
    }

    pub async fn completed_unfinalized(&self) -> Result<Vec<ABTest>> {
        self.db
            .interact(|conn| {
                load_tests(
                    conn,
                    "WHERE status = 'completed' AND finalized_at IS NULL",
                    params![],
                )
            })
            .await
    }

    /// Append a scored session to one arm. Expired tests are completed
    /// first; returns false when the test no longer accepts results.
    pub async fn record_result_at(
        &self,
        test_id: &str,
        arm: Arm,
        score: f64,
        log_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let test_id = test_id.to_string();
        let now_ts = now.timestamp();

        let recorded = self
            .db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                complete_expired_in(&tx, now_ts)?;
                let inserted = tx.execute(
                    "INSERT INTO ab_test_results (test_id, arm, score, log_id, recorded_at)
                     SELECT test_id, ?, ?, ?, ? FROM ab_tests
                     WHERE test_id = ? AND status = 'active'",
                    params![arm.as_str(), score, log_id, now_ts, test_id],
                )?;
                tx.commit()?;
                Ok(inserted > 0)
            })
            .await?;

        debug!(recorded, arm = arm.as_str(), score, "Experiment result");
        Ok(recorded)
    }

    /// Complete every active test whose end date has passed
    pub async fn complete_expired_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let now_ts = now.timestamp();
        let ids = self
            .db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let ids = complete_expired_in(&tx, now_ts)?;
                tx.commit()?;
                Ok(ids)
            })
            .await?;

        for id in &ids {
            info!(test_id = %id, "Experiment completed");
        }
        Ok(ids)
    }

    pub async fn mark_finalized_at(&self, test_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let test_id = test_id.to_string();
        let now_ts = now.timestamp();
        self.db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE ab_tests SET finalized_at = ?
                     WHERE test_id = ? AND status = 'completed' AND finalized_at IS NULL",
                    params![now_ts, test_id],
                )? > 0)
            })
            .await
    }

    /// Complete and finalize every unfinalized test whose rules no longer
    /// parse, freeing its pair for new experiments. Returns the retired ids.
    pub async fn retire_unreadable_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let now_ts = now.timestamp();
        let retired = self
            .db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let rows = {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {} FROM ab_tests WHERE finalized_at IS NULL",
                        TEST_COLUMNS
                    ))?;
                    let rows = stmt
                        .query_map([], TestRow::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };

                let mut retired = Vec::new();
                for row in rows {
                    if parse_rules(&row).is_ok() {
                        continue;
                    }
                    tx.execute(
                        "UPDATE ab_tests
                         SET status = 'completed', completed_at = COALESCE(completed_at, ?),
                             finalized_at = ?
                         WHERE test_id = ?",
                        params![now_ts, now_ts, row.test_id],
                    )?;
                    retired.push(row.test_id);
                }
                tx.commit()?;
                Ok(retired)
            })
            .await?;

        for id in &retired {
            warn!(test_id = %id, "Retired unreadable experiment");
        }
        Ok(retired)
    }

    /// Delete tests (and their results) started before `cutoff`
    pub async fn purge_started_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_ts = cutoff.timestamp();
        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM ab_test_results WHERE test_id IN
                     (SELECT test_id FROM ab_tests WHERE start_date < ?)",
                    params![cutoff_ts],
                )?;
                let removed =
                    tx.execute("DELETE FROM ab_tests WHERE start_date < ?", params![cutoff_ts])?;
                tx.commit()?;
                Ok(removed)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::test_support::create_test_db;
    use chrono::Duration as ChronoDuration;

    fn sample_test(id: &str, start: DateTime<Utc>) -> ABTest {
        ABTest {
            test_id: id.to_string(),
            framework: "react".to_string(),
            operation: "create".to_string(),
            control_rule: ExtractionRule::new(&["overview", "example"], 2000),
            test_rule: ExtractionRule::new(&["hooks", "example"], 3000),
            start_date: start,
            end_date: start + ChronoDuration::days(7),
            traffic_split: 0.5,
            status: TestStatus::Active,
            completed_at: None,
            finalized_at: None,
            control_effectiveness: vec![],
            test_effectiveness: vec![],
        }
    }

    #[tokio::test]
    async fn test_one_active_test_per_pair() {
        let (db, _temp) = create_test_db().await;
        let store = ExperimentStore::new(db);
        let now = Utc::now();

        store.create(&sample_test("test_aaaa0001", now)).await.unwrap();
        let err = store
            .create(&sample_test("test_aaaa0002", now))
            .await
            .unwrap_err();
        assert!(matches!(err, DoclensError::ExperimentActive { .. }));

        let active = store.active_for("react", "create").await.unwrap().unwrap();
        assert_eq!(active.test_id, "test_aaaa0001");
    }

    #[tokio::test]
    async fn test_test_id_clash_is_not_reported_as_active_experiment() {
        let (db, _temp) = create_test_db().await;
        let store = ExperimentStore::new(db);
        let now = Utc::now();

        store.create(&sample_test("test_aaaa0001", now)).await.unwrap();
        let mut other_pair = sample_test("test_aaaa0001", now);
        other_pair.framework = "vue".to_string();

        let err = store.create(&other_pair).await.unwrap_err();
        assert!(matches!(err, DoclensError::Storage(_)));
        assert!(store.active_for("vue", "create").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_test_is_skipped_and_retired() {
        let (db, _temp) = create_test_db().await;
        let store = ExperimentStore::new(db.clone());
        let now = Utc::now();

        store.create(&sample_test("test_good0001", now)).await.unwrap();
        let mut broken = sample_test("test_bad00001", now);
        broken.framework = "vue".to_string();
        store.create(&broken).await.unwrap();
        db.interact(|conn| {
            conn.execute(
                "UPDATE ab_tests SET control_rule = '{bad' WHERE test_id = 'test_bad00001'",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let listed: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.test_id)
            .collect();
        assert_eq!(listed, vec!["test_good0001"]);
        assert!(store.get("test_bad00001").await.unwrap().is_none());

        // Completing both leaves the healthy one finalizable
        let later = now + ChronoDuration::days(8);
        assert_eq!(store.complete_expired_at(later).await.unwrap().len(), 2);
        let pending: Vec<String> = store
            .completed_unfinalized()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.test_id)
            .collect();
        assert_eq!(pending, vec!["test_good0001"]);

        assert_eq!(store.retire_unreadable_at(later).await.unwrap(), vec!["test_bad00001"]);
        assert!(store.retire_unreadable_at(later).await.unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retired_test_frees_its_pair() {
        let (db, _temp) = create_test_db().await;
        let store = ExperimentStore::new(db.clone());
        let now = Utc::now();

        store.create(&sample_test("test_bad00002", now)).await.unwrap();
        db.interact(|conn| {
            conn.execute(
                "UPDATE ab_tests SET test_rule = 'null' WHERE test_id = 'test_bad00002'",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        assert!(store.active_for("react", "create").await.unwrap().is_none());

        store.retire_unreadable_at(now).await.unwrap();
        store.create(&sample_test("test_next0001", now)).await.unwrap();
        let active = store.active_for("react", "create").await.unwrap().unwrap();
        assert_eq!(active.test_id, "test_next0001");
    }

    #[tokio::test]
    async fn test_results_accumulate_per_arm() {
        let (db, _temp) = create_test_db().await;
        let store = ExperimentStore::new(db);
        let now = Utc::now();
        store.create(&sample_test("test_b", now)).await.unwrap();

        assert!(store
            .record_result_at("test_b", Arm::Control, 0.5, Some(1), now)
            .await
            .unwrap());
        assert!(store
            .record_result_at("test_b", Arm::Test, 0.7, Some(2), now)
            .await
            .unwrap());
        assert!(store
            .record_result_at("test_b", Arm::Test, 0.6, None, now)
            .await
            .unwrap());

        let test = store.get("test_b").await.unwrap().unwrap();
        assert_eq!(test.control_sessions(), 1);
        assert_eq!(test.test_effectiveness, vec![0.7, 0.6]);
        assert_eq!(test.test_rule.max_tokens, 3000);
    }

    #[tokio::test]
    async fn test_completed_results_are_frozen() {
        let (db, _temp) = create_test_db().await;
        let store = ExperimentStore::new(db);
        let start = Utc::now() - ChronoDuration::days(8);
        store.create(&sample_test("test_c", start)).await.unwrap();

        let recorded = store
            .record_result_at("test_c", Arm::Test, 0.9, None, Utc::now())
            .await
            .unwrap();
        assert!(!recorded);

        let test = store.get("test_c").await.unwrap().unwrap();
        assert_eq!(test.status, TestStatus::Completed);
        assert!(test.test_effectiveness.is_empty());
        assert!(store.active_for("react", "create").await.unwrap().is_none());
        assert!(store.pending_for("react", "create").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_finalize_and_purge() {
        let (db, _temp) = create_test_db().await;
        let store = ExperimentStore::new(db);
        let now = Utc::now();
        store
            .create(&sample_test("test_old", now - ChronoDuration::days(40)))
            .await
            .unwrap();

        let completed = store.complete_expired_at(now).await.unwrap();
        assert_eq!(completed, vec!["test_old".to_string()]);

        assert!(store.mark_finalized_at("test_old", now).await.unwrap());
        assert!(!store.mark_finalized_at("test_old", now).await.unwrap());
        assert!(store.completed_unfinalized().await.unwrap().is_empty());

        let purged = store
            .purge_started_before(now - ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
