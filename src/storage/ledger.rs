//! Session ledger: append-only log of deliveries, later annotated with
//! outcome signals and effectiveness analysis

use crate::error::{DoclensError, Result};
use crate::storage::sqlite::Database;
use crate::types::{framework_of, from_unix, Arm, NewSession, SessionRecord};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

const RECORD_COLUMNS: &str = "log_id, session_id, cache_key, operation_type, sections_provided,
     tokens_used, tool_name, tool_input, file_path, timestamp, session_complete,
     follow_up_actions, effectiveness_score, effectiveness_reason, confidence_score,
     analyzed_at, experiment_id, experiment_arm";

/// Mean effectiveness of one section within a (framework, operation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionAggregate {
    pub framework: String,
    pub operation: String,
    pub section: String,
    pub avg_effectiveness: f64,
    pub avg_confidence: f64,
    pub count: usize,
}

/// Counts describing how much the ledger has learned from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub total_sessions: i64,
    pub unanalyzed_sessions: i64,
    pub analyzed_sessions: i64,
    pub recent_sessions: i64,
    pub avg_effectiveness: Option<f64>,
}

fn parse_list(log_id: i64, column: &str, raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(log_id, "Unreadable {} payload, treating as empty: {}", column, e);
        Vec::new()
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let log_id: i64 = row.get(0)?;
    let sections: String = row.get(4)?;
    let follow_ups: Option<String> = row.get(11)?;
    let arm: Option<String> = row.get(17)?;

    Ok(SessionRecord {
        log_id,
        session_id: row.get(1)?,
        cache_key: row.get(2)?,
        operation_type: row.get(3)?,
        sections_provided: parse_list(log_id, "sections_provided", &sections),
        tokens_used: row.get(5)?,
        tool_name: row.get(6)?,
        tool_input: row.get(7)?,
        file_path: row.get(8)?,
        timestamp: from_unix(row.get(9)?),
        session_complete: row.get::<_, Option<i64>>(10)?.map(|v| v != 0),
        follow_up_actions: follow_ups.map(|raw| parse_list(log_id, "follow_up_actions", &raw)),
        effectiveness_score: row.get(12)?,
        effectiveness_reason: row.get(13)?,
        confidence_score: row.get(14)?,
        analyzed_at: row.get::<_, Option<i64>>(15)?.map(from_unix),
        experiment_id: row.get(16)?,
        experiment_arm: arm.as_deref().and_then(Arm::parse),
    })
}

/// Append-only delivery log
#[derive(Clone)]
pub struct SessionLedger {
    db: Database,
    grace_period: Duration,
    min_group_sessions: usize,
}

impl SessionLedger {
    pub fn new(db: Database, grace_period: Duration, min_group_sessions: usize) -> Self {
        Self {
            db,
            grace_period,
            min_group_sessions,
        }
    }

    pub async fn append(&self, session: &NewSession) -> Result<i64> {
        self.append_at(session, Utc::now()).await
    }

    /// Record one delivery and return its log id
    pub async fn append_at(&self, session: &NewSession, timestamp: DateTime<Utc>) -> Result<i64> {
        if session.session_id.is_empty() || session.cache_key.is_empty() {
            return Err(DoclensError::Other(
                "session_id and cache_key are required".to_string(),
            ));
        }

        let sections = serde_json::to_string(&session.sections_provided)?;
        let s = session.clone();
        let ts = timestamp.timestamp();

        let log_id = self
            .db
            .interact(move |conn| {
                let (experiment_id, arm) = match &s.experiment {
                    Some((id, arm)) => (Some(id.clone()), Some(arm.as_str())),
                    None => (None, None),
                };
                conn.execute(
                    "INSERT INTO session_logs
                     (session_id, cache_key, operation_type, sections_provided, tokens_used,
                      tool_name, tool_input, file_path, timestamp, experiment_id, experiment_arm)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        s.session_id,
                        s.cache_key,
                        s.operation_type,
                        sections,
                        s.tokens_used,
                        s.tool_name,
                        s.tool_input,
                        s.file_path,
                        ts,
                        experiment_id,
                        arm
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(log_id, session_id = %session.session_id, "Logged delivery");
        Ok(log_id)
    }

    /// Attach outcome signals; later calls overwrite earlier ones
    pub async fn record_outcome(
        &self,
        log_id: i64,
        complete: Option<bool>,
        follow_up_actions: &[String],
    ) -> Result<()> {
        let follow_ups = serde_json::to_string(follow_up_actions)?;
        let updated = self
            .db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE session_logs SET session_complete = ?, follow_up_actions = ?
                     WHERE log_id = ?",
                    params![complete.map(i64::from), follow_ups, log_id],
                )?)
            })
            .await?;

        if updated == 0 {
            return Err(DoclensError::NotFound(format!("session log {}", log_id)));
        }
        debug!(log_id, ?complete, "Recorded outcome");
        Ok(())
    }

    pub async fn record_analysis(
        &self,
        log_id: i64,
        score: f64,
        reason: &str,
        confidence: f64,
    ) -> Result<()> {
        self.record_analysis_at(log_id, score, reason, confidence, Utc::now())
            .await
    }

    /// Store scoring results. The first analysis time is kept, so a record
    /// stays analyzed once it has been analyzed.
    pub async fn record_analysis_at(
        &self,
        log_id: i64,
        score: f64,
        reason: &str,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reason = reason.to_string();
        let now_ts = now.timestamp();
        let updated = self
            .db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE session_logs
                     SET effectiveness_score = ?, effectiveness_reason = ?, confidence_score = ?,
                         analyzed_at = COALESCE(analyzed_at, ?)
                     WHERE log_id = ?",
                    params![score, reason, confidence, now_ts, log_id],
                )?)
            })
            .await?;

        if updated == 0 {
            return Err(DoclensError::NotFound(format!("session log {}", log_id)));
        }
        Ok(())
    }

    pub async fn get(&self, log_id: i64) -> Result<Option<SessionRecord>> {
        self.db
            .interact(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {} FROM session_logs WHERE log_id = ?", RECORD_COLUMNS),
                        params![log_id],
                        row_to_record,
                    )
                    .optional()?)
            })
            .await
    }

    /// Most recent delivery logged under an opaque session token
    pub async fn latest_for_session(&self, session_id: &str) -> Result<Option<i64>> {
        let session_id = session_id.to_string();
        self.db
            .interact(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT log_id FROM session_logs WHERE session_id = ?
                         ORDER BY timestamp DESC, log_id DESC LIMIT 1",
                        params![session_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
    }

    pub async fn fetch_unanalyzed(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        self.fetch_unanalyzed_at(limit, Utc::now()).await
    }

    /// Unanalyzed records past the grace period, oldest first
    pub async fn fetch_unanalyzed_at(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>> {
        let cutoff = now.timestamp() - self.grace_period.as_secs() as i64;
        let limit = limit as i64;
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM session_logs
                     WHERE analyzed_at IS NULL AND timestamp < ?
                     ORDER BY timestamp ASC, log_id ASC
                     LIMIT ?",
                    RECORD_COLUMNS
                ))?;
                let records = stmt
                    .query_map(params![cutoff, limit], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await
    }

    pub async fn analyzed_in_window(&self, days: i64) -> Result<Vec<SessionRecord>> {
        self.analyzed_in_window_at(days, Utc::now()).await
    }

    /// Analyzed records delivered within the last `days`, oldest first
    pub async fn analyzed_in_window_at(
        &self,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>> {
        let since = (now - ChronoDuration::days(days)).timestamp();
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM session_logs
                     WHERE effectiveness_score IS NOT NULL AND timestamp > ?
                     ORDER BY timestamp ASC, log_id ASC",
                    RECORD_COLUMNS
                ))?;
                let records = stmt
                    .query_map(params![since], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await
    }

    pub async fn aggregate_effectiveness(&self, window_days: i64) -> Result<Vec<SectionAggregate>> {
        self.aggregate_effectiveness_at(window_days, Utc::now())
            .await
    }

    /// Per-section effectiveness grouped by (framework, operation, section).
    /// A record contributes once to every section it delivered; groups
    /// backed by fewer than `min_group_sessions` records are dropped.
    pub async fn aggregate_effectiveness_at(
        &self,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<SectionAggregate>> {
        let records = self.analyzed_in_window_at(window_days, now).await?;
        Ok(aggregate_sections(&records, self.min_group_sessions))
    }

    pub async fn status(&self) -> Result<LedgerStatus> {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> Result<LedgerStatus> {
        let week_ago = (now - ChronoDuration::days(7)).timestamp();
        self.db
            .interact(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN analyzed_at IS NULL THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN timestamp > ? THEN 1 ELSE 0 END), 0),
                            AVG(effectiveness_score)
                     FROM session_logs",
                    params![week_ago],
                    |row| {
                        let total: i64 = row.get(0)?;
                        let unanalyzed: i64 = row.get(1)?;
                        Ok(LedgerStatus {
                            total_sessions: total,
                            unanalyzed_sessions: unanalyzed,
                            analyzed_sessions: total - unanalyzed,
                            recent_sessions: row.get(2)?,
                            avg_effectiveness: row.get(3)?,
                        })
                    },
                )?)
            })
            .await
    }
}

/// Group scored records by (framework, operation, section)
pub fn aggregate_sections(records: &[SessionRecord], min_sessions: usize) -> Vec<SectionAggregate> {
    #[derive(Default)]
    struct Acc {
        score: f64,
        confidence: f64,
        count: usize,
    }

    let mut groups: BTreeMap<(String, String, String), Acc> = BTreeMap::new();
    for record in records {
        let Some(score) = record.effectiveness_score else {
            continue;
        };
        let framework = framework_of(&record.cache_key).to_string();
        let unique: BTreeSet<&String> = record.sections_provided.iter().collect();
        for section in unique {
            let acc = groups
                .entry((
                    framework.clone(),
                    record.operation_type.clone(),
                    section.clone(),
                ))
                .or_default();
            acc.score += score;
            acc.confidence += record.confidence_score.unwrap_or(0.0);
            acc.count += 1;
        }
    }

    let mut aggregates: Vec<SectionAggregate> = groups
        .into_iter()
        .filter(|(_, acc)| acc.count >= min_sessions)
        .map(|((framework, operation, section), acc)| SectionAggregate {
            framework,
            operation,
            section,
            avg_effectiveness: acc.score / acc.count as f64,
            avg_confidence: acc.confidence / acc.count as f64,
            count: acc.count,
        })
        .collect();

    aggregates.sort_by(|a, b| {
        (&a.framework, &a.operation)
            .cmp(&(&b.framework, &b.operation))
            .then(b.avg_effectiveness.total_cmp(&a.avg_effectiveness))
    });
    aggregates
}
