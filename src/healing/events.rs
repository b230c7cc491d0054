//! Persistent log of healing actions, capped at the newest rows

use crate::error::Result;
use crate::storage::Database;
use crate::types::from_unix;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rows kept in `healing_events`
pub const MAX_EVENTS: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingEvent {
    pub event_id: i64,
    pub action: String,
    pub details: Value,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HealingLog {
    db: Database,
}

impl HealingLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event and drop everything beyond the newest [`MAX_EVENTS`]
    pub async fn record_at(
        &self,
        action: &str,
        details: &Value,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let action = action.to_string();
        let details = serde_json::to_string(details)?;
        let now_ts = now.timestamp();

        self.db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO healing_events (action, details, success, timestamp)
                     VALUES (?, ?, ?, ?)",
                    params![action, details, success, now_ts],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "DELETE FROM healing_events WHERE event_id NOT IN
                     (SELECT event_id FROM healing_events ORDER BY event_id DESC LIMIT ?)",
                    params![MAX_EVENTS],
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await
    }

    /// Events of the last `days` days, newest first
    pub async fn history_at(&self, days: i64, now: DateTime<Utc>) -> Result<Vec<HealingEvent>> {
        let cutoff = (now - Duration::days(days)).timestamp();
        self.db
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_id, action, details, success, timestamp FROM healing_events
                     WHERE timestamp >= ? ORDER BY timestamp DESC, event_id DESC",
                )?;
                let rows = stmt
                    .query_map(params![cutoff], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                Ok(rows
                    .into_iter()
                    .map(|(event_id, action, details, success, ts)| HealingEvent {
                        event_id,
                        action,
                        details: serde_json::from_str(&details).unwrap_or(Value::String(details)),
                        success,
                        timestamp: from_unix(ts),
                    })
                    .collect())
            })
            .await
    }
}
