//! Cache store: sectioned documentation entries with TTL and access counts

use crate::error::{DoclensError, Result};
use crate::export::ExportQueue;
use crate::storage::sqlite::Database;
use crate::types::{from_unix, token_count, CacheEntry, CacheKey, Sections};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const ENTRY_COLUMNS: &str = "cache_key, framework, component, full_content, sections, total_tokens,
     created_at, last_accessed_at, access_count, expires_at";

/// A cache row with its sections payload left unparsed
#[derive(Debug, Clone)]
pub struct RawCacheRow {
    pub cache_key: String,
    pub framework: String,
    pub component: Option<String>,
    pub full_content: String,
    pub sections: String,
    pub total_tokens: i64,
    pub created_at: i64,
    pub last_accessed_at: i64,
    pub access_count: i64,
    pub expires_at: i64,
}

impl RawCacheRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            cache_key: row.get(0)?,
            framework: row.get(1)?,
            component: row.get(2)?,
            full_content: row.get(3)?,
            sections: row.get(4)?,
            total_tokens: row.get(5)?,
            created_at: row.get(6)?,
            last_accessed_at: row.get(7)?,
            access_count: row.get(8)?,
            expires_at: row.get(9)?,
        })
    }

    /// Parse into an entry; a bad key or sections payload is corruption
    pub fn into_entry(self) -> Result<CacheEntry> {
        let sections: Sections = serde_json::from_str(&self.sections).map_err(|e| {
            DoclensError::corruption(format!("cache entry {}", self.cache_key), e.to_string())
        })?;
        let cache_key = CacheKey::parse(&self.cache_key)
            .map_err(|e| DoclensError::corruption("cache key", e.to_string()))?;

        Ok(CacheEntry {
            cache_key,
            framework: self.framework,
            component: self.component,
            full_content: self.full_content,
            sections,
            total_tokens: self.total_tokens,
            created_at: from_unix(self.created_at),
            last_accessed_at: from_unix(self.last_accessed_at),
            access_count: self.access_count,
            expires_at: from_unix(self.expires_at),
        })
    }
}

/// Entry counts for the whole cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: i64,
    pub expired_entries: i64,
    pub total_accesses: i64,
    pub frameworks: BTreeMap<String, i64>,
}

/// Persistent documentation cache
#[derive(Clone)]
pub struct CacheStore {
    db: Database,
    ttl: Duration,
    export: Option<ExportQueue>,
}

impl CacheStore {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            export: None,
        }
    }

    /// Hand every successful put to a background exporter
    pub fn with_export(mut self, queue: ExportQueue) -> Self {
        self.export = Some(queue);
        self
    }

    pub async fn put(
        &self,
        key: &CacheKey,
        content: &str,
        sections: &Sections,
    ) -> Result<CacheEntry> {
        self.put_at(key, content, sections, Utc::now()).await
    }

    /// Insert or replace an entry, keeping any previous access count
    pub async fn put_at(
        &self,
        key: &CacheKey,
        content: &str,
        sections: &Sections,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry> {
        let ttl_secs = self.ttl.as_secs().max(1) as i64;
        let created = now.timestamp();
        let expires = created + ttl_secs;
        let sections_json = serde_json::to_string(sections)?;
        let total_tokens = token_count(content);

        let cache_key = key.as_str().to_string();
        let framework = key.framework().to_string();
        let component = key.component().map(str::to_string);
        let full_content = content.to_string();

        let row = self
            .db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR REPLACE INTO context_cache
                     (cache_key, framework, component, full_content, sections, total_tokens,
                      created_at, last_accessed_at, access_count, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7,
                             COALESCE((SELECT access_count FROM context_cache WHERE cache_key = ?1), 0),
                             ?8)",
                    params![
                        cache_key,
                        framework,
                        component,
                        full_content,
                        sections_json,
                        total_tokens,
                        created,
                        expires
                    ],
                )?;
                let row = tx.query_row(
                    &format!("SELECT {} FROM context_cache WHERE cache_key = ?", ENTRY_COLUMNS),
                    params![cache_key],
                    RawCacheRow::from_row,
                )?;
                tx.commit()?;
                Ok(row)
            })
            .await?;

        let entry = row.into_entry()?;
        debug!(cache_key = %entry.cache_key, tokens = entry.total_tokens, "Cached entry");

        if let Some(queue) = &self.export {
            queue.enqueue(&entry);
        }
        Ok(entry)
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.get_at(key, Utc::now()).await
    }

    /// Return a live entry and bump its access accounting in the same
    /// transaction. Expired, absent and unreadable entries are misses.
    pub async fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let cache_key = key.as_str().to_string();
        let now_ts = now.timestamp();

        let result = self
            .db
            .interact(move |conn| {
                let tx = conn.transaction()?;
                let row = tx
                    .query_row(
                        &format!(
                            "SELECT {} FROM context_cache WHERE cache_key = ? AND expires_at > ?",
                            ENTRY_COLUMNS
                        ),
                        params![cache_key, now_ts],
                        RawCacheRow::from_row,
                    )
                    .optional()?;

                let Some(row) = row else {
                    return Ok(None);
                };

                let mut entry = match row.into_entry() {
                    Ok(entry) => entry,
                    Err(e) => return Ok(Some(Err(e))),
                };

                tx.execute(
                    "UPDATE context_cache
                     SET access_count = access_count + 1, last_accessed_at = ?
                     WHERE cache_key = ?",
                    params![now_ts, cache_key],
                )?;
                tx.commit()?;

                entry.access_count += 1;
                entry.last_accessed_at = from_unix(now_ts);
                Ok(Some(Ok(entry)))
            })
            .await?;

        match result {
            Some(Ok(entry)) => {
                debug!(cache_key = %entry.cache_key, hits = entry.access_count, "Cache hit");
                Ok(Some(entry))
            }
            Some(Err(e)) => {
                warn!(cache_key = %key, "Treating unreadable cache entry as a miss: {}", e);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Every parseable entry, expired ones included, most recently used first
    pub async fn list(&self) -> Result<Vec<CacheEntry>> {
        let rows = self.list_raw().await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.cache_key.clone();
            match row.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(cache_key = %key, "Skipping unreadable entry: {}", e),
            }
        }
        Ok(entries)
    }

    /// Every row with its payload unparsed
    pub async fn list_raw(&self) -> Result<Vec<RawCacheRow>> {
        self.db
            .interact(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM context_cache ORDER BY last_accessed_at DESC, cache_key",
                    ENTRY_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], RawCacheRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete all entries, or only those of one framework
    pub async fn clear(&self, framework: Option<&str>) -> Result<usize> {
        let framework = framework.map(str::to_string);
        let removed = self
            .db
            .interact(move |conn| {
                let n = match framework {
                    Some(fw) => {
                        conn.execute("DELETE FROM context_cache WHERE framework = ?", params![fw])?
                    }
                    None => conn.execute("DELETE FROM context_cache", [])?,
                };
                Ok(n)
            })
            .await?;
        debug!("Cleared {} cache entries", removed);
        Ok(removed)
    }

    /// Delete an entry only while it is still expired at `now`, so a put
    /// that refreshed the key in the meantime survives
    pub async fn remove_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let key = key.to_string();
        let now_ts = now.timestamp();
        self.db
            .interact(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM context_cache WHERE cache_key = ? AND expires_at <= ?",
                    params![key, now_ts],
                )? > 0)
            })
            .await
    }

    /// Delete an entry only while its sections payload is still `sections_json`
    pub async fn remove_if_sections(&self, key: &str, sections_json: &str) -> Result<bool> {
        let key = key.to_string();
        let sections_json = sections_json.to_string();
        self.db
            .interact(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM context_cache WHERE cache_key = ? AND sections = ?",
                    params![key, sections_json],
                )? > 0)
            })
            .await
    }

    /// Swap the stored sections payload, only if it still reads `expected`
    pub async fn replace_sections(
        &self,
        key: &str,
        expected: &str,
        sections_json: &str,
    ) -> Result<bool> {
        let key = key.to_string();
        let expected = expected.to_string();
        let sections_json = sections_json.to_string();
        self.db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE context_cache SET sections = ? WHERE cache_key = ? AND sections = ?",
                    params![sections_json, key, expected],
                )? > 0)
            })
            .await
    }

    /// Correct a token count, only if the row still holds the content and
    /// count it was computed from
    pub async fn correct_total_tokens(
        &self,
        key: &str,
        full_content: &str,
        stale: i64,
        total_tokens: i64,
    ) -> Result<bool> {
        let key = key.to_string();
        let full_content = full_content.to_string();
        self.db
            .interact(move |conn| {
                Ok(conn.execute(
                    "UPDATE context_cache SET total_tokens = ?
                     WHERE cache_key = ? AND total_tokens = ? AND full_content = ?",
                    params![total_tokens, key, stale, full_content],
                )? > 0)
            })
            .await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.stats_at(Utc::now()).await
    }

    pub async fn stats_at(&self, now: DateTime<Utc>) -> Result<CacheStats> {
        let now_ts = now.timestamp();
        self.db
            .interact(move |conn| {
                let (total_entries, expired_entries, total_accesses): (i64, i64, i64) = conn.query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN expires_at <= ? THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(access_count), 0)
                     FROM context_cache",
                    params![now_ts],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;

                let mut stmt = conn.prepare(
                    "SELECT framework, COUNT(*) FROM context_cache GROUP BY framework ORDER BY framework",
                )?;
                let frameworks = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

                Ok(CacheStats {
                    total_entries,
                    expired_entries,
                    total_accesses,
                    frameworks,
                })
            })
            .await
    }
}
