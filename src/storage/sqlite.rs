//! SQLite database handle shared by the cache, ledger and experiment stores
//!
//! Connections come from a deadpool-sqlite pool; each logical operation runs
//! inside one `interact` closure. Schema is applied from embedded migrations
//! tracked in `_migrations_applied`.

use crate::config::StorageConfig;
use crate::error::{DoclensError, Result};
use chrono::Utc;
use deadpool_sqlite::{Config, Pool, PoolConfig, Runtime};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Ordered, embedded schema migrations
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_initial_schema.sql",
        include_str!("../../migrations/sqlite/001_initial_schema.sql"),
    ),
    (
        "002_experiments_and_healing.sql",
        include_str!("../../migrations/sqlite/002_experiments_and_healing.sql"),
    ),
];

/// Tables every healthy database must contain
pub const REQUIRED_TABLES: &[&str] = &[
    "context_cache",
    "session_logs",
    "ab_tests",
    "ab_test_results",
    "healing_events",
];

/// Indexes every healthy database must contain
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_cache_framework",
    "idx_cache_expires",
    "idx_session_logs_session",
    "idx_session_logs_cache_key",
    "idx_session_logs_unanalyzed",
    "idx_ab_tests_one_active",
    "idx_ab_tests_pair_status",
    "idx_ab_test_results_test",
    "idx_healing_events_timestamp",
];

/// Pooled SQLite database
#[derive(Clone)]
pub struct Database {
    pool: Pool,
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open (creating if needed) the database and apply pending migrations
    pub async fn open<P: AsRef<Path>>(
        db_path: P,
        pool_size: usize,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        info!(
            "Opening database at: {} (pool_size: {})",
            path.display(),
            pool_size
        );

        let mut config = Config::new(path.clone());
        config.pool = Some(PoolConfig::new(pool_size));
        let pool = config.create_pool(Runtime::Tokio1).map_err(|e| {
            DoclensError::Storage(format!("Failed to create connection pool: {}", e))
        })?;

        let db = Self {
            pool,
            path,
            busy_timeout,
        };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::open(&config.db_path, config.pool_size, config.busy_timeout).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a pooled connection
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.pool.get().await.map_err(|e| {
            DoclensError::Storage(format!("Failed to get connection from pool: {}", e))
        })?;

        let busy_timeout = self.busy_timeout;
        conn.interact(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            f(conn)
        })
        .await
        .map_err(|e| DoclensError::Storage(format!("Pool interaction failed: {}", e)))?
    }

    /// Apply every migration not yet recorded in `_migrations_applied`
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");

        let applied = self
            .interact(|conn| {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS _migrations_applied (
                        migration_name TEXT PRIMARY KEY,
                        applied_at INTEGER NOT NULL
                    )",
                    [],
                )?;

                let mut applied = 0usize;
                for (name, sql) in MIGRATIONS {
                    let already: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                        params![name],
                        |row| row.get(0),
                    )?;
                    if already > 0 {
                        debug!("Skipping already applied migration: {}", name);
                        continue;
                    }

                    let tx = conn.transaction()?;
                    tx.execute_batch(sql).map_err(|e| {
                        DoclensError::Storage(format!("Failed to apply migration {}: {}", name, e))
                    })?;
                    tx.execute(
                        "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                        params![name, Utc::now().timestamp()],
                    )?;
                    tx.commit()?;

                    info!("Executed migration: {}", name);
                    applied += 1;
                }
                Ok(applied)
            })
            .await?;

        info!("Database migrations completed ({} applied)", applied);
        Ok(())
    }

    /// Re-run every schema statement; all of them are idempotent
    pub async fn reapply_schema(&self) -> Result<()> {
        self.interact(|conn| {
            for (name, sql) in MIGRATIONS {
                conn.execute_batch(sql).map_err(|e| {
                    DoclensError::Storage(format!("Failed to reapply {}: {}", name, e))
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Names of the tables and indexes currently present
    pub async fn schema_objects(&self) -> Result<(Vec<String>, Vec<String>)> {
        self.interact(|conn| {
            let mut stmt = conn.prepare(
                "SELECT type, name FROM sqlite_master WHERE type IN ('table', 'index')",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut tables = Vec::new();
            let mut indexes = Vec::new();
            for row in rows {
                let (kind, name) = row?;
                if kind == "table" {
                    tables.push(name);
                } else {
                    indexes.push(name);
                }
            }
            Ok((tables, indexes))
        })
        .await
    }

    /// Result of `PRAGMA integrity_check`; `"ok"` when healthy
    pub async fn integrity_check(&self) -> Result<String> {
        self.interact(|conn| {
            let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            Ok(verdict)
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub async fn create_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::open(db_path, 2, Duration::from_secs(5))
            .await
            .unwrap();
        (db, temp_dir)
    }
}
