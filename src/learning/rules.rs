//! The extraction rule file
//!
//! Rules live in a single JSON document next to the database. Every writer
//! (learning cycle, finalize, rule repair) holds the store lock across its
//! read-modify-write, and saves go through a temp file plus rename so a
//! reader never sees a half-written document. File I/O runs on the blocking
//! pool, so holding the lock across it never stalls the runtime.

use crate::error::{DoclensError, Result};
use crate::types::RuleSet;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct RuleStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl RuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize writers of the rule file
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub async fn exists(&self) -> Result<bool> {
        let path = self.path.clone();
        blocking(move || Ok(path.try_exists()?)).await
    }

    /// Raw file contents, or `None` when the file is absent
    pub async fn read_raw(&self) -> Result<Option<String>> {
        let path = self.path.clone();
        blocking(move || read_raw(&path)).await
    }

    /// Parse the rule file; an absent file is an empty rule set
    pub async fn load(&self) -> Result<RuleSet> {
        let Some(raw) = self.read_raw().await? else {
            return Ok(RuleSet::default());
        };
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| DoclensError::corruption("rule file", e.to_string()))?;
        RuleSet::try_from(value)
    }

    pub async fn save(&self, rules: &RuleSet) -> Result<()> {
        self.save_value(&Value::from(rules.clone())).await
    }

    /// Atomically replace the rule file with a JSON document
    pub async fn save_value(&self, value: &Value) -> Result<()> {
        let document = serde_json::to_string_pretty(value)?;
        let path = self.path.clone();
        blocking(move || write_atomic(&path, &document)).await?;
        debug!(path = %self.path.display(), "Saved rule file");
        Ok(())
    }

    /// Keep a copy of unparsable contents before they are overwritten
    pub async fn write_backup(&self, raw: &str, now: DateTime<Utc>) -> Result<PathBuf> {
        let name = format!(
            "{}.backup.{}",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "rules.json".to_string()),
            now.format("%Y%m%d_%H%M%S")
        );
        let backup = self.path.with_file_name(name);
        let (target, raw) = (backup.clone(), raw.to_string());
        blocking(move || Ok(fs::write(&target, raw)?)).await?;
        info!(path = %backup.display(), "Backed up rule file");
        Ok(backup)
    }
}

/// Run file I/O on the blocking pool so callers holding the store lock
/// never stall a runtime worker
async fn blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("Rule file task failed: {}", e);
        DoclensError::Other(format!("Rule file task failed: {}", e))
    })?
}

fn read_raw(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, document: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, document)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtractionRule;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_absent_file_is_empty_rule_set() {
        let temp = TempDir::new().unwrap();
        let store = RuleStore::new(temp.path().join("rules.json"));
        assert!(!store.exists().await.unwrap());
        assert_eq!(store.load().await.unwrap(), RuleSet::default());
        assert!(store.read_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let store = RuleStore::new(temp.path().join("nested").join("rules.json"));

        let mut rules = RuleSet::starter();
        rules.set("vue", "debug", ExtractionRule::new(&["errors"], 1600));
        store.save(&rules).await.unwrap();

        assert!(store.exists().await.unwrap());
        assert_eq!(store.load().await.unwrap(), rules);
        assert!(!temp.path().join("nested").join("rules.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_unparsable_file_is_corruption() {
        let temp = TempDir::new().unwrap();
        let store = RuleStore::new(temp.path().join("rules.json"));
        fs::write(store.path(), "{\"react\": {,}").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(err.is_corruption());

        let backup = store
            .write_backup("{\"react\": {,}", Utc::now())
            .await
            .unwrap();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("rules.json.backup."));
        assert_eq!(fs::read_to_string(&backup).unwrap(), "{\"react\": {,}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_file_io_yields_to_runtime_while_locked() {
        let temp = TempDir::new().unwrap();
        let store = RuleStore::new(temp.path().join("rules.json"));
        let ran = Arc::new(AtomicBool::new(false));

        // One worker thread: the spawned task only runs if file I/O
        // suspends this task instead of blocking the worker
        let flag = ran.clone();
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

        let _guard = store.lock().await;
        for i in 0..20 {
            let mut rules = RuleSet::starter();
            rules.set("react", "create", ExtractionRule::new(&["hooks"], 1000 + i));
            store.save(&rules).await.unwrap();
            let loaded = store.load().await.unwrap();
            assert_eq!(loaded.get("react", "create").unwrap().max_tokens, 1000 + i);
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
