//! Best-effort replication of cache entries to an external store
//!
//! Puts hand entries to a bounded queue drained by one background worker.
//! Enqueueing never blocks and never fails the caller; exporter errors are
//! logged and dropped.

use crate::types::CacheEntry;
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Destination for exported cache entries
#[async_trait]
pub trait CacheExporter: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, entry: &CacheEntry) -> anyhow::Result<()>;
}

/// Runs an external program with the entry as JSON on stdin
pub struct CommandExporter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExporter {
    /// `command[0]` is the program, the rest are its arguments
    pub fn new(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl CacheExporter for CommandExporter {
    fn name(&self) -> &str {
        &self.program
    }

    async fn export(&self, entry: &CacheEntry) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(entry)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }

        let status = tokio::time::timeout(self.timeout, child.wait())
            .await
            .with_context(|| format!("{} timed out after {:?}", self.program, self.timeout))??;

        if !status.success() {
            bail!("{} exited with {}", self.program, status);
        }
        Ok(())
    }
}

/// Handle for enqueueing exports
#[derive(Clone)]
pub struct ExportQueue {
    tx: mpsc::Sender<CacheEntry>,
}

impl ExportQueue {
    /// Start the worker. Must be called from within a tokio runtime.
    pub fn spawn(exporter: Arc<dyn CacheExporter>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<CacheEntry>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                match exporter.export(&entry).await {
                    Ok(()) => debug!(cache_key = %entry.cache_key, exporter = exporter.name(), "Exported entry"),
                    Err(e) => warn!(cache_key = %entry.cache_key, exporter = exporter.name(), "Export failed: {:#}", e),
                }
            }
            debug!("Export queue closed");
        });

        (Self { tx }, handle)
    }

    /// Queue an entry; returns false if it was dropped
    pub fn enqueue(&self, entry: &CacheEntry) -> bool {
        match self.tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(entry)) => {
                warn!(cache_key = %entry.cache_key, "Export queue full, dropping entry");
                false
            }
            Err(TrySendError::Closed(entry)) => {
                warn!(cache_key = %entry.cache_key, "Export worker stopped, dropping entry");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CacheKey, Sections};
    use chrono::Utc;
    use tokio::sync::Mutex;

    fn entry(key: &str) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            cache_key: CacheKey::parse(key).unwrap(),
            framework: key.to_string(),
            component: None,
            full_content: "docs".to_string(),
            sections: Sections::new(),
            total_tokens: 1,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            expires_at: now + chrono::Duration::hours(24),
        }
    }

    #[derive(Default)]
    struct RecordingExporter {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheExporter for RecordingExporter {
        fn name(&self) -> &str {
            "recording"
        }

        async fn export(&self, entry: &CacheEntry) -> anyhow::Result<()> {
            self.seen.lock().await.push(entry.cache_key.to_string());
            if self.fail {
                bail!("remote unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_worker_drains_queue_in_order() {
        let exporter = Arc::new(RecordingExporter::default());
        let (queue, handle) = ExportQueue::spawn(exporter.clone(), 8);

        assert!(queue.enqueue(&entry("react")));
        assert!(queue.enqueue(&entry("vue")));
        drop(queue);
        handle.await.unwrap();

        assert_eq!(*exporter.seen.lock().await, vec!["react", "vue"]);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let exporter = Arc::new(RecordingExporter {
            fail: true,
            ..Default::default()
        });
        let (queue, handle) = ExportQueue::spawn(exporter.clone(), 8);

        assert!(queue.enqueue(&entry("react")));
        assert!(queue.enqueue(&entry("svelte")));
        drop(queue);
        handle.await.unwrap();

        assert_eq!(exporter.seen.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_queue_drops_without_error() {
        let exporter = Arc::new(RecordingExporter::default());
        let (queue, handle) = ExportQueue::spawn(exporter, 1);
        handle.abort();
        let _ = handle.await;

        assert!(!queue.enqueue(&entry("react")));
    }

    #[tokio::test]
    async fn test_command_exporter_reports_missing_program() {
        let exporter = CommandExporter::new(
            &["doclens-definitely-missing-binary".to_string()],
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(exporter.export(&entry("react")).await.is_err());
        assert!(CommandExporter::new(&[], Duration::from_secs(1)).is_none());
    }
}
