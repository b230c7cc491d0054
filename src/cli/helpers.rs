//! Shared helper functions for CLI commands
//!
//! Configuration resolution and JSON output used by every command.

use anyhow::Context;
use doclens_core::{Config, Doclens};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Global flags that locate the config and database
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
}

impl GlobalOpts {
    /// Config from `--config`, `DOCLENS_CONFIG` or defaults, with
    /// `--db-path` applied last
    pub fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config =
            Config::resolve(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(db_path) = &self.db_path {
            config.storage.db_path = db_path.clone();
        }
        debug!("Using database: {}", config.storage.db_path.display());
        Ok(config)
    }

    pub async fn open(&self) -> anyhow::Result<Doclens> {
        self.open_with(self.resolve_config()?).await
    }

    pub async fn open_with(&self, config: Config) -> anyhow::Result<Doclens> {
        let db_path = config.storage.db_path.clone();
        Doclens::open(config)
            .await
            .with_context(|| format!("failed to open {}", db_path.display()))
    }
}

/// Pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Read a file argument, or stdin when it is `-` or absent
pub fn read_input(path: Option<&Path>) -> anyhow::Result<String> {
    match path.filter(|p| p.as_os_str() != "-") {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => std::io::read_to_string(std::io::stdin()).context("failed to read stdin"),
    }
}
