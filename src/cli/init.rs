//! Configuration initialization command

use anyhow::{bail, Context};
use doclens_core::config::{default_data_dir, Config};
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

use super::helpers::print_json;

/// Write a config file holding every default
pub fn handle(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path.unwrap_or_else(|| default_data_dir().join("config.toml"));
    debug!("Writing default configuration to {}", path.display());

    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    Config::default()
        .to_file(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;

    print_json(&json!({ "config_path": path }))
}
