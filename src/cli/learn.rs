//! Learning loop commands

use doclens_core::DoclensError;
use serde_json::json;
use tracing::info;

use super::helpers::{print_json, GlobalOpts};

/// Score pending deliveries without touching the rules
pub async fn analyze(batch_size: usize, global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    let summary = doclens.engine().score_pending(batch_size).await?;
    info!("Analyzed {} sessions", summary.analyzed);
    print_json(&summary)?;
    doclens.shutdown().await;
    Ok(())
}

/// Run one learning cycle, optionally over a different window
pub async fn learn(days: Option<i64>, global: &GlobalOpts) -> anyhow::Result<()> {
    let mut config = global.resolve_config()?;
    if let Some(days) = days {
        config.learning.window_days = days;
        config.learning.pattern_window_days = days * 2;
    }
    let doclens = global.open_with(config).await?;

    match doclens.engine().run_cycle().await {
        Ok(report) => {
            info!(
                "Learning cycle complete: {} sessions analyzed, {} rules updated",
                report.scoring.analyzed,
                report.applied.rules_updated.len()
            );
            print_json(&report)?;
        }
        Err(DoclensError::AlreadyRunning) => {
            print_json(&json!({ "status": "already_running" }))?;
        }
        Err(e) => return Err(e.into()),
    }
    doclens.shutdown().await;
    Ok(())
}

pub async fn report(days: i64, global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    print_json(&doclens.engine().effectiveness(days).await?)?;
    doclens.shutdown().await;
    Ok(())
}

pub async fn status(global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    print_json(&doclens.engine().status().await?)?;
    doclens.shutdown().await;
    Ok(())
}

/// Print the raw rule document
pub async fn rules(global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    match doclens.rules().read_raw().await? {
        Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(document) => print_json(&document)?,
            Err(e) => print_json(&json!({
                "error": format!("rule file is not valid JSON: {}", e),
                "path": doclens.rules().path(),
            }))?,
        },
        None => print_json(&json!({
            "error": "no rules file found",
            "path": doclens.rules().path(),
        }))?,
    }
    doclens.shutdown().await;
    Ok(())
}

pub async fn tests(global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    let tests = doclens.engine().experiments().await?;
    print_json(&json!({ "tests": tests }))?;
    doclens.shutdown().await;
    Ok(())
}

pub async fn finalize(global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    let report = doclens.engine().finalize().await?;
    info!(
        "Finalized {} tests, adopted {} rules",
        report.tests_finalized,
        report.rules_adopted.len()
    );
    print_json(&report)?;
    doclens.shutdown().await;
    Ok(())
}
