//! Health check and repair commands

use clap::ValueEnum;
use doclens_core::healing::HealthVerdict;
use serde_json::json;
use tracing::debug;

use super::helpers::{print_json, GlobalOpts};

/// Events shown after a full heal
const RECENT_EVENTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HealTarget {
    All,
    Cache,
    Rules,
    Experiments,
    Database,
}

/// Run every check and repair; the exit code reflects the verdict
pub async fn health(global: &GlobalOpts) -> anyhow::Result<()> {
    debug!("Running health checks...");
    let doclens = global.open().await?;
    let report = doclens.healer().run_comprehensive().await?;
    print_json(&report)?;
    doclens.shutdown().await;

    match report.verdict {
        HealthVerdict::Healthy => Ok(()),
        HealthVerdict::MinorIssues => std::process::exit(1),
        HealthVerdict::NeedsAttention => std::process::exit(2),
    }
}

pub async fn heal(target: HealTarget, global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    let healer = doclens.healer();

    match target {
        HealTarget::All => {
            let report = healer.run_comprehensive().await?;
            let mut recent = healer.history(1).await?;
            recent.truncate(RECENT_EVENTS);
            print_json(&json!({
                "health_check": report,
                "recent_healing": recent,
                "healing_stats": healer.metrics(),
            }))?;
        }
        HealTarget::Cache => print_json(&healer.repair_cache().await?)?,
        HealTarget::Rules => print_json(&healer.repair_rules().await?)?,
        HealTarget::Experiments => print_json(&healer.repair_experiments().await?)?,
        HealTarget::Database => print_json(&healer.check_database().await?)?,
    }

    doclens.shutdown().await;
    Ok(())
}

pub async fn history(days: i64, global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    print_json(&doclens.healer().history(days).await?)?;
    doclens.shutdown().await;
    Ok(())
}
