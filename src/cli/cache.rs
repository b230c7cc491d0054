//! Cache maintenance and delivery commands

use anyhow::Context;
use clap::Subcommand;
use doclens_core::{CacheKey, DeliveryRequest};
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

use super::helpers::{print_json, read_input, GlobalOpts};

#[derive(Subcommand)]
pub enum CacheAction {
    /// Split a document into sections and cache it
    Put {
        /// Framework name (e.g. react)
        #[arg(short, long)]
        framework: String,

        /// Component within the framework
        #[arg(short, long)]
        component: Option<String>,

        /// Markdown file to cache (stdin when omitted)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Show a live entry (counts as an access)
    Get {
        /// Cache key, `framework` or `framework:component`
        key: String,
    },

    /// List every entry, expired ones included
    List,

    /// Entry counts per framework
    Stats,

    /// Delete all entries, or those of one framework
    Clear {
        #[arg(short, long)]
        framework: Option<String>,
    },
}

pub async fn handle(action: CacheAction, global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;

    match action {
        CacheAction::Put {
            framework,
            component,
            file,
        } => {
            let content = read_input(file.as_deref())?;
            let entry = doclens
                .delivery()
                .store_document(&framework, component.as_deref(), &content)
                .await?;
            print_json(&json!({
                "cache_key": entry.cache_key,
                "sections": entry.sections.names(),
                "total_tokens": entry.total_tokens,
                "expires_at": entry.expires_at,
            }))?;
        }
        CacheAction::Get { key } => {
            let key = CacheKey::parse(&key)?;
            match doclens.cache().get(&key).await? {
                Some(entry) => print_json(&entry)?,
                None => print_json(&json!({ "cache_key": key, "status": "miss" }))?,
            }
        }
        CacheAction::List => {
            let entries: Vec<_> = doclens
                .cache()
                .list()
                .await?
                .into_iter()
                .map(|entry| {
                    json!({
                        "cache_key": entry.cache_key,
                        "framework": entry.framework,
                        "sections": entry.sections.names(),
                        "total_tokens": entry.total_tokens,
                        "access_count": entry.access_count,
                        "last_accessed_at": entry.last_accessed_at,
                        "expires_at": entry.expires_at,
                    })
                })
                .collect();
            print_json(&entries)?;
        }
        CacheAction::Stats => print_json(&doclens.cache().stats().await?)?,
        CacheAction::Clear { framework } => {
            let removed = doclens.cache().clear(framework.as_deref()).await?;
            print_json(&json!({ "removed": removed }))?;
        }
    }

    doclens.shutdown().await;
    Ok(())
}

/// Serve documentation for one request
pub async fn deliver(request: DeliveryRequest, global: &GlobalOpts) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    debug!("Delivering for {}:{}", request.framework, request.operation);
    let delivery = doclens
        .deliver(&request)
        .await
        .context("delivery failed")?;
    print_json(&delivery)?;
    doclens.shutdown().await;
    Ok(())
}

/// Attach outcome signals to a delivery, by session id or log id
pub async fn outcome(
    session_id: Option<String>,
    log_id: Option<i64>,
    complete: Option<bool>,
    follow_ups: Vec<String>,
    global: &GlobalOpts,
) -> anyhow::Result<()> {
    let doclens = global.open().await?;
    let log_id = match (log_id, session_id) {
        (Some(log_id), _) => {
            doclens
                .ledger()
                .record_outcome(log_id, complete, &follow_ups)
                .await?;
            log_id
        }
        (None, Some(session_id)) => {
            doclens
                .record_session_outcome(&session_id, complete, &follow_ups)
                .await?
        }
        (None, None) => anyhow::bail!("either --session-id or --log-id is required"),
    };
    print_json(&json!({
        "log_id": log_id,
        "session_complete": complete,
        "follow_up_actions": follow_ups,
    }))?;
    doclens.shutdown().await;
    Ok(())
}
