//! Doclens - self-tuning documentation cache for coding agents
//!
//! Command-line entry point. Results are printed as JSON on stdout; logs go
//! to stderr.

mod cli;

use clap::{Parser, Subcommand};
use cli::cache::CacheAction;
use cli::doctor::HealTarget;
use cli::helpers::GlobalOpts;
use doclens_core::DeliveryRequest;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "doclens")]
#[command(about = "Self-tuning documentation cache for coding agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (overrides DOCLENS_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides DOCLENS_DB_PATH and the config file)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Set log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage cached documentation
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Serve the relevant sections of a cached document
    Deliver {
        #[arg(short, long)]
        framework: String,

        #[arg(short, long)]
        operation: String,

        #[arg(short, long)]
        component: Option<String>,

        /// Tool that triggered the delivery
        #[arg(long, default_value = "Write")]
        tool_name: String,

        /// Opaque tool payload, stored verbatim
        #[arg(long, default_value = "")]
        tool_input: String,

        #[arg(long)]
        file_path: Option<String>,
    },

    /// Record what happened after a delivery
    Outcome {
        /// Session id returned by `deliver`
        #[arg(short, long)]
        session_id: Option<String>,

        #[arg(long, conflicts_with = "session_id")]
        log_id: Option<i64>,

        /// Whether the task completed (omit when unknown)
        #[arg(long)]
        complete: Option<bool>,

        /// Follow-up action tag (repeatable)
        #[arg(long = "follow-up")]
        follow_ups: Vec<String>,
    },

    /// Score pending deliveries
    Analyze {
        #[arg(short, long, default_value = "50")]
        batch_size: usize,
    },

    /// Run a learning cycle
    Learn {
        /// Lookback window in days (defaults to the configured window)
        #[arg(short, long)]
        days: Option<i64>,
    },

    /// Effectiveness report
    Report {
        #[arg(short, long, default_value = "7")]
        days: i64,
    },

    /// Learning status
    Status,

    /// Print the rule file
    Rules,

    /// List A/B tests with their analysis
    Tests,

    /// Complete expired tests and adopt winning rules
    Finalize,

    /// Run all health checks and repairs
    Health,

    /// Repair the cache, rule file, experiments or database
    Heal {
        #[arg(short, long, value_enum, default_value = "all")]
        target: HealTarget,
    },

    /// Recent healing events
    History {
        #[arg(short, long, default_value = "7")]
        days: i64,
    },

    /// Write a config file with every default
    InitConfig {
        /// Destination (defaults to the data directory)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::new(format!(
        "doclens={level},doclens_core={level}",
        level = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Doclens v{} starting...", env!("CARGO_PKG_VERSION"));

    let global = GlobalOpts {
        config: cli.config,
        db_path: cli.db_path,
    };

    match cli.command {
        Commands::Cache { action } => cli::cache::handle(action, &global).await,
        Commands::Deliver {
            framework,
            operation,
            component,
            tool_name,
            tool_input,
            file_path,
        } => {
            let request = DeliveryRequest {
                framework,
                operation,
                component,
                tool_name,
                tool_input,
                file_path,
            };
            cli::cache::deliver(request, &global).await
        }
        Commands::Outcome {
            session_id,
            log_id,
            complete,
            follow_ups,
        } => cli::cache::outcome(session_id, log_id, complete, follow_ups, &global).await,
        Commands::Analyze { batch_size } => cli::learn::analyze(batch_size, &global).await,
        Commands::Learn { days } => cli::learn::learn(days, &global).await,
        Commands::Report { days } => cli::learn::report(days, &global).await,
        Commands::Status => cli::learn::status(&global).await,
        Commands::Rules => cli::learn::rules(&global).await,
        Commands::Tests => cli::learn::tests(&global).await,
        Commands::Finalize => cli::learn::finalize(&global).await,
        Commands::Health => cli::doctor::health(&global).await,
        Commands::Heal { target } => cli::doctor::heal(target, &global).await,
        Commands::History { days } => cli::doctor::history(days, &global).await,
        Commands::InitConfig { path, force } => cli::init::handle(path, force),
    }
}
