//! Kickoff - staged pre-event feature pipeline driver
//!
//! Subcommands:
//!   sweep     run every due (event, window) pair, once or on an interval
//!   run       run one window for one event
//!   prepare   produce the terminal-window decision for an event
//!   validate  validate stored features for one window without building
//!
//! Results are printed as JSON on stdout; logs go through `tracing`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kickoff_backend::audit::{AuditSink, JsonlAuditSink, TracingAuditSink};
use kickoff_backend::builders::StoredFeatureBuilder;
use kickoff_backend::clock::SystemClock;
use kickoff_backend::models::Window;
use kickoff_backend::store::{FeatureStore, SqliteFeatureStore};
use kickoff_backend::{DecisionGate, PipelineOrchestrator, TemporalConfig};

#[derive(Parser, Debug)]
#[command(name = "kickoff")]
#[command(about = "Temporal-correctness engine for staged pre-event features")]
struct Cli {
    /// TOML config file (overrides KICKOFF_CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, env = "DATABASE_PATH", default_value = "./kickoff.db")]
    db: String,

    /// Append audit entries to this JSONL file instead of the log
    #[arg(long, global = true, env = "KICKOFF_AUDIT_PATH")]
    audit: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every due window
    Sweep {
        /// Keep sweeping on the configured interval
        #[arg(long, default_value = "false")]
        watch: bool,
    },
    /// Run one window for one event
    Run {
        #[arg(long)]
        entity: String,
        /// t24h, t6h, t3h, t90m or terminal
        #[arg(long)]
        window: String,
    },
    /// Terminal-window decision for one event
    Prepare {
        #[arg(long)]
        entity: String,
    },
    /// Validate stored features against one window's cutoff
    Validate {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        window: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TemporalConfig::from_toml_file(path)?,
        None => TemporalConfig::from_env()?,
    };
    let config = Arc::new(config);

    let store: Arc<dyn FeatureStore> = Arc::new(
        SqliteFeatureStore::new(&cli.db).with_context(|| format!("Failed to open {}", cli.db))?,
    );
    let audit: Arc<dyn AuditSink> = match &cli.audit {
        Some(path) => Arc::new(JsonlAuditSink::open(path)?),
        None => Arc::new(TracingAuditSink),
    };

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store.clone(),
        StoredFeatureBuilder::all(store.clone()),
        Arc::new(SystemClock),
        audit,
        config.clone(),
    ));

    info!(
        db = %cli.db,
        builder_timeout_secs = config.orchestrator.builder_timeout_secs,
        max_concurrent_runs = config.orchestrator.max_concurrent_runs,
        "kickoff engine ready"
    );

    match cli.command {
        Command::Sweep { watch: false } => {
            print_json(&orchestrator.run_scheduled_windows().await)?;
        }
        Command::Sweep { watch: true } => {
            let mut ticker = interval(config.orchestrator.sweep_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = orchestrator.run_scheduled_windows().await;
                        for e in &report.errors {
                            error!(error = %e, "sweep error");
                        }
                        if !report.runs.is_empty() {
                            print_json(&report)?;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutdown requested, stopping sweeps");
                        break;
                    }
                }
            }
        }
        Command::Run { entity, window } => {
            let window = parse_window(&window)?;
            print_json(&orchestrator.run(&entity, window, None).await)?;
        }
        Command::Prepare { entity } => {
            let gate = DecisionGate::new(orchestrator.clone());
            print_json(&gate.prepare(&entity).await)?;
        }
        Command::Validate { entity, window } => {
            let window = parse_window(&window)?;
            let event = store.event(&entity).await?;
            let result = orchestrator
                .detector()
                .validate(&entity, window, event.event_start)
                .await;
            print_json(&result)?;
        }
    }

    Ok(())
}

fn parse_window(s: &str) -> Result<Window> {
    Window::parse(s).ok_or_else(|| anyhow!("unknown window '{}'", s))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kickoff_backend=info,kickoff=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
