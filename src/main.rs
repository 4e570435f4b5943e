//! Gateway Sentinel - resilient Gateway client with a reliability watchdog
//!
//! Connects to the Gateway (or the simulated peer in safe mode), runs the
//! health scheduler and exposes the sentinel's checks, summary, config and
//! audit trail on the command line.

use anyhow::Result;
use clap::{Parser, Subcommand};
use gateway_sentinel::{
    clock::SystemClock,
    config::AppConfig,
    protocol::{ClientEvent, GatewayClient},
    scheduler::{ConnectionReportTask, HealthScheduler, SnapshotSource},
    sentinel::{JsonFileStore, ReliabilityEngine, RunContext, SentinelConfigUpdate},
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gateway-sentinel")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Resilient Gateway client with a reliability watchdog")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "GATEWAY_SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway endpoint override
    #[arg(long, env = "GATEWAY_URL")]
    url: Option<String>,

    /// Gateway auth token override
    #[arg(long, env = "GATEWAY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Use the in-process simulated peer
    #[arg(long)]
    safe_mode: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run the health scheduler until Ctrl+C
    Run,

    /// Run health checks once against a fresh connection
    Check {
        /// Only run this check (gateway, agents, tools, providers)
        #[arg(short, long)]
        name: Option<String>,

        /// Seconds to wait for the session to become ready
        #[arg(long, default_value = "5")]
        wait_secs: u64,
    },

    /// Show the health summary
    Summary,

    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the most recent audit entries
    Audit {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Update the persisted sentinel config
    Set {
        #[arg(long)]
        enabled: Option<bool>,

        #[arg(long)]
        retries_before_escalation: Option<u32>,

        #[arg(long)]
        check_interval_minutes: Option<u32>,

        #[arg(long)]
        max_stored_checks: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gateway_sentinel={}", log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Load configuration
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    if let Some(url) = cli.url {
        config.gateway.url = url;
    }
    if let Some(token) = cli.token {
        config.gateway.token = Some(token);
    }
    if cli.safe_mode {
        config.gateway.safe_mode = true;
    }
    config.normalize();
    config.validate()?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Check { name, wait_secs } => {
            check(config, name, Duration::from_secs(wait_secs)).await?;
        }
        Commands::Summary => {
            let engine = build_engine(&config)?;
            print_json(&engine.get_summary(config.gateway.safe_mode)?)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let engine = build_engine(&config)?;
                config.sentinel = engine.get_config()?;
                println!("{}", config.to_toml()?);
            }
            ConfigAction::Set {
                enabled,
                retries_before_escalation,
                check_interval_minutes,
                max_stored_checks,
            } => {
                let engine = build_engine(&config)?;
                let update = SentinelConfigUpdate {
                    enabled,
                    retries_before_escalation,
                    check_interval_minutes,
                    max_stored_checks,
                };
                print_json(&engine.update_config(&update)?)?;
            }
        },
        Commands::Audit { limit } => {
            let engine = build_engine(&config)?;
            print_json(&engine.audit_entries(Some(limit))?)?;
        }
    }

    Ok(())
}

fn build_engine(config: &AppConfig) -> Result<ReliabilityEngine> {
    let store = JsonFileStore::new(&config.storage.base_dir)?;
    Ok(ReliabilityEngine::new(Arc::new(store), Arc::new(SystemClock))
        .with_defaults(config.sentinel.clone())
        .with_audit_cap(config.storage.max_audit_entries))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    tracing::info!(
        url = %config.gateway.url,
        safe_mode = config.gateway.safe_mode,
        "Starting Gateway Sentinel"
    );

    let client = GatewayClient::with_default_transport(config.gateway.client_options());
    let engine = Arc::new(build_engine(&config)?);
    client.connect();

    let scheduler = if config.scheduler.enabled {
        let scheduler = Arc::new(
            HealthScheduler::new(
                engine,
                Arc::new(client.clone()),
                Duration::from_secs(config.scheduler.tick_secs),
            )
            .with_task(Arc::new(ConnectionReportTask::new(client.clone()))),
        );
        scheduler.start();
        Some(scheduler)
    } else {
        tracing::info!("Scheduler disabled");
        None
    };

    tracing::info!("Gateway Sentinel is running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    client.disconnect();

    Ok(())
}

async fn check(config: AppConfig, name: Option<String>, wait: Duration) -> Result<()> {
    let engine = build_engine(&config)?;
    let client = GatewayClient::with_default_transport(config.gateway.client_options());

    let mut events = client.subscribe();
    client.connect();
    let ready = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Connected { .. }) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if !ready {
        tracing::warn!(
            wait_secs = wait.as_secs(),
            "Gateway session not ready, judging current state"
        );
    }

    let mut ctx = RunContext::manual(client.health_snapshot().await);
    if let Some(name) = name {
        ctx = ctx.with_check(name);
    }
    let outcome = engine.run_health_checks(&ctx);
    client.disconnect();

    print_json(&outcome?)?;
    Ok(())
}
