use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use stubo_store::config::Config;
use stubo_store::{StubService, SweepReport};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stubo-retention", about = "Purge expired stubs from a stubo store")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "STUBO_CONFIG")]
    config: Option<String>,
    /// Override retention.max_age_days
    #[arg(long)]
    max_age_days: Option<u64>,
    /// Restrict the sweep to these scenarios (repeatable)
    #[arg(short, long = "scenario")]
    scenarios: Vec<String>,
    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
    /// Override logging.level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => Config::default(),
    };
    if let Some(days) = args.max_age_days {
        config.retention.max_age_days = days;
    }
    stubo_store::logging::init(&config.logging, args.log_level.as_deref())?;

    let service = Arc::new(StubService::from_config(&config)?);
    let scenarios = Arc::new(args.scenarios);
    let interval_secs = config.retention.sweep_interval_secs;

    if args.once || interval_secs == 0 {
        run_sweep(service, config.clone(), scenarios).await?;
        return Ok(());
    }

    info!(
        interval_secs,
        max_age_days = config.retention.max_age_days,
        "Starting retention loop"
    );
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_sweep(service.clone(), config.clone(), scenarios.clone()).await {
                    error!("Retention sweep failed: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}

/// One sweep on the blocking pool; the repository API is synchronous
async fn run_sweep(
    service: Arc<StubService>,
    config: Config,
    scenarios: Arc<Vec<String>>,
) -> anyhow::Result<SweepReport> {
    let cutoff = config
        .retention
        .cutoff(chrono::Local::now().date_naive());
    let report = tokio::task::spawn_blocking(move || {
        if scenarios.is_empty() {
            service.sweep(cutoff)
        } else {
            service.sweep_scenarios(cutoff, &scenarios)
        }
    })
    .await
    .context("Retention task panicked")??;

    if !report.failed.is_empty() {
        error!(
            %cutoff,
            failed = report.failed.len(),
            "Some scenarios were not swept"
        );
    }
    Ok(report)
}
