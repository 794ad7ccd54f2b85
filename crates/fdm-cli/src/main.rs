use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fdm_core::{JobName, RefreshMode, RunOutcome};
use fdm_jobs::{build_scheduler, AppConfig, JobSet};
use fdm_storage::{connect, run_migrations, PgPool, PgWebhookEventStore};
use fdm_vendor::{UpswingClient, VendorGateway};
use fdm_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fdm-cli")]
#[command(about = "FD marketplace reconciliation jobs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the cron scheduler and the HTTP server.
    Serve,
    /// Run one reconciliation job once and print its summary.
    RunJob {
        #[arg(value_enum)]
        job: JobArg,
        /// Refresh only clients flagged for an instant refresh.
        #[arg(long)]
        instant: bool,
    },
    Migrate,
    ValidateToken,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JobArg {
    Portfolio,
    PendingJourney,
}

impl From<JobArg> for JobName {
    fn from(arg: JobArg) -> Self {
        match arg {
            JobArg::Portfolio => JobName::PortfolioUpdate,
            JobArg::PendingJourney => JobName::PendingJourneyUpdate,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FDM_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

async fn open_pool(config: &AppConfig) -> Result<PgPool> {
    connect(&config.database.pool_config())
        .await
        .context("connecting to postgres")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn serve(config: AppConfig) -> Result<()> {
    let pool = open_pool(&config).await?;
    run_migrations(&pool).await.context("running migrations")?;
    let jobs = JobSet::connect(&config, pool.clone()).context("wiring jobs")?;

    // Prime the vendor token before the first cron tick.
    jobs.token_renewal.run().await;

    let scheduler = if config.scheduler_enabled {
        let handle = build_scheduler(&config.crons, jobs.scheduled()).await?;
        handle
            .scheduler
            .start()
            .await
            .context("starting scheduler")?;
        info!(jobs = ?handle.registered, "scheduler started");
        Some(handle.scheduler)
    } else {
        warn!("scheduler disabled, jobs run only when triggered over http");
        None
    };

    let state = AppState::new(
        &jobs,
        Arc::new(PgWebhookEventStore::new(pool)),
        config.web.webhook_token.clone(),
    );
    fdm_web::serve(&config.web, state, shutdown_signal()).await?;

    if let Some(mut scheduler) = scheduler {
        scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
    }
    Ok(())
}

async fn run_job(config: AppConfig, job: JobArg, instant: bool) -> Result<()> {
    let pool = open_pool(&config).await?;
    let jobs = JobSet::connect(&config, pool).context("wiring jobs")?;
    let name = JobName::from(job);
    let runner = jobs
        .runner(name)
        .with_context(|| format!("{name} is not a reconciliation job"))?;
    let mode = if instant {
        RefreshMode::Instant
    } else {
        RefreshMode::Scheduled
    };

    let summary = runner.do_job(mode).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.outcome == RunOutcome::Aborted {
        bail!(
            "{name} aborted: {}",
            summary.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn validate_token(config: AppConfig) -> Result<()> {
    let client = UpswingClient::new(config.vendor).context("building vendor client")?;
    client
        .validate_token()
        .await
        .context("validating upswing token")?;
    if let Some(token) = client.token_cache().current().await {
        println!("upswing token valid until {}", token.expires_at);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::RunJob { job, instant } => run_job(config, job, instant).await?,
        Commands::Migrate => {
            let pool = open_pool(&config).await?;
            run_migrations(&pool).await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::ValidateToken => validate_token(config).await?,
    }

    Ok(())
}
