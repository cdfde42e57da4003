//! Pulsekeeper CLI
//!
//! Runs the job scheduler and operations API, or a single job on demand.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use pulsekeeper::analytics::ClickHouseStore;
use pulsekeeper::api::{AppState, HttpServer};
use pulsekeeper::config::IntegrationsConfig;
use pulsekeeper::db::Database;
use pulsekeeper::mailer::{HttpMailer, LogMailer, Mailer};
use pulsekeeper::scheduler::{self, Job, Scheduler};
use pulsekeeper::tasks::{Stores, TaskManager};
use pulsekeeper::Config;

/// Pulsekeeper - scheduled jobs for a web analytics service
#[derive(Parser)]
#[command(name = "pulsekeeper")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "PULSEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the operations API
    Serve {
        /// Serve the API without scheduling jobs
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Run one job now and exit
    Run {
        /// Job name, as printed by `jobs`
        job: Job,
    },

    /// List jobs and their schedules
    Jobs,

    /// Run database migrations
    Migrate,

    /// Check connectivity to every store
    Health,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = init_logging(&config, cli.verbose);

    let result = match cli.command {
        Commands::Serve { no_scheduler } => run_serve(config, no_scheduler).await,
        Commands::Run { job } => run_job(config, job).await,
        Commands::Jobs => {
            print_jobs();
            Ok(())
        }
        Commands::Migrate => run_migrate(config).await,
        Commands::Health => run_health(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &Config, verbose: bool) -> WorkerGuard {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    guard
}

fn build_mailer(config: &IntegrationsConfig) -> anyhow::Result<Arc<dyn Mailer>> {
    match &config.mailer_url {
        Some(url) => Ok(Arc::new(HttpMailer::new(
            url.clone(),
            config.mailer_token.clone(),
            config.http_timeout,
        )?)),
        None => {
            warn!("No mailer URL configured, emails will only be logged");
            Ok(Arc::new(LogMailer))
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<(Database, Arc<TaskManager>)> {
    let database = Database::new(config)
        .await
        .context("connecting to PostgreSQL and Redis")?;
    let analytics = ClickHouseStore::new(&config.clickhouse);
    let mailer = build_mailer(&config.integrations)?;

    let stores = Stores::new(&database, analytics, mailer);
    let tasks = TaskManager::new(stores, config)?;

    Ok((database, Arc::new(tasks)))
}

async fn run_serve(config: Config, no_scheduler: bool) -> anyhow::Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing metrics recorder")?;

    let (database, tasks) = connect(&config).await?;
    let shutdown = CancellationToken::new();

    let scheduler = if config.scheduler.enabled && !no_scheduler {
        let scheduler = Scheduler::new(tasks.clone(), &config.scheduler, shutdown.clone())?;
        Some(tokio::spawn(scheduler.run()))
    } else {
        info!("Scheduler disabled");
        None
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
        }
        signal.cancel();
    });

    let server = HttpServer::new(AppState {
        tasks,
        database: Some(database),
        prometheus: Some(prometheus),
    });
    server.serve(&config.http_addr(), shutdown.clone()).await?;

    shutdown.cancel();
    if let Some(handle) = scheduler {
        handle.await?;
    }

    Ok(())
}

async fn run_job(config: Config, job: Job) -> anyhow::Result<()> {
    let (_, tasks) = connect(&config).await?;
    let affected = scheduler::run_once(&tasks, job).await?;
    println!("{job}: {affected} affected");
    Ok(())
}

fn print_jobs() {
    let now = chrono::Utc::now();
    for job in Job::ALL {
        let schedule = job.schedule();
        println!(
            "{:<36} {:<32} next {}",
            job.name(),
            schedule.to_string(),
            schedule.next_after(now).format("%Y-%m-%d %H:%M:%S UTC"),
        );
        println!("    {}", job.description());
    }
}

async fn run_migrate(config: Config) -> anyhow::Result<()> {
    let database = Database::new(&config).await?;
    database.migrate().await?;
    println!("Migrations applied");
    Ok(())
}

async fn run_health(config: Config) -> anyhow::Result<()> {
    let database = Database::new(&config).await?;
    let analytics = ClickHouseStore::new(&config.clickhouse);

    let checks = [
        ("PostgreSQL + Redis", database.health_check().await),
        ("ClickHouse", analytics.health_check().await),
    ];

    let mut healthy = true;
    for (name, result) in checks {
        match result {
            Ok(()) => println!("{name:<20} ok"),
            Err(e) => {
                healthy = false;
                println!("{name:<20} FAILED: {e}");
            }
        }
    }

    anyhow::ensure!(healthy, "one or more stores are unreachable");
    Ok(())
}
