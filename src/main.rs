use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pezzottify_job_server::background_jobs::jobs::register_builtin_jobs;
use pezzottify_job_server::background_jobs::{JobServer, SchedulerRegistry, WorkerRegistry};
use pezzottify_job_server::config::{
    AppConfig, CliConfig, ConfigService, FileConfig, LiveConfigService,
};
use pezzottify_job_server::metrics::{run_metrics_server, PrometheusMetrics};
use pezzottify_job_server::SqliteJobStore;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the command line.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the jobs database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Whether this process creates scheduled jobs.
    #[clap(long, action = ArgAction::Set, default_value_t = true)]
    pub leader: bool,

    /// Whether this process executes jobs.
    #[clap(long, action = ArgAction::Set, default_value_t = true)]
    pub run_jobs: bool,

    /// Whether this process runs the job schedulers.
    #[clap(long, action = ArgAction::Set, default_value_t = true)]
    pub run_scheduler: bool,
}

impl CliArgs {
    fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            metrics_port: self.metrics_port,
            is_leader: self.leader,
            run_jobs: self.run_jobs,
            run_scheduler: self.run_scheduler,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let cli_config = cli_args.to_cli_config();
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let app_config = AppConfig::resolve(&cli_config, file_config)?;
    let jobs_settings = app_config.config.jobs.clone();

    info!(
        "Opening SQLite jobs database at {:?}...",
        app_config.jobs_db_path()
    );
    let job_store = Arc::new(SqliteJobStore::new(app_config.jobs_db_path())?);

    info!("Initializing metrics...");
    let metrics = Arc::new(PrometheusMetrics::new()?);

    let job_server = Arc::new(
        JobServer::new(job_store, metrics.clone())
            .with_cancellation_poll_interval(jobs_settings.cancellation_poll_interval),
    );

    let live_config = Arc::new(match &cli_args.config {
        Some(path) => LiveConfigService::with_file(
            app_config.config.clone(),
            cli_config.clone(),
            path.clone(),
        ),
        None => LiveConfigService::new(app_config.config.clone()),
    });
    let config_service: Arc<dyn ConfigService> = live_config.clone();

    let scheduler_registry = jobs_settings.run_scheduler.then(|| {
        Arc::new(
            SchedulerRegistry::new(
                job_server.clone(),
                config_service.clone(),
                app_config.config.is_leader,
            )
            .with_tick_interval(jobs_settings.scheduler_tick),
        )
    });
    let worker_registry = Arc::new(
        WorkerRegistry::new(job_server.clone(), config_service.clone())
            .with_watcher_poll_interval(jobs_settings.watcher_poll_interval),
    );

    register_builtin_jobs(
        &job_server,
        &config_service,
        Vec::new(),
        scheduler_registry.as_deref(),
        &worker_registry,
    );

    if let Some(registry) = &scheduler_registry {
        let weak = Arc::downgrade(registry);
        config_service.add_config_listener(Box::new(move |old, new| {
            if old.is_leader != new.is_leader {
                if let Some(registry) = weak.upgrade() {
                    registry.handle_cluster_leader_change(new.is_leader);
                }
            }
        }));
        registry.start().await?;
        info!("Scheduler registry started");
    } else {
        info!("Scheduler disabled on this process");
    }
    worker_registry.start().await?;

    let metrics_port = app_config.metrics_port;
    tokio::spawn(async move {
        info!("Metrics server listening on port {}", metrics_port);
        if let Err(e) = run_metrics_server(metrics, metrics_port).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config");
                if let Err(e) = live_config.reload() {
                    error!("Failed to reload config: {:#}", e);
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
        }
    }

    if let Some(registry) = &scheduler_registry {
        if let Err(e) = registry.stop().await {
            error!("Failed to stop scheduler registry: {}", e);
        }
    }
    if let Err(e) = worker_registry.stop().await {
        error!("Failed to stop worker registry: {}", e);
    }
    info!("Job server stopped");
    Ok(())
}
