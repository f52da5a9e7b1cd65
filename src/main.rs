use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pipeline_server::config::{AppConfig, CliConfig, FileConfig};
use pipeline_server::metrics;
use pipeline_server::notifications::{LogMailTransport, NotificationScheduler};
use pipeline_server::pipeline::{tasks::builtin_registry, BlockingPool, Job, PipelineService};
use pipeline_server::status::SqliteStatusStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

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
    /// Path to a TOML config file. Its values override the CLI flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the status database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Directory for job log files. Defaults to `<db_dir>/logs`.
    #[clap(long, value_parser = parse_path)]
    pub log_dir: Option<PathBuf>,

    /// Maximum number of jobs executing at once.
    #[clap(long)]
    pub pool_size: Option<usize>,

    /// JSON job files to submit once the queue is up.
    #[clap(long, value_parser = parse_path)]
    pub submit: Vec<PathBuf>,
}

fn load_job(path: &Path, log_dir: &Path) -> Result<Job> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {:?}", path))?;
    let mut job: Job = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {:?}", path))?;
    if job.log_file.is_none() {
        job.log_file = Some(
            log_dir
                .join(format!("{}.log", job.guid))
                .to_string_lossy()
                .to_string(),
        );
    }
    Ok(job)
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
        .try_init()?;

    info!("Starting pipeline-server ({})", env!("GIT_HASH"));

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        log_dir: cli_args.log_dir.clone(),
        pool_size: cli_args.pool_size,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", config.log_dir))?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    let db_path = config.status_db_path();
    info!("Opening SQLite status database at {:?}...", db_path);
    let store = Arc::new(SqliteStatusStore::new(&db_path)?);

    let pool = Arc::new(BlockingPool::current(config.job_queue.pool_size));
    let service = PipelineService::new(store.clone(), pool, builtin_registry());

    let requeued = service.job_store().requeue_outstanding()?;
    info!("Requeued {} outstanding jobs", requeued);

    let scheduler = Arc::new(NotificationScheduler::new(
        store.clone(),
        store.clone(),
        Arc::new(LogMailTransport),
        config.notifications.defaults(),
    ));
    scheduler.restore()?;
    if config.notifications.enabled {
        let added = scheduler.enable_defaults()?;
        info!("Enabled {} site-wide notification timers", added);
    }

    for path in &cli_args.submit {
        let job = load_job(path, &config.log_dir)?;
        let guid = job.guid.clone();
        match service.submit(job) {
            Ok(()) => info!("Submitted job {} from {:?}", guid, path),
            Err(e) => warn!("Could not submit job from {:?}: {}", path, e),
        }
    }

    info!(
        "Pipeline ready with {} workers, press Ctrl-C to stop",
        config.job_queue.pool_size
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    scheduler.shutdown();
    service.shutdown();
    if !service.wait_idle(SHUTDOWN_GRACE).await {
        warn!("Jobs still running after {:?}", SHUTDOWN_GRACE);
    }
    debug!("Final metrics:\n{}", metrics::render()?);
    Ok(())
}
