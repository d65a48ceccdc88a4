use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use harvest_core::metrics::export_metrics;
use harvest_core::{
    CollectionId, CollectionStatus, CollectionType, DateRange, HarvestConfig, SystemClock,
};
use harvest_metadata::{
    create_sqlite_pool, run_migrations, SqliteCollectionStore, SqliteSegmentStore,
};
use harvest_scheduler::{
    CollectionScheduler, CollectionService, CreateCollection, HttpExecutionClient, RateLimiter,
    SchedulerParts, SchedulerSettings, ServiceSettings,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "harvest-worker")]
#[command(about = "Harvest historical report collection worker", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to HARVEST_CONFIG and the standard locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler loop until interrupted
    Run {
        /// Run a single tick, wait for its dispatches and exit
        #[arg(long)]
        once: bool,
    },

    /// Create a collection and print its id
    Create {
        #[arg(long)]
        workflow_id: String,

        #[arg(long)]
        instance_id: String,

        #[arg(long = "type", value_enum, default_value = "backfill")]
        collection_type: TypeArg,

        /// First day covered (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,

        /// Day after the last day covered (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,

        /// Segment width in days (configured default when omitted)
        #[arg(long)]
        segment_width_days: Option<u32>,

        /// Fixed workflow parameters as a JSON object
        #[arg(long)]
        parameters: Option<String>,
    },

    /// List collections, optionally filtered by status
    List {
        /// Comma-separated statuses, e.g. `running,paused`
        #[arg(long, value_delimiter = ',')]
        status: Vec<CollectionStatus>,
    },

    /// Show a collection with its statistics and segments
    Progress { collection_id: CollectionId },

    /// Stop dispatching new segments of a running collection
    Pause { collection_id: CollectionId },

    /// Resume a paused collection
    Resume { collection_id: CollectionId },

    /// Cancel a collection; in-flight segments finish
    Cancel { collection_id: CollectionId },

    /// Requeue segments that exhausted their retries
    RetryFailed { collection_id: CollectionId },

    /// Delete a collection and its segments
    Delete { collection_id: CollectionId },

    /// Print prometheus metrics of this process
    Metrics,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TypeArg {
    Backfill,
    RollingUpdate,
}

impl From<TypeArg> for CollectionType {
    fn from(value: TypeArg) -> Self {
        match value {
            TypeArg::Backfill => Self::Backfill,
            TypeArg::RollingUpdate => Self::RollingUpdate,
        }
    }
}

struct Stores {
    collections: Arc<SqliteCollectionStore>,
    segments: Arc<SqliteSegmentStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HarvestConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => HarvestConfig::load().context("failed to load config")?,
    };

    let stores = connect(&config).await?;
    let service = CollectionService::new(
        stores.collections.clone(),
        stores.segments.clone(),
        Arc::new(SystemClock),
        ServiceSettings::from_config(&config.collection),
    );

    match cli.command {
        Commands::Run { once } => run(&config, stores, once).await?,
        Commands::Create {
            workflow_id,
            instance_id,
            collection_type,
            start,
            end,
            segment_width_days,
            parameters,
        } => {
            let mut request = CreateCollection::new(
                workflow_id,
                instance_id,
                collection_type.into(),
                DateRange::new(start, end),
            );
            request.segment_width_days = segment_width_days;
            if let Some(raw) = parameters {
                request = request.with_parameters(parse_parameters(&raw)?);
            }
            let collection_id = service.create_collection(request).await?;
            print_json(&serde_json::json!({ "collection_id": collection_id }))?;
        }
        Commands::List { status } => {
            print_json(&service.list_collections(&status).await?)?;
        }
        Commands::Progress { collection_id } => {
            print_json(&service.get_progress(collection_id).await?)?;
        }
        Commands::Pause { collection_id } => print_json(&service.pause(collection_id).await?)?,
        Commands::Resume { collection_id } => print_json(&service.resume(collection_id).await?)?,
        Commands::Cancel { collection_id } => print_json(&service.cancel(collection_id).await?)?,
        Commands::RetryFailed { collection_id } => {
            let requeued = service.retry_failed(collection_id).await?;
            print_json(&serde_json::json!({
                "collection_id": collection_id,
                "requeued": requeued,
            }))?;
        }
        Commands::Delete { collection_id } => {
            service.delete_collection(collection_id).await?;
            print_json(&serde_json::json!({
                "collection_id": collection_id,
                "deleted": true,
            }))?;
        }
        Commands::Metrics => println!("{}", export_metrics()?),
    }

    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // JSON results go to stdout, logs to stderr.
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(config: &HarvestConfig) -> anyhow::Result<Stores> {
    info!("Connecting to database: {}", config.database.url);
    let pool = create_sqlite_pool(&config.database.url, config.database.max_connections)
        .await
        .context("failed to open database")?;
    run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(Stores {
        collections: Arc::new(SqliteCollectionStore::new(pool.clone())),
        segments: Arc::new(SqliteSegmentStore::new(pool)),
    })
}

async fn run(config: &HarvestConfig, stores: Stores, once: bool) -> anyhow::Result<()> {
    let client =
        HttpExecutionClient::new(&config.execution).context("failed to build execution client")?;
    let settings = SchedulerSettings::from_config(config);
    info!(
        "Execution API: {} (rate limit {} per {}s, per-collection concurrency {})",
        config.execution.base_url,
        config.rate_limit.permits_per_window,
        config.rate_limit.window_secs,
        settings.per_collection_concurrency
    );

    let scheduler = CollectionScheduler::new(
        SchedulerParts {
            collections: stores.collections,
            segments: stores.segments,
            client: Arc::new(client),
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            clock: Arc::new(SystemClock),
        },
        config.retry.policy(),
        settings,
    );

    if once {
        let report = scheduler.tick().await?;
        scheduler.drain().await;
        info!(?report, "Single tick finished");
        return Ok(());
    }

    scheduler.start();
    shutdown_signal().await;
    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT (Ctrl+C), shutting down..."),
        () = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

fn parse_parameters(raw: &str) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(raw).context("--parameters is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--parameters must be a JSON object, got {other}"),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
