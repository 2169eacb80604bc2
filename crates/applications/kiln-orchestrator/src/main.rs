//! SpriteKiln - game-art job orchestration
//!
//! ## Usage
//!
//! ```bash
//! # HTTP API plus a background sweep every minute
//! kiln serve --database-url postgres://... --listen 0.0.0.0:8080
//!
//! # One-off maintenance
//! kiln sweep     # reconcile unsettled jobs, clean idle/failed instances
//! kiln sync      # reconcile local instance rows with the spot market
//! kiln offers    # list the cheapest matching GPU offers
//! kiln health    # probe every configured provider
//! ```
//!
//! Without `--database-url` all state lives in memory and is lost on exit.

use clap::{Args, Parser, Subcommand};
use futures::{Stream, StreamExt};
use kiln_core::{ComputeProvider, InstanceStore, JobStore, LedgerStore, ObjectStorage, SpotMarket};
use kiln_orchestrator::{
    http::{self, AppState},
    logging, Assembler, BlobStoreConfig, HttpBlobStore, InstancePool, Ledger, MarketplaceConfig,
    MarketplaceProvider, MemoryObjectStorage, MemoryStore, Orchestrator, OrchestratorConfig,
    PgStore, PoolConfig, SelfHostedProvider, ServerlessConfig, ServerlessProvider, VastClient,
    VastConfig, WebhookVerifier,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// SpriteKiln: paid game-art generation on rented GPUs
#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Job lifecycle orchestrator for game-art generation", long_about = None)]
struct Cli {
    /// Postgres URL; in-memory state when absent
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum database connections
    #[arg(long, global = true, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    database_max_connections: u32,

    /// Directory for daily rotated log files
    #[arg(long, global = true, env = "KILN_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(flatten)]
    backends: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BackendArgs {
    /// Marketplace queue base URL
    #[arg(long, global = true, env = "MARKETPLACE_URL")]
    marketplace_url: Option<String>,

    /// Marketplace API key
    #[arg(long, global = true, env = "MARKETPLACE_API_KEY", hide_env_values = true)]
    marketplace_api_key: Option<String>,

    /// Marketplace login user
    #[arg(long, global = true, env = "MARKETPLACE_USERNAME")]
    marketplace_username: Option<String>,

    /// Marketplace login password
    #[arg(long, global = true, env = "MARKETPLACE_PASSWORD", hide_env_values = true)]
    marketplace_password: Option<String>,

    /// Serverless endpoint base URL
    #[arg(long, global = true, env = "SERVERLESS_ENDPOINT_URL")]
    serverless_url: Option<String>,

    /// Serverless API key
    #[arg(long, global = true, env = "SERVERLESS_API_KEY", hide_env_values = true)]
    serverless_api_key: Option<String>,

    /// Public URL workers post callbacks to
    #[arg(long, global = true, env = "KILN_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Shared secret for worker callback signatures
    #[arg(long, global = true, env = "WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// Spot market API key; enables the self-hosted pool
    #[arg(long, global = true, env = "VAST_API_KEY", hide_env_values = true)]
    vast_api_key: Option<String>,

    /// Worker image for pool machines
    #[arg(long, global = true, env = "KILN_WORKER_IMAGE")]
    worker_image: Option<String>,

    /// Pool instance cap
    #[arg(long, global = true, env = "POOL_MAX_INSTANCES", default_value_t = 3)]
    pool_max_instances: usize,

    /// Blob store upload URL
    #[arg(long, global = true, env = "BLOB_STORE_URL")]
    blob_url: Option<String>,

    /// Blob store bearer token
    #[arg(long, global = true, env = "BLOB_STORE_TOKEN", hide_env_values = true)]
    blob_token: Option<String>,

    /// Public prefix for hosted outputs
    #[arg(long, global = true, env = "BLOB_PUBLIC_URL")]
    blob_public_url: Option<String>,

    /// Retries before a job fails for good
    #[arg(long, global = true, env = "KILN_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-attempt time budget (minutes)
    #[arg(long, global = true, env = "KILN_JOB_TIMEOUT_MINS", default_value_t = 15)]
    job_timeout_mins: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API with a background sweep
    Serve {
        /// Listen address
        #[arg(long, env = "KILN_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Seconds between background sweeps (0 disables)
        #[arg(long, env = "KILN_SWEEP_INTERVAL", default_value_t = 60)]
        sweep_interval: u64,

        /// Bearer secret for cron and admin routes
        #[arg(long, env = "CRON_SECRET", hide_env_values = true)]
        cron_secret: Option<String>,
    },

    /// Reconcile unsettled jobs once
    Sweep,

    /// Reconcile local instances with the spot market
    Sync,

    /// List matching GPU offers
    Offers {
        /// Offers to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Probe every configured provider
    Health,
}

struct Stores {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn LedgerStore>,
    instances: Arc<dyn InstanceStore>,
}

async fn open_stores(database_url: Option<&str>, max_connections: u32) -> anyhow::Result<Stores> {
    match database_url {
        Some(url) => {
            let store = Arc::new(PgStore::connect(url, max_connections).await?);
            Ok(Stores {
                jobs: store.clone(),
                ledger: store.clone(),
                instances: store,
            })
        }
        None => {
            warn!("No database URL given; state is kept in memory");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                jobs: store.clone(),
                ledger: store.clone(),
                instances: store,
            })
        }
    }
}

/// Everything a subcommand may need
struct Runtime {
    orchestrator: Arc<Orchestrator>,
    pool: Option<InstancePool>,
    providers: Vec<Arc<dyn ComputeProvider>>,
}

fn vast_config(args: &BackendArgs) -> Option<VastConfig> {
    let key = args.vast_api_key.as_deref().filter(|k| !k.is_empty())?;
    let config = VastConfig::new(key);
    Some(match &args.worker_image {
        Some(image) => config.with_image(image),
        None => config,
    })
}

async fn build_runtime(cli: &Cli) -> anyhow::Result<Runtime> {
    let args = &cli.backends;
    let stores = open_stores(cli.database_url.as_deref(), cli.database_max_connections).await?;

    let pool = match vast_config(args) {
        Some(config) => {
            let launch = config.launch_request();
            let market = Arc::new(VastClient::new(config)?);
            let pool_config = PoolConfig::default().with_max_instances(args.pool_max_instances);
            Some(InstancePool::new(
                stores.instances.clone(),
                market,
                launch,
                pool_config,
            )?)
        }
        None => None,
    };

    let mut providers: Vec<Arc<dyn ComputeProvider>> = Vec::new();
    if let Some(url) = &args.marketplace_url {
        let mut config = MarketplaceConfig::new(url);
        if let Some(key) = &args.marketplace_api_key {
            config = config.with_api_key(key);
        }
        if let (Some(user), Some(password)) = (&args.marketplace_username, &args.marketplace_password) {
            config = config.with_credentials(user, password);
        }
        providers.push(Arc::new(MarketplaceProvider::new(config)?));
    }
    if let Some(url) = &args.serverless_url {
        let mut config = ServerlessConfig::new(url);
        if let Some(key) = &args.serverless_api_key {
            config = config.with_api_key(key);
        }
        if let Some(webhook) = &args.webhook_url {
            config = config.with_webhook_url(webhook);
        }
        providers.push(Arc::new(ServerlessProvider::new(config)?));
    }
    if let Some(pool) = &pool {
        providers.push(Arc::new(SelfHostedProvider::new(pool.clone())));
    }
    if providers.is_empty() {
        warn!("No compute providers configured; every create will be rejected");
    }

    let storage: Arc<dyn ObjectStorage> = match (&args.blob_url, &args.blob_token) {
        (Some(url), Some(token)) => {
            let mut config = BlobStoreConfig::new(url, token);
            if let Some(public) = &args.blob_public_url {
                config = config.with_public_base_url(public);
            }
            Arc::new(HttpBlobStore::new(config)?)
        }
        _ => {
            warn!("No blob store configured; re-hosted outputs are kept in memory");
            Arc::new(MemoryObjectStorage::new())
        }
    };

    let config = OrchestratorConfig::default()
        .with_max_retries(args.max_retries)
        .with_job_timeout(Duration::from_secs(args.job_timeout_mins * 60));
    let mut orchestrator = Orchestrator::new(
        stores.jobs,
        Ledger::new(stores.ledger),
        Assembler::new(storage),
        providers.clone(),
        config,
    )?;
    match args.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => orchestrator = orchestrator.with_webhook_verifier(WebhookVerifier::new(secret)),
        None => warn!("No webhook secret; worker callbacks will be rejected"),
    }

    Ok(Runtime {
        orchestrator: Arc::new(orchestrator),
        pool,
        providers,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_dir.as_deref());

    match &cli.command {
        Commands::Serve {
            listen,
            sweep_interval,
            cron_secret,
        } => serve(&cli, *listen, *sweep_interval, cron_secret.clone()).await,
        Commands::Sweep => {
            let runtime = build_runtime(&cli).await?;
            run_sweep(&runtime.orchestrator, runtime.pool.as_ref()).await;
            Ok(())
        }
        Commands::Sync => sync(&cli).await,
        Commands::Offers { limit } => offers(&cli, *limit).await,
        Commands::Health => health(&cli).await,
    }
}

/// Ticks every `period`, skipping the immediate first tick
fn sweep_ticks(period: Duration) -> Pin<Box<dyn Stream<Item = ()> + Send>> {
    Box::pin(async_stream::stream! {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            yield ();
        }
    })
}

async fn run_sweep(orchestrator: &Orchestrator, pool: Option<&InstancePool>) {
    if let Some(pool) = pool {
        match pool.cleanup().await {
            Ok(report) => {
                if report.idle_destroyed + report.failed_cleaned > 0 {
                    info!(
                        idle_destroyed = report.idle_destroyed,
                        failed_cleaned = report.failed_cleaned,
                        "Instance cleanup finished"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Instance cleanup failed"),
        }
    }
    if let Err(e) = orchestrator.sweep().await {
        error!(error = %e, "Job sweep failed");
    }
}

async fn serve(
    cli: &Cli,
    listen: SocketAddr,
    sweep_interval: u64,
    cron_secret: Option<String>,
) -> anyhow::Result<()> {
    let runtime = build_runtime(cli).await?;
    info!(
        providers = runtime.providers.len(),
        pool = runtime.pool.is_some(),
        "SpriteKiln starting"
    );

    if sweep_interval > 0 {
        let orchestrator = runtime.orchestrator.clone();
        let pool = runtime.pool.clone();
        let period = Duration::from_secs(sweep_interval);
        tokio::spawn(async move {
            let mut ticks = sweep_ticks(period);
            while ticks.next().await.is_some() {
                // A sweep that outlives its period is abandoned; the next tick resumes it
                if tokio::time::timeout(period, run_sweep(&orchestrator, pool.as_ref()))
                    .await
                    .is_err()
                {
                    warn!(period_secs = sweep_interval, "Background sweep timed out");
                }
            }
        });
    }

    let mut state = AppState::new(runtime.orchestrator);
    if let Some(pool) = runtime.pool {
        state = state.with_pool(pool);
    }
    match cron_secret.filter(|s| !s.is_empty()) {
        Some(secret) => state = state.with_cron_secret(secret),
        None => warn!("No cron secret; cron and admin routes are disabled"),
    }

    tokio::select! {
        result = http::serve(state, listen) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}

async fn sync(cli: &Cli) -> anyhow::Result<()> {
    let runtime = build_runtime(cli).await?;
    let pool = runtime
        .pool
        .ok_or_else(|| anyhow::anyhow!("--vast-api-key required for sync"))?;
    let report = pool.sync().await?;
    info!(checked = report.checked, changed = report.changes.len(), "Sync finished");
    for change in &report.changes {
        info!(
            instance_id = %change.instance_id,
            from = %change.from,
            to = %change.to,
            reason = %change.reason,
            "Instance reconciled"
        );
    }
    Ok(())
}

async fn offers(cli: &Cli, limit: usize) -> anyhow::Result<()> {
    let config = vast_config(&cli.backends)
        .ok_or_else(|| anyhow::anyhow!("--vast-api-key required for offers"))?;
    let market = VastClient::new(config)?;
    let offers = market.search_offers(&PoolConfig::default().offer_query).await?;
    info!("{:<10} {:<18} {:>8} {:>8} {:>6}", "ID", "GPU", "VRAM", "$/hr", "REL");
    for offer in offers.iter().take(limit) {
        info!(
            "{:<10} {:<18} {:>6}GB {:>8.3} {:>6.2}",
            offer.id,
            offer.gpu_name,
            offer.gpu_ram_mb / 1024,
            offer.dph_total,
            offer.reliability
        );
    }
    if offers.is_empty() {
        warn!("No offers match the pool's constraints");
    }
    Ok(())
}

async fn health(cli: &Cli) -> anyhow::Result<()> {
    let runtime = build_runtime(cli).await?;
    let mut failures = 0;
    for provider in &runtime.providers {
        match provider.health().await {
            Ok(()) => info!(provider = %provider.kind(), "Healthy"),
            Err(e) => {
                failures += 1;
                error!(provider = %provider.kind(), error = %e, "Unhealthy");
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} of {} providers unhealthy", failures, runtime.providers.len());
    }
    Ok(())
}
