//! Brokerage Core - order execution service and reconciliation job

use brokerage_core::config::Config;
use brokerage_core::engine::{ExecutionEngine, LocalKeyLock, Reconciler};
use brokerage_core::nats_handler::NatsSubscriber;
use brokerage_core::observability::{
    self,
    health::{start_health_server, HealthState},
};
use brokerage_core::resilience::{with_retry_async, RetryConfig};
use brokerage_core::store::PgStore;

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const SERVICE_NAME: &str = "brokerage-core";

#[derive(Parser)]
#[command(name = "brokerage-core")]
#[command(about = "Brokerage order execution and holdings reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve order, summary and reconcile requests over NATS (default)
    Serve,

    /// Merge duplicate holdings once, install the uniqueness constraint, print the report
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    observability::init_observability(SERVICE_NAME, &config)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting brokerage core");

    let pool = connect_database(&config).await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    store.ensure_schema().await?;

    let locks = Arc::new(LocalKeyLock::new());
    let reconciler = Arc::new(Reconciler::new(store.clone(), locks.clone()));

    let result = match cli.cmd.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let engine = Arc::new(
                ExecutionEngine::new(store, locks)
                    .with_conflict_retries(config.conflict_retry_attempts),
            );
            serve(&config, pool, engine, reconciler).await
        }
        Commands::Reconcile => reconcile(&reconciler).await,
    };

    observability::shutdown_observability();
    result
}

async fn connect_database(config: &Config) -> anyhow::Result<PgPool> {
    let pool = with_retry_async("database_connect", &RetryConfig::default(), || async {
        PgPoolOptions::new()
            .min_connections(config.pool_min_connections)
            .max_connections(config.pool_max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.database_url)
            .await
    })
    .await?;

    info!("Connected to PostgreSQL");
    Ok(pool)
}

async fn reconcile(reconciler: &Reconciler) -> anyhow::Result<()> {
    let report = reconciler.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_clean() {
        error!(
            failures = report.failures.len(),
            constraint_installed = report.constraint_installed,
            "Reconciliation finished with problems"
        );
    }
    Ok(())
}

async fn serve(
    config: &Config,
    pool: PgPool,
    engine: Arc<ExecutionEngine>,
    reconciler: Arc<Reconciler>,
) -> anyhow::Result<()> {
    let nats_connected = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicBool::new(false));

    let health_state = HealthState {
        db_pool: pool,
        nats_connected: nats_connected.clone(),
        ready: ready.clone(),
    };
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(metrics_port, health_state).await {
            error!(error = %e, "Health server failed");
        }
    });

    let nats_client = with_retry_async("nats_connect", &RetryConfig::default(), || async {
        async_nats::connect(&config.nats_url).await
    })
    .await?;
    nats_connected.store(true, Ordering::Relaxed);
    info!(url = %config.nats_url, "Connected to NATS");

    let subscriber = NatsSubscriber::new(nats_client, engine, reconciler);
    ready.store(true, Ordering::Relaxed);

    tokio::select! {
        result = subscriber.run() => {
            if let Err(e) = result {
                error!(error = %e, "Subscriber error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Brokerage core stopped");
    Ok(())
}
