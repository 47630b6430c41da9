use atlas::config::Config;
use atlas::services::CmdbRuntime;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atlas=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();
    info!(
        "Starting Atlas sync core (db: {}, workers: {}, batch: {})",
        config.db_path, config.worker_count, config.batch_size
    );

    // Wire stores and services, then spawn the worker pool and the
    // background loops (monitor, conflict sweep, fallback, cleanup).
    let mut runtime = CmdbRuntime::bootstrap(config).await?;
    runtime.start();
    info!("Sync core running with {} worker(s)", runtime.worker_count());

    // Log an initial health snapshot so a broken store is visible at boot.
    let snapshot = runtime.service.health().await;
    info!(
        "Initial health: {} (relational: {}, graph: {}, cache: {})",
        snapshot.overall.as_str(),
        snapshot.relational.reachable,
        snapshot.graph.reachable,
        snapshot.cache.reachable
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    runtime.shutdown();

    // Give in-flight events a moment to reach their next suspension point;
    // anything abandoned is reclaimed by the processing lease.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    info!("Atlas stopped");
    Ok(())
}
