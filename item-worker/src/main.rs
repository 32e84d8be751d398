//! Periodically run a batch over every stored Item.
use std::sync::Arc;

use axum::{routing, Router};
use envconfig::Envconfig;
use eyre::Result;

use item_common::health::HealthRegistry;
use item_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use item_common::pgstore::PgItemStore;
use item_worker::batch::BatchProcessor;
use item_worker::config::Config;
use item_worker::error::BatchError;
use item_worker::pool::WorkerPool;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let store = PgItemStore::new(&config.database_url, config.max_pg_connections)?;
    let pool = WorkerPool::new(config.batch.pool_size);
    let processor = BatchProcessor::from_config(Arc::new(store), pool, &config.batch);

    let liveness = HealthRegistry::new("liveness");
    // Reported every interval, also while a run is pending.
    let deadline = time::Duration::try_from(config.run_interval.0 * 2)?;
    let worker_liveness = liveness.register("batch-worker", deadline).await;

    let recorder_handle = setup_metrics_recorder()?;
    let router = Router::new().route(
        "/_liveness",
        routing::get(move || std::future::ready(liveness.get_status())),
    );
    let router = setup_metrics_routes(router, recorder_handle);
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            tracing::error!("failed to start item-worker http server, {}", e);
        }
    });

    let mut interval = tokio::time::interval(config.run_interval.0);
    loop {
        interval.tick().await;

        match processor
            .process_all_reporting(&worker_liveness, config.run_interval.0)
            .await
        {
            Ok(items) => tracing::info!(processed = items.len(), "batch run succeeded"),
            Err(BatchError::ItemFailures(failure)) => {
                for item_failure in &failure.failures {
                    tracing::error!(item_id = item_failure.id, "{}", item_failure.cause);
                }
            }
            Err(e) => tracing::error!("batch run failed: {}", e),
        }
    }
}
