use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;

use handlers::AppState;
use item_common::health::{HealthHandle, HealthRegistry};
use item_common::metrics::{setup_metrics_recorder, setup_metrics_routes};
use item_common::pgstore::PgItemStore;
use item_common::store::ItemStore;
use item_worker::batch::BatchProcessor;
use item_worker::pool::WorkerPool;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

/// Keep the readiness of `store` up to date for as long as the process runs.
async fn store_health_loop(store: Arc<dyn ItemStore>, handle: HealthHandle, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        handle.report_result(&store.ping().await).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let store: Arc<dyn ItemStore> = Arc::new(PgItemStore::new(
        &config.database_url,
        config.max_pg_connections,
    )?);
    // One pool for the whole process, shared by every batch run.
    let pool = WorkerPool::new(config.batch.pool_size);
    let processor = BatchProcessor::from_config(store.clone(), pool, &config.batch);

    let readiness = HealthRegistry::new("readiness");
    let every = config.health_check_interval.0;
    let store_readiness = readiness
        .register("store", time::Duration::try_from(every * 3)?)
        .await;
    tokio::spawn(store_health_loop(store.clone(), store_readiness, every));

    let state = AppState { store, processor };
    let app = handlers::add_routes(
        Router::new(),
        state,
        readiness,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app, setup_metrics_recorder()?);

    if let Err(e) = listen(app, config.bind()).await {
        tracing::error!("failed to start item-api http server, {}", e);
        return Err(e);
    }

    Ok(())
}
