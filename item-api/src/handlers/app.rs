use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use item_common::health::HealthRegistry;
use item_common::store::ItemStore;
use item_worker::batch::BatchProcessor;

use super::{items, process};

/// Everything the item routes need to serve a request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ItemStore>,
    pub processor: BatchProcessor,
}

pub fn add_routes(
    router: Router,
    state: AppState,
    readiness: HealthRegistry,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let item_routes = Router::new()
        .route("/api/items", routing::get(items::list).post(items::create))
        .route("/api/items/process", routing::get(process::process_all))
        .route(
            "/api/items/:id",
            routing::get(items::get)
                .put(items::update)
                .delete(items::delete),
        )
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state);

    router
        .route("/", routing::get(index))
        .route("/_liveness", routing::get(index)) // No loop to watch, just check axum health
        .route(
            "/_readiness",
            routing::get(move || std::future::ready(readiness.get_status())),
        )
        .merge(item_routes)
}

pub async fn index() -> &'static str {
    "item api"
}
