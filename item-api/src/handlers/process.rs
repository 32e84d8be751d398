use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use item_common::item::{Item, ItemId};
use item_worker::error::{BatchError, BatchFailure};

use super::app::AppState;
use super::items::{internal_error, ErrorResponse};

#[derive(Serialize, Deserialize, Debug)]
pub struct ItemFailureResponse {
    pub id: ItemId,
    pub error: String,
}

/// Returned when at least one item failed: every failure, and what was processed regardless.
#[derive(Serialize, Deserialize, Debug)]
pub struct BatchFailureResponse {
    pub error: String,
    pub processed: Vec<Item>,
    pub failures: Vec<ItemFailureResponse>,
}

impl From<BatchFailure> for BatchFailureResponse {
    fn from(failure: BatchFailure) -> Self {
        Self {
            error: failure.to_string(),
            failures: failure
                .failures
                .iter()
                .map(|item_failure| ItemFailureResponse {
                    id: item_failure.id,
                    error: item_failure.cause.to_string(),
                })
                .collect(),
            processed: failure.processed,
        }
    }
}

/// Run a batch over every stored item. If the client goes away the run is abandoned, but
/// items already handed to the pool still get processed.
pub async fn process_all(State(state): State<AppState>) -> Response {
    let start_time = Instant::now();

    let result = state.processor.process_all().await;

    let elapsed_time = start_time.elapsed().as_secs_f64();
    metrics::histogram!("item_api_process_duration_seconds").record(elapsed_time);

    match result {
        Ok(items) => Json(items).into_response(),
        Err(BatchError::ItemFailures(failure)) => {
            warn!("batch run failed for items {:?}", failure.failed_ids());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(BatchFailureResponse::from(failure)),
            )
                .into_response()
        }
        Err(error @ BatchError::Abandoned { .. }) => {
            warn!("{}", error);
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ErrorResponse {
                    error: error.to_string(),
                }),
            )
                .into_response()
        }
        Err(error @ BatchError::Snapshot(_)) => internal_error(error).into_response(),
    }
}
