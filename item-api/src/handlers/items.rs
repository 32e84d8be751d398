use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error};

use item_common::item::{Item, ItemId};

use super::app::AppState;

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

pub type HandlerError = (StatusCode, Json<ErrorResponse>);

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Item>>, HandlerError> {
    let items = state.store.find_all().await.map_err(internal_error)?;

    Ok(Json(items))
}

pub async fn create(
    State(state): State<AppState>,
    Json(mut item): Json<Item>,
) -> Result<(StatusCode, Json<Item>), HandlerError> {
    debug!("received item: {:?}", item);

    item.validate().map_err(bad_request)?;
    // Ids are assigned by the store.
    item.id = None;

    let saved = state.store.save(item).await.map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(saved)))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<ItemId>,
) -> Result<Json<Item>, HandlerError> {
    match state.store.find_by_id(id).await.map_err(internal_error)? {
        Some(item) => Ok(Json(item)),
        None => Err(not_found(id)),
    }
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<ItemId>,
    Json(mut item): Json<Item>,
) -> Result<Json<Item>, HandlerError> {
    if state
        .store
        .find_by_id(id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found(id));
    }

    item.validate().map_err(bad_request)?;
    item.id = Some(id);

    let saved = state.store.save(item).await.map_err(internal_error)?;

    Ok(Json(saved))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<ItemId>,
) -> Result<StatusCode, HandlerError> {
    if state
        .store
        .find_by_id(id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found(id));
    }

    state.store.delete_by_id(id).await.map_err(internal_error)?;

    Ok(StatusCode::NO_CONTENT)
}

fn not_found(id: ItemId) -> HandlerError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("item {} not found", id),
        }),
    )
}

fn bad_request<E>(err: E) -> HandlerError
where
    E: std::error::Error,
{
    debug!("bad request: {}", err);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub fn internal_error<E>(err: E) -> HandlerError
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
