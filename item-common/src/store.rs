use async_trait::async_trait;
use thiserror::Error;

use crate::item::{Item, ItemId, ParseItemStatusError};

/// Enumeration of errors for operations with an ItemStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("stored item {id} is invalid: {error}")]
    ParseItemError {
        id: ItemId,
        error: ParseItemStatusError,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Access to persisted Items.
///
/// Implementations must be safe to call concurrently for independent ids: a batch run issues
/// lookups and saves for many ids at the same time without any cross-item locking.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// List the ids of every stored Item.
    async fn list_ids(&self) -> StoreResult<Vec<ItemId>>;

    async fn find_all(&self) -> StoreResult<Vec<Item>>;

    async fn find_by_id(&self, id: ItemId) -> StoreResult<Option<Item>>;

    /// Insert or update an Item, returning it as persisted. Items without an id are assigned one.
    async fn save(&self, item: Item) -> StoreResult<Item>;

    /// Delete an Item. Deleting an id that does not exist is not an error.
    async fn delete_by_id(&self, id: ItemId) -> StoreResult<()>;

    /// Check the store can serve requests.
    async fn ping(&self) -> StoreResult<()>;
}
