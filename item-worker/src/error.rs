use std::fmt;
use std::time;

use item_common::item::{Item, ItemId};
use item_common::store::StoreError;
use thiserror::Error;

/// Why a single item could not be processed.
#[derive(Error, Debug)]
pub enum ItemFailureCause {
    #[error("item not found")]
    NotFound,
    #[error("store rejected the item: {0}")]
    Persistence(#[from] StoreError),
    #[error("processing task panicked: {0}")]
    Panicked(String),
    #[error("worker pool is closed")]
    PoolClosed,
}

/// A failure of one unit of work, tagged with the item it was processing.
#[derive(Error, Debug)]
#[error("item {id}: {cause}")]
pub struct ItemFailure {
    pub id: ItemId,
    #[source]
    pub cause: ItemFailureCause,
}

/// Every failure of a batch run, along with the items that were processed anyway.
#[derive(Debug)]
pub struct BatchFailure {
    pub processed: Vec<Item>,
    pub failures: Vec<ItemFailure>,
}

impl BatchFailure {
    pub fn failed_ids(&self) -> Vec<ItemId> {
        self.failures.iter().map(|failure| failure.id).collect()
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} items failed",
            self.failures.len(),
            self.failures.len() + self.processed.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchFailure {}

/// Enumeration of errors a batch run can end with.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("failed to snapshot item ids: {0}")]
    Snapshot(#[source] StoreError),
    #[error("batch run completed with failures: {0}")]
    ItemFailures(BatchFailure),
    #[error("batch run abandoned after {elapsed:?} with {pending} items pending")]
    Abandoned {
        pending: usize,
        elapsed: time::Duration,
    },
}
