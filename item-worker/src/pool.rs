use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::config::PoolSize;

/// A fixed number of slots for processing items. Created once per service and shared by every
/// batch run, so concurrent runs together never exceed `size` items in flight.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: PoolSize) -> Self {
        let size = size.0.get();

        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free slot. The slot is released when the permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }

    /// Fraction of slots currently taken.
    pub fn saturation(&self) -> f64 {
        1f64 - self.semaphore.available_permits() as f64 / self.size as f64
    }

    pub fn report_saturation(&self) {
        metrics::gauge!("item_batch_pool_saturation_percent").set(self.saturation());
    }

    /// Stop handing out slots. Items waiting on a slot fail with `PoolClosed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
