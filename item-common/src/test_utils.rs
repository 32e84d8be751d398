use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::item::{Item, ItemId};
use crate::memory::MemoryItemStore;
use crate::store::{ItemStore, StoreError, StoreResult};

/// Build `count` valid items with ids 1..=count.
pub fn items(count: usize) -> Vec<Item> {
    (1..=count as ItemId)
        .map(|id| Item {
            id: Some(id),
            ..Item::new(
                &format!("Item {}", id),
                &format!("Description {}", id),
                &format!("test{}@example.com", id),
            )
        })
        .collect()
}

/// A MemoryItemStore with injectable faults, counting what callers do to it.
#[derive(Default)]
pub struct FaultyItemStore {
    inner: MemoryItemStore,
    phantom_ids: Vec<ItemId>,
    failing_saves: HashSet<ItemId>,
    failing_lookups: HashSet<ItemId>,
    panicking_saves: HashSet<ItemId>,
    save_latency: Option<Duration>,
    fail_listing: bool,
    saves: Mutex<Vec<ItemId>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FaultyItemStore {
    pub fn new(items: impl IntoIterator<Item = Item>) -> Self {
        Self {
            inner: MemoryItemStore::with_items(items),
            ..Default::default()
        }
    }

    /// Ids returned by `list_ids` that have no backing item.
    pub fn phantom_ids(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.phantom_ids.extend(ids);
        self
    }

    pub fn failing_saves(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.failing_saves.extend(ids);
        self
    }

    /// Ids for which `find_by_id` returns an error.
    pub fn failing_lookups(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.failing_lookups.extend(ids);
        self
    }

    pub fn panicking_saves(mut self, ids: impl IntoIterator<Item = ItemId>) -> Self {
        self.panicking_saves.extend(ids);
        self
    }

    pub fn save_latency(mut self, latency: Duration) -> Self {
        self.save_latency = Some(latency);
        self
    }

    pub fn fail_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    /// Ids of every `save` call received so far, in call order.
    pub fn saves(&self) -> Vec<ItemId> {
        self.saves
            .lock()
            .map(|saves| saves.clone())
            .unwrap_or_default()
    }

    /// The largest number of `save` calls that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemStore for FaultyItemStore {
    async fn list_ids(&self) -> StoreResult<Vec<ItemId>> {
        if self.fail_listing {
            return Err(StoreError::Unavailable("listing disabled".to_owned()));
        }

        let mut ids = self.inner.list_ids().await?;
        ids.extend(&self.phantom_ids);
        Ok(ids)
    }

    async fn find_all(&self) -> StoreResult<Vec<Item>> {
        self.inner.find_all().await
    }

    async fn find_by_id(&self, id: ItemId) -> StoreResult<Option<Item>> {
        if self.failing_lookups.contains(&id) {
            return Err(StoreError::Unavailable(format!(
                "injected lookup failure for item {}",
                id
            )));
        }

        self.inner.find_by_id(id).await
    }

    async fn save(&self, item: Item) -> StoreResult<Item> {
        let id = item.id.unwrap_or_default();
        if let Ok(mut saves) = self.saves.lock() {
            saves.push(id);
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(latency) = self.save_latency {
            tokio::time::sleep(latency).await;
        }

        let result = if self.panicking_saves.contains(&id) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            panic!("injected panic while saving item {}", id);
        } else if self.failing_saves.contains(&id) {
            Err(StoreError::Unavailable(format!("injected failure for item {}", id)))
        } else {
            self.inner.save(item).await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete_by_id(&self, id: ItemId) -> StoreResult<()> {
        self.inner.delete_by_id(id).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }
}
