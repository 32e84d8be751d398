use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::item::{Item, ItemId};
use crate::store::{ItemStore, StoreError, StoreResult};

#[derive(Default)]
struct Items {
    next_id: ItemId,
    rows: BTreeMap<ItemId, Item>,
}

/// An ItemStore kept in process memory. Ids are assigned sequentially starting at 1.
#[derive(Default)]
pub struct MemoryItemStore {
    items: RwLock<Items>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store holding `items`, assigning ids where they are missing.
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let mut inner = Items::default();
        for item in items {
            insert(&mut inner, item);
        }

        Self {
            items: RwLock::new(inner),
        }
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, Items>> {
        self.items
            .read()
            .map_err(|_| StoreError::Unavailable("poisoned MemoryItemStore lock".to_owned()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, Items>> {
        self.items
            .write()
            .map_err(|_| StoreError::Unavailable("poisoned MemoryItemStore lock".to_owned()))
    }
}

fn insert(items: &mut Items, mut item: Item) -> Item {
    let id = match item.id {
        Some(id) => id,
        None => items.next_id + 1,
    };
    items.next_id = items.next_id.max(id);
    item.id = Some(id);

    items.rows.insert(id, item.clone());
    item
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn list_ids(&self) -> StoreResult<Vec<ItemId>> {
        Ok(self.read()?.rows.keys().copied().collect())
    }

    async fn find_all(&self) -> StoreResult<Vec<Item>> {
        Ok(self.read()?.rows.values().cloned().collect())
    }

    async fn find_by_id(&self, id: ItemId) -> StoreResult<Option<Item>> {
        Ok(self.read()?.rows.get(&id).cloned())
    }

    async fn save(&self, item: Item) -> StoreResult<Item> {
        Ok(insert(&mut *self.write()?, item))
    }

    async fn delete_by_id(&self, id: ItemId) -> StoreResult<()> {
        self.write()?.rows.remove(&id);
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.read().map(|_| ())
    }
}
