use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{Collection, Repository, StoreResult};

/// Process-local repository. Used by tests and `LEADFLOW_STORAGE=memory`.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    collections: RwLock<HashMap<Collection, BTreeMap<String, Value>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .await
            .get(&collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save(&self, collection: Collection, id: &str, document: &Value) -> StoreResult<()> {
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .insert(id.to_string(), document.clone());
        Ok(())
    }

    async fn load(&self, collection: Collection, id: &str) -> StoreResult<Option<Value>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .and_then(|documents| documents.get(id).cloned()))
    }

    async fn delete(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        Ok(self
            .collections
            .write()
            .await
            .get_mut(&collection)
            .is_some_and(|documents| documents.remove(id).is_some()))
    }

    async fn query(&self, collection: Collection) -> StoreResult<Vec<Value>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default())
    }
}
