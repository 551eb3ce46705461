//! In-memory dataset catalog.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::ports::{DatasetCatalog, DatasetHandle};

#[derive(Debug, Default)]
pub struct InMemoryDatasetCatalog {
    datasets: RwLock<BTreeMap<String, DatasetHandle>>,
}

impl InMemoryDatasetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, id: impl Into<String>, name: impl Into<String>) {
        let id = id.into();
        let handle = DatasetHandle {
            id: id.clone(),
            name: name.into(),
        };
        self.datasets.write().await.insert(id, handle);
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.datasets.write().await.remove(id).is_some()
    }
}

#[async_trait]
impl DatasetCatalog for InMemoryDatasetCatalog {
    async fn list_dataset_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.datasets.read().await.keys().cloned().collect())
    }

    async fn load(&self, dataset_id: &str) -> anyhow::Result<Option<DatasetHandle>> {
        Ok(self.datasets.read().await.get(dataset_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_list_remove() {
        let catalog = InMemoryDatasetCatalog::new();
        catalog.add("ds-2", "second").await;
        catalog.add("ds-1", "first").await;
        assert_eq!(catalog.list_dataset_ids().await.unwrap(), vec!["ds-1", "ds-2"]);

        assert!(catalog.remove("ds-1").await);
        assert!(catalog.load("ds-1").await.unwrap().is_none());
        assert_eq!(catalog.load("ds-2").await.unwrap().unwrap().name, "second");
    }
}
