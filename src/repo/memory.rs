use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::ModelStore;
use crate::domain::{ClusterId, ClusterModel};
use crate::error::StoreError;

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryModelStore {
    records: RwLock<HashMap<ClusterId, ClusterModel>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn load(&self, cluster_id: &ClusterId) -> Result<ClusterModel, StoreError> {
        self.records
            .read()
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(cluster_id.clone()))
    }

    async fn save(&self, cluster_id: &ClusterId, model: &ClusterModel) -> Result<(), StoreError> {
        self.records.write().insert(cluster_id.clone(), model.clone());
        Ok(())
    }
}
