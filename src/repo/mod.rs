//! Keyed persistence for per-cluster model records.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::OutputsConfig;
use crate::domain::{ClusterId, ClusterModel};
use crate::error::StoreError;

pub mod file;
pub mod memory;

pub use file::FileModelStore;
pub use memory::InMemoryModelStore;

/// Model records keyed by cluster id.
///
/// `save` replaces the record atomically: a concurrent `load` sees either the
/// previous record or the new one, never a partial write.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn load(&self, cluster_id: &ClusterId) -> Result<ClusterModel, StoreError>;

    async fn save(&self, cluster_id: &ClusterId, model: &ClusterModel) -> Result<(), StoreError>;

    /// `None` instead of `NotFound`.
    async fn find(&self, cluster_id: &ClusterId) -> Result<Option<ClusterModel>, StoreError> {
        match self.load(cluster_id).await {
            Ok(model) => Ok(Some(model)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// File-backed store under the configured model directory.
pub fn open(cfg: &OutputsConfig) -> Arc<dyn ModelStore> {
    Arc::new(FileModelStore::new(cfg.model_store_dir.clone()))
}
