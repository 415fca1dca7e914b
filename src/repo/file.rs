//! One JSON file per cluster, replaced with write-fsync-rename.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::ModelStore;
use crate::domain::{ClusterId, ClusterModel};
use crate::error::StoreError;

pub struct FileModelStore {
    dir: PathBuf,
}

impl FileModelStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Record path for a cluster; ids are escaped so any string is a safe file name.
    pub fn record_path(&self, cluster_id: &ClusterId) -> PathBuf {
        self.dir.join(format!("{}.json", escape(cluster_id.as_str())))
    }
}

fn escape(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

#[async_trait]
impl ModelStore for FileModelStore {
    async fn load(&self, cluster_id: &ClusterId) -> Result<ClusterModel, StoreError> {
        let path = self.record_path(cluster_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(cluster_id.clone()))
            }
            Err(e) => return Err(io_err(e)),
        };

        let model: ClusterModel =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                cluster_id: cluster_id.clone(),
                reason: e.to_string(),
            })?;
        if &model.cluster_id != cluster_id {
            return Err(StoreError::Corrupt {
                cluster_id: cluster_id.clone(),
                reason: format!("record belongs to cluster {}", model.cluster_id),
            });
        }
        Ok(model)
    }

    async fn save(&self, cluster_id: &ClusterId, model: &ClusterModel) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec_pretty(model).map_err(|e| StoreError::Corrupt {
            cluster_id: cluster_id.clone(),
            reason: e.to_string(),
        })?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let final_path = self.record_path(cluster_id);
        let tmp_path = self
            .dir
            .join(format!(".{}.{}.tmp", escape(cluster_id.as_str()), Uuid::new_v4()));

        let write = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&serialized).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp_path, &final_path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_err(e));
        }

        debug!(cluster_id = %cluster_id, path = %final_path.display(), state = %model.state, "model record saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArimaOrder, ModelState, SeasonalOrder};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn record(id: &str) -> ClusterModel {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        ClusterModel::unfit(ClusterId::from(id), ArimaOrder::new(1, 0, 0), SeasonalOrder::new(1, 1, 0, 48), d, d)
    }

    #[tokio::test]
    async fn test_round_trip_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(dir.path().join("models"));
        let id = ClusterId::from("north/east 1");

        assert!(matches!(store.load(&id).await, Err(StoreError::NotFound(_))));

        let mut model = record("north/east 1");
        model.state = ModelState::Failed;
        model.failure_reason = Some("too short".to_string());
        store.save(&id, &model).await.unwrap();

        assert_eq!(store.load(&id).await.unwrap(), model);
        assert!(store.record_path(&id).ends_with("north%2Feast%201.json"));
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(dir.path().to_path_buf());
        let id = ClusterId::from("A");

        let mut model = record("A");
        store.save(&id, &model).await.unwrap();
        model.history_days = 42;
        store.save(&id, &model).await.unwrap();

        assert_eq!(store.load(&id).await.unwrap().history_days, 42);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["A.json".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_readers_never_see_partial_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileModelStore::new(dir.path().to_path_buf()));
        let id = ClusterId::from("A");
        store.save(&id, &record("A")).await.unwrap();

        let writer = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let mut m = record("A");
                    m.history_days = i;
                    store.save(&id, &m).await.unwrap();
                }
            })
        };
        for _ in 0..50 {
            assert!(store.load(&id).await.is_ok());
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_record_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(dir.path().to_path_buf());
        let id = ClusterId::from("B");
        std::fs::write(store.record_path(&id), b"{not json").unwrap();
        assert!(matches!(store.load(&id).await, Err(StoreError::Corrupt { .. })));
    }
}
