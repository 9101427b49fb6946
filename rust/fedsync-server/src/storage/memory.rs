use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{StoreResult, VersionStore};
use fedsync_core::{message::Upload, ModelVersion, SerializedWeight};

#[derive(Debug, Default)]
struct Inner {
    versions: HashMap<ModelVersion, Vec<SerializedWeight>>,
    updates: HashMap<ModelVersion, Vec<Upload>>,
}

/// A store that keeps everything in memory. Nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl VersionStore for InMemoryStore {
    async fn list_versions(&self) -> StoreResult<Vec<ModelVersion>> {
        Ok(self.inner.lock().await.versions.keys().cloned().collect())
    }

    async fn load_version(
        &self,
        version: &ModelVersion,
    ) -> StoreResult<Option<Vec<SerializedWeight>>> {
        Ok(self.inner.lock().await.versions.get(version).cloned())
    }

    async fn write_version(
        &mut self,
        version: &ModelVersion,
        weights: &[SerializedWeight],
    ) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .versions
            .insert(version.clone(), weights.to_vec());
        Ok(())
    }

    async fn add_update(&mut self, version: &ModelVersion, update: &Upload) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .updates
            .entry(version.clone())
            .or_default()
            .push(update.clone());
        Ok(())
    }

    async fn pending_updates(&self, version: &ModelVersion) -> StoreResult<Vec<Upload>> {
        Ok(self
            .inner
            .lock()
            .await
            .updates
            .get(version)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_updates(&mut self, version: &ModelVersion) -> StoreResult<()> {
        self.inner.lock().await.updates.remove(version);
        Ok(())
    }

    async fn is_ready(&mut self) -> StoreResult<()> {
        Ok(())
    }
}
