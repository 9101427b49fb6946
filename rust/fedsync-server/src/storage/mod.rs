//! Storage of model versions and pending updates.
//!
//! The coordinator persists every published version and every accepted update, so that a
//! restarted coordinator resumes with the latest version and the updates already collected for
//! it.

mod file;
mod memory;

use async_trait::async_trait;

pub use self::{file::FileStore, memory::InMemoryStore};
use fedsync_core::{message::Upload, ModelVersion, SerializedWeight};

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StoreError = anyhow::Error;

/// The result of the storage operation.
pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
/// An abstract store of model versions.
pub trait VersionStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// Lists the stored versions, in no particular order.
    async fn list_versions(&self) -> StoreResult<Vec<ModelVersion>>;

    /// Returns the greatest stored version.
    ///
    /// # Behavior
    ///
    /// - If no version has been written yet, return `StoreResult::Ok(Option::None)`.
    async fn latest_version(&self) -> StoreResult<Option<ModelVersion>> {
        Ok(self.list_versions().await?.into_iter().max())
    }

    /// Loads the weights of a version.
    ///
    /// # Behavior
    ///
    /// - If the version does not exist, return `StoreResult::Ok(Option::None)`.
    async fn load_version(
        &self,
        version: &ModelVersion,
    ) -> StoreResult<Option<Vec<SerializedWeight>>>;

    /// Writes the weights of a version, replacing any previous weights of that version.
    async fn write_version(
        &mut self,
        version: &ModelVersion,
        weights: &[SerializedWeight],
    ) -> StoreResult<()>;

    /// Appends an accepted update to the pending updates of a version.
    async fn add_update(&mut self, version: &ModelVersion, update: &Upload) -> StoreResult<()>;

    /// Returns the pending updates of a version in the order they were added.
    async fn pending_updates(&self, version: &ModelVersion) -> StoreResult<Vec<Upload>>;

    /// Deletes the pending updates of a version.
    async fn clear_updates(&mut self, version: &ModelVersion) -> StoreResult<()>;

    /// A location the trainable unit may save its own representation of a version to, if the
    /// store has one.
    fn model_locator(&self, _version: &ModelVersion) -> Option<String> {
        None
    }

    /// Checks if the store is ready to process requests.
    async fn is_ready(&mut self) -> StoreResult<()>;
}
