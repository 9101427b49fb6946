use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{StoreResult, VersionStore};
use fedsync_core::{message::Upload, ModelVersion, SerializedWeight};

const WEIGHTS_FILE: &str = "weights.bin";
const UPDATES_DIR: &str = "updates";
const MODEL_FILE: &str = "model.bin";

/// A store that keeps every version in its own directory below a root directory:
///
/// ```text
/// <root>/<version>/weights.bin
/// <root>/<version>/model.bin
/// <root>/<version>/updates/<index>-<client id>.bin
/// ```
///
/// Weights are written to a temporary file first and renamed afterwards, so a crash never leaves
/// a partially written version behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Arc<PathBuf>,
}

impl FileStore {
    /// Creates a store below `root`. The directory is created if it doesn't exist.
    pub async fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create the storage root {}", root.display()))?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    fn version_dir(&self, version: &ModelVersion) -> StoreResult<PathBuf> {
        let name = version.as_str();
        // versions are used as directory names
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(anyhow!("invalid version name {:?}", name));
        }
        Ok(self.root.join(name))
    }

    fn updates_dir(&self, version: &ModelVersion) -> StoreResult<PathBuf> {
        Ok(self.version_dir(version)?.join(UPDATES_DIR))
    }
}

async fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move {} into place", path.display()))
}

/// Lists the file names in `dir` in lexicographic order. A missing directory is empty.
async fn sorted_entries(dir: &Path) -> StoreResult<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to list {}", dir.display())),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl VersionStore for FileStore {
    async fn list_versions(&self) -> StoreResult<Vec<ModelVersion>> {
        let mut versions = Vec::new();
        for name in sorted_entries(&self.root).await? {
            if fs::metadata(self.root.join(&name).join(WEIGHTS_FILE))
                .await
                .is_ok()
            {
                versions.push(ModelVersion::new(name));
            }
        }
        Ok(versions)
    }

    async fn load_version(
        &self,
        version: &ModelVersion,
    ) -> StoreResult<Option<Vec<SerializedWeight>>> {
        let path = self.version_dir(version)?.join(WEIGHTS_FILE);
        read_optional(&path)
            .await?
            .map(|bytes| {
                bincode::deserialize(&bytes)
                    .with_context(|| format!("corrupted weights in {}", path.display()))
            })
            .transpose()
    }

    async fn write_version(
        &mut self,
        version: &ModelVersion,
        weights: &[SerializedWeight],
    ) -> StoreResult<()> {
        let dir = self.version_dir(version)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let bytes = bincode::serialize(weights)?;
        write_atomic(&dir.join(WEIGHTS_FILE), &bytes).await?;
        debug!("wrote version {} to {}", version, dir.display());
        Ok(())
    }

    async fn add_update(&mut self, version: &ModelVersion, update: &Upload) -> StoreResult<()> {
        let dir = self.updates_dir(version)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let index = sorted_entries(&dir)
            .await?
            .iter()
            .filter(|name| name.ends_with(".bin"))
            .count();
        let path = dir.join(format!("{:08}-{}.bin", index, update.client_id));
        let bytes = bincode::serialize(update)?;
        write_atomic(&path, &bytes).await
    }

    async fn pending_updates(&self, version: &ModelVersion) -> StoreResult<Vec<Upload>> {
        let dir = self.updates_dir(version)?;
        let mut updates = Vec::new();
        for name in sorted_entries(&dir).await? {
            if !name.ends_with(".bin") {
                continue;
            }
            let path = dir.join(name);
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let update = bincode::deserialize(&bytes)
                .with_context(|| format!("corrupted update in {}", path.display()))?;
            updates.push(update);
        }
        Ok(updates)
    }

    async fn clear_updates(&mut self, version: &ModelVersion) -> StoreResult<()> {
        let dir = self.updates_dir(version)?;
        match fs::remove_dir_all(&dir).await {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                Err(err).with_context(|| format!("failed to remove {}", dir.display()))
            }
            _ => Ok(()),
        }
    }

    fn model_locator(&self, version: &ModelVersion) -> Option<String> {
        let path = self.version_dir(version).ok()?.join(MODEL_FILE);
        path.to_str().map(str::to_string)
    }

    async fn is_ready(&mut self) -> StoreResult<()> {
        let metadata = fs::metadata(self.root.as_path())
            .await
            .with_context(|| format!("storage root {} is unavailable", self.root.display()))?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(anyhow!("storage root {} is not a directory", self.root.display()))
        }
    }
}
