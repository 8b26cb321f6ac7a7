//! Filesystem contract storage.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{AdapterError, ContractStorage};

/// Stores artifacts below a root directory, keyed by relative path
pub struct FsContractStorage {
    root: PathBuf,
}

impl FsContractStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, AdapterError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(AdapterError::Fatal(format!("invalid storage key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ContractStorage for FsContractStorage {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, AdapterError> {
        let path = self.resolve(key)?;
        let uri = format!("file://{}", path.display());

        // Same key, same bytes: nothing to do
        if let Ok(existing) = fs::read(&path).await {
            if existing == bytes {
                return Ok(uri);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AdapterError::Transient(e.to_string()))?;
        }

        // Write to a temp file then rename so readers never see a partial artifact
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        Ok(uri)
    }
}
