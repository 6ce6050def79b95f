use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ConsentError, ConsentResult};
use crate::storage::Storage;

/// File-backed storage: one JSON file per key under a root directory.
#[derive(Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> ConsentResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    async fn ensure_root(&self) -> ConsentResult<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|error| {
            ConsentError::Storage(format!(
                "failed to create storage directory {}: {error}",
                self.root.display()
            ))
        })
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> ConsentResult<Option<Value>> {
        let path = self.path_for(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(ConsentError::Storage(format!(
                    "failed to read storage file {}: {error}",
                    path.display()
                )))
            }
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|error| ConsentError::Storage(format!("storage parse error: {error}")))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &Value) -> ConsentResult<()> {
        let path = self.path_for(key)?;
        self.ensure_root().await?;
        let serialized = serde_json::to_vec_pretty(value)
            .map_err(|error| ConsentError::Storage(format!("storage serialize error: {error}")))?;
        tokio::fs::write(&path, serialized).await.map_err(|error| {
            ConsentError::Storage(format!(
                "failed to write storage file {}: {error}",
                path.display()
            ))
        })
    }

    async fn remove(&self, key: &str) -> ConsentResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ConsentError::Storage(format!(
                "failed to remove storage file {}: {error}",
                path.display()
            ))),
        }
    }
}

fn validate_key(key: &str) -> ConsentResult<()> {
    if key.is_empty() || key == "." || key == ".." {
        return Err(ConsentError::InvalidInput(format!(
            "invalid storage key {key}"
        )));
    }
    if key.contains('/') || key.contains('\\') {
        return Err(ConsentError::InvalidInput(format!(
            "invalid storage key {key}"
        )));
    }
    Ok(())
}
