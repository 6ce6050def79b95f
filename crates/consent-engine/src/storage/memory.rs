use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ConsentError, ConsentResult};
use crate::storage::Storage;

/// In-memory storage, for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> ConsentResult<Option<Value>> {
        let data = self
            .data
            .lock()
            .map_err(|_| ConsentError::Storage("memory storage lock poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> ConsentResult<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| ConsentError::Storage("memory storage lock poisoned".to_string()))?;
        data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> ConsentResult<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| ConsentError::Storage("memory storage lock poisoned".to_string()))?;
        data.remove(key);
        Ok(())
    }
}
