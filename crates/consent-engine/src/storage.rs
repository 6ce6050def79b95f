//! Persistent key-value storage boundary.

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ConsentResult;

/// Async key-value store holding one JSON value per key.
///
/// Consent records are stored under `"consent:" + instance id`. The store
/// is accessed without locking; callers rely on write deduplication and
/// the supersede check before each write.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> ConsentResult<Option<Value>>;
    async fn set(&self, key: &str, value: &Value) -> ConsentResult<()>;
    async fn remove(&self, key: &str) -> ConsentResult<()>;
}

pub type SharedStorage = Arc<dyn Storage>;
