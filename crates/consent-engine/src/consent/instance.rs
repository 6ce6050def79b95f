//! A single consent instance: one id's record lifecycle against the
//! persistent store and the optional remote update endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::consent::record::{self, ConsentMetadata, ConsentRecord, PurposeValue};
use crate::consent::ConsentState;
use crate::error::ConsentResult;
use crate::remote::{ConsentRemote, HttpConsentRemote, UpdateHrefRequest};
use crate::storage::SharedStorage;

const STORAGE_KEY_PREFIX: &str = "consent:";

/// Per-instance configuration, as supplied by the embedding page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsentInstanceConfig {
    /// Endpoint notified after a decided consent value is stored.
    pub on_update_href: Option<String>,
    /// Default shared data, merged under any driver-supplied value.
    pub shared_data: Option<Value>,
}

/// Arguments to a consent update. `state` is the raw signal from the
/// prompt or remote flow; the stored state is recomputed against the
/// previous one.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub state: ConsentState,
    pub consent_string: Option<String>,
    pub purpose_consents: Option<HashMap<String, PurposeValue>>,
    pub metadata: Option<ConsentMetadata>,
    /// Updates replayed from the remote authority rather than the user.
    pub is_system_update: bool,
    pub tcf_policy_version: Option<u32>,
}

struct InstanceState {
    /// Most recently computed in-memory record; authoritative once set.
    local: Option<ConsentRecord>,
    /// What we believe currently sits in the store, for write dedup.
    persisted: Option<ConsentRecord>,
    /// Requested-but-not-yet-committed dirty flag.
    pending_dirty: Option<bool>,
    storage_read: bool,
    /// Bumped on every applied update; a persist whose generation is
    /// stale has been superseded and must not touch the store.
    generation: u64,
}

struct PendingWrite {
    record: ConsentRecord,
    generation: u64,
}

/// Cheap-to-clone handle; clones share the same in-memory state.
#[derive(Clone)]
pub struct ConsentInstance {
    id: String,
    client_id: String,
    storage_key: String,
    storage: SharedStorage,
    remote: Option<Arc<dyn ConsentRemote>>,
    state: Arc<Mutex<InstanceState>>,
}

impl ConsentInstance {
    pub fn new(
        id: impl Into<String>,
        config: &ConsentInstanceConfig,
        storage: SharedStorage,
    ) -> ConsentResult<Self> {
        let remote = match config.on_update_href.as_deref() {
            Some(href) => Some(Arc::new(HttpConsentRemote::new(href)?) as Arc<dyn ConsentRemote>),
            None => None,
        };
        Ok(Self::with_remote(id, storage, remote))
    }

    pub fn with_remote(
        id: impl Into<String>,
        storage: SharedStorage,
        remote: Option<Arc<dyn ConsentRemote>>,
    ) -> Self {
        let id = id.into();
        Self {
            storage_key: format!("{STORAGE_KEY_PREFIX}{id}"),
            id,
            client_id: Uuid::new_v4().to_string(),
            storage,
            remote,
            state: Arc::new(Mutex::new(InstanceState {
                local: None,
                persisted: None,
                pending_dirty: None,
                storage_read: false,
                generation: 0,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current record. Resolves without I/O once a local value exists;
    /// otherwise reads the store once. Read failures degrade to an
    /// `Unknown` record, never an error.
    pub async fn get(&self) -> ConsentRecord {
        if let Some(local) = self.state().local.clone() {
            return local;
        }
        let stored = match self.storage.get(&self.storage_key).await {
            Ok(value) => value,
            Err(error) => {
                tracing::error!("failed to read stored consent for {}: {error}", self.id);
                None
            }
        };
        let read = record::deserialize(stored.as_ref());
        let (result, invalidate) = {
            let mut state = self.state();
            if let Some(local) = &state.local {
                // an update raced the read; the local value wins
                (local.clone(), false)
            } else if !state.storage_read {
                state.storage_read = true;
                state.local = Some(read.clone());
                state.persisted = Some(read.clone());
                (read.clone(), read.is_dirty)
            } else {
                (read, false)
            }
        };
        if invalidate {
            // a dirty cache must not be served again: tell the remote the
            // value is unknown and drop the stored copy
            self.notify_remote(&ConsentRecord::new(ConsentState::Unknown))
                .await;
            if let Err(error) = self.storage.remove(&self.storage_key).await {
                tracing::error!("failed to clear dirty consent for {}: {error}", self.id);
            }
        }
        result
    }

    /// Apply an update. The in-memory record changes before this returns,
    /// so callers observe updates in call order; persistence runs on the
    /// returned task and is abandoned if a later update supersedes it.
    pub fn update(&self, request: UpdateRequest) -> JoinHandle<()> {
        let pending = self.apply_update(request);
        let instance = self.clone();
        tokio::spawn(async move {
            if let Some(write) = pending {
                instance.commit(write).await;
            }
        })
    }

    /// Record a dirty override and, when the stored value does not already
    /// carry it, rewrite the store from the current record.
    pub async fn set_dirty_bit(&self, dirty: bool) {
        self.state().pending_dirty = Some(dirty);
        let current = self.get().await;
        let needs_rewrite = match &self.state().persisted {
            // only decided records have a durable form to rewrite
            Some(saved) => record::serialize(saved).is_some() && saved.is_dirty != dirty,
            None => false,
        };
        if !needs_rewrite {
            return;
        }
        let handle = self.update(UpdateRequest {
            state: current.state,
            consent_string: current.consent_string,
            purpose_consents: current.purpose_consents,
            metadata: current.metadata,
            is_system_update: false,
            tcf_policy_version: current.tcf_policy_version,
        });
        if let Err(error) = handle.await {
            tracing::error!("dirty bit rewrite for {} failed: {error}", self.id);
        }
    }

    fn apply_update(&self, request: UpdateRequest) -> Option<PendingWrite> {
        let mut state = self.state();
        let previous = state.local.clone();
        let calculated = record::reconcile(request.state, previous.as_ref().map(|r| r.state));

        if request.state == ConsentState::Dismissed {
            // dismissal never mutates supplementary data and never persists
            let prev = previous.unwrap_or_else(|| ConsentRecord::new(ConsentState::Unknown));
            state.local = Some(ConsentRecord {
                state: calculated,
                consent_string: prev.consent_string,
                metadata: prev.metadata,
                purpose_consents: prev.purpose_consents,
                is_dirty: false,
                tcf_policy_version: prev.tcf_policy_version,
            });
            return None;
        }

        // a system update over a dirty record stays dirty; any user update
        // revalidates the cache
        let local_dirty =
            request.is_system_update && previous.as_ref().is_some_and(|r| r.is_dirty);
        let new_local = ConsentRecord {
            state: calculated,
            consent_string: request.consent_string,
            metadata: request.metadata,
            purpose_consents: request.purpose_consents,
            is_dirty: local_dirty,
            tcf_policy_version: request.tcf_policy_version,
        };
        state.local = Some(new_local.clone());
        state.generation += 1;
        let generation = state.generation;

        let mut candidate = new_local;
        if let Some(dirty) = state.pending_dirty {
            candidate.is_dirty = dirty;
        }
        let write_needed = match &state.persisted {
            Some(saved) => !record::same_stored_value(&candidate, saved, None),
            None => true,
        };
        if !write_needed {
            return None;
        }
        state.persisted = Some(candidate.clone());
        Some(PendingWrite {
            record: candidate,
            generation,
        })
    }

    async fn commit(&self, write: PendingWrite) {
        if self.state().generation != write.generation {
            // superseded by a newer update; that one owns the store now
            return;
        }
        let Some(value) = record::serialize(&write.record) else {
            return;
        };
        if let Err(error) = self.storage.set(&self.storage_key, &value).await {
            tracing::error!("failed to store consent for {}: {error}", self.id);
            return;
        }
        if write.record.is_dirty {
            // stale-marked values are never announced
            return;
        }
        self.notify_remote(&write.record).await;
    }

    async fn notify_remote(&self, record: &ConsentRecord) {
        let Some(remote) = &self.remote else {
            return;
        };
        let request = UpdateHrefRequest::from_record(&self.id, &self.client_id, record);
        if let Err(error) = remote.notify(&request).await {
            tracing::warn!("consent update notify for {} failed: {error}", self.id);
        }
    }

    fn state(&self) -> MutexGuard<'_, InstanceState> {
        // a poisoned lock only means a writer panicked; the data is still
        // the latest applied update
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConsentError, ConsentResult};
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    /// Storage wrapper counting writes and optionally slowing them down.
    struct InstrumentedStorage {
        inner: MemoryStorage,
        writes: AtomicUsize,
        delay_first_write: Option<Duration>,
    }

    impl InstrumentedStorage {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                writes: AtomicUsize::new(0),
                delay_first_write: None,
            }
        }

        fn with_slow_first_write(delay: Duration) -> Self {
            Self {
                delay_first_write: Some(delay),
                ..Self::new()
            }
        }

        fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Storage for InstrumentedStorage {
        async fn get(&self, key: &str) -> ConsentResult<Option<Value>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &Value) -> ConsentResult<()> {
            let write = self.writes.fetch_add(1, Ordering::SeqCst);
            if write == 0 {
                if let Some(delay) = self.delay_first_write {
                    tokio::time::sleep(delay).await;
                }
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> ConsentResult<()> {
            self.inner.remove(key).await
        }
    }

    struct FailingStorage;

    #[async_trait]
    impl Storage for FailingStorage {
        async fn get(&self, _key: &str) -> ConsentResult<Option<Value>> {
            Err(ConsentError::Storage("backend offline".to_string()))
        }

        async fn set(&self, _key: &str, _value: &Value) -> ConsentResult<()> {
            Err(ConsentError::Storage("backend offline".to_string()))
        }

        async fn remove(&self, _key: &str) -> ConsentResult<()> {
            Err(ConsentError::Storage("backend offline".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingRemote {
        requests: Mutex<Vec<UpdateHrefRequest>>,
    }

    impl RecordingRemote {
        fn requests(&self) -> Vec<UpdateHrefRequest> {
            self.requests.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ConsentRemote for RecordingRemote {
        async fn notify(&self, request: &UpdateHrefRequest) -> ConsentResult<()> {
            self.requests.lock().expect("lock").push(request.clone());
            Ok(())
        }
    }

    fn accepted(consent_string: &str) -> UpdateRequest {
        UpdateRequest {
            state: ConsentState::Accepted,
            consent_string: Some(consent_string.to_string()),
            ..UpdateRequest::default()
        }
    }

    #[tokio::test]
    async fn empty_store_resolves_unknown_then_updates() {
        let storage = Arc::new(MemoryStorage::new());
        let instance =
            ConsentInstance::with_remote("test", storage.clone() as SharedStorage, None);

        assert_eq!(instance.get().await.state, ConsentState::Unknown);

        instance.update(accepted("str1")).await.expect("update");

        let record = instance.get().await;
        assert_eq!(record.state, ConsentState::Accepted);
        assert_eq!(record.consent_string.as_deref(), Some("str1"));
        assert_eq!(
            storage.get("consent:test").await.expect("get"),
            Some(json!({"s": 1, "r": "str1"}))
        );
    }

    #[tokio::test]
    async fn identical_updates_write_once() {
        let storage = Arc::new(InstrumentedStorage::new());
        let instance =
            ConsentInstance::with_remote("test", storage.clone() as SharedStorage, None);

        instance.get().await;
        instance.update(accepted("str1")).await.expect("update");
        instance.update(accepted("str1")).await.expect("update");

        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test]
    async fn overlapping_updates_keep_the_last_value() {
        let storage = Arc::new(InstrumentedStorage::with_slow_first_write(
            Duration::from_millis(20),
        ));
        let instance =
            ConsentInstance::with_remote("test", storage.clone() as SharedStorage, None);
        instance.get().await;

        let first = instance.update(accepted("first"));
        let second = instance.update(UpdateRequest {
            state: ConsentState::Rejected,
            consent_string: Some("second".to_string()),
            ..UpdateRequest::default()
        });
        first.await.expect("first");
        second.await.expect("second");

        assert_eq!(
            storage.get("consent:test").await.expect("get"),
            Some(json!({"s": 0, "r": "second"}))
        );
        assert_eq!(instance.get().await.state, ConsentState::Rejected);
    }

    #[tokio::test]
    async fn dismissal_carries_prior_data_and_skips_persistence() {
        let storage = Arc::new(InstrumentedStorage::new());
        let instance =
            ConsentInstance::with_remote("test", storage.clone() as SharedStorage, None);
        instance.get().await;

        instance.update(accepted("str1")).await.expect("update");
        instance
            .update(UpdateRequest {
                state: ConsentState::Dismissed,
                ..UpdateRequest::default()
            })
            .await
            .expect("dismiss");

        let record = instance.get().await;
        assert_eq!(record.state, ConsentState::Accepted);
        assert_eq!(record.consent_string.as_deref(), Some("str1"));
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test]
    async fn dirty_stored_value_self_invalidates_once() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set("consent:test", &json!({"s": 1, "r": "stale", "d": 1}))
            .await
            .expect("seed");
        let remote = Arc::new(RecordingRemote::default());
        let instance = ConsentInstance::with_remote(
            "test",
            storage.clone() as SharedStorage,
            Some(remote.clone() as Arc<dyn ConsentRemote>),
        );

        let record = instance.get().await;
        assert_eq!(record.state, ConsentState::Accepted);
        assert_eq!(record.consent_string.as_deref(), Some("stale"));
        assert!(record.is_dirty);

        assert!(storage.get("consent:test").await.expect("get").is_none());
        let requests = remote.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].consent_state_value, "unknown");
        assert!(requests[0].consent_state.is_none());
    }

    #[tokio::test]
    async fn system_update_preserves_dirty_user_update_clears_it() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set("consent:test", &json!({"s": 1, "d": 1}))
            .await
            .expect("seed");
        let remote = Arc::new(RecordingRemote::default());
        let instance = ConsentInstance::with_remote(
            "test",
            storage.clone() as SharedStorage,
            Some(remote.clone() as Arc<dyn ConsentRemote>),
        );
        // the dirty read self-invalidates and announces unknown
        instance.get().await;
        assert_eq!(remote.requests().len(), 1);

        instance
            .update(UpdateRequest {
                state: ConsentState::Accepted,
                consent_string: Some("from-server".to_string()),
                is_system_update: true,
                ..UpdateRequest::default()
            })
            .await
            .expect("system update");
        assert_eq!(
            storage.get("consent:test").await.expect("get"),
            Some(json!({"s": 1, "r": "from-server", "d": 1}))
        );
        // the dirty write is stored but never announced
        assert_eq!(remote.requests().len(), 1);

        instance
            .update(accepted("from-user"))
            .await
            .expect("user update");
        assert_eq!(
            storage.get("consent:test").await.expect("get"),
            Some(json!({"s": 1, "r": "from-user"}))
        );
        let requests = remote.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].consent_state_value, "accepted");
        assert_eq!(requests[1].consent_state, Some(true));
    }

    #[tokio::test]
    async fn set_dirty_bit_rewrites_stored_value_only() {
        let storage = Arc::new(InstrumentedStorage::new());
        let instance =
            ConsentInstance::with_remote("test", storage.clone() as SharedStorage, None);
        instance.get().await;
        instance.update(accepted("str1")).await.expect("update");

        instance.set_dirty_bit(true).await;
        assert_eq!(
            storage.get("consent:test").await.expect("get"),
            Some(json!({"s": 1, "r": "str1", "d": 1}))
        );
        // the in-memory record stays clean for this page view
        assert!(!instance.get().await.is_dirty);

        // already marked: no further write
        let before = storage.write_count();
        instance.set_dirty_bit(true).await;
        assert_eq!(storage.write_count(), before);
    }

    #[tokio::test]
    async fn set_dirty_bit_without_stored_decision_is_a_no_op() {
        let storage = Arc::new(InstrumentedStorage::new());
        let instance =
            ConsentInstance::with_remote("test", storage.clone() as SharedStorage, None);
        instance.get().await;

        instance.set_dirty_bit(true).await;
        assert_eq!(storage.write_count(), 0);

        // the override still applies to the next decided write
        instance.update(accepted("str1")).await.expect("update");
        assert_eq!(
            storage.get("consent:test").await.expect("get"),
            Some(json!({"s": 1, "r": "str1", "d": 1}))
        );
    }

    #[tokio::test]
    async fn storage_read_errors_degrade_to_unknown() {
        let instance = ConsentInstance::with_remote(
            "test",
            Arc::new(FailingStorage) as SharedStorage,
            None,
        );
        let record = instance.get().await;
        assert_eq!(record.state, ConsentState::Unknown);
        assert!(!record.is_dirty);
    }

    #[tokio::test]
    async fn remote_not_notified_for_transient_updates() {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(RecordingRemote::default());
        let instance = ConsentInstance::with_remote(
            "test",
            storage.clone() as SharedStorage,
            Some(remote.clone() as Arc<dyn ConsentRemote>),
        );
        instance.get().await;

        instance
            .update(UpdateRequest {
                state: ConsentState::NotRequired,
                ..UpdateRequest::default()
            })
            .await
            .expect("update");

        assert!(storage.get("consent:test").await.expect("get").is_none());
        assert!(remote.requests().is_empty());
    }
}
