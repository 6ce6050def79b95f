//! Registry and fan-out for the document's consent instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::consent::instance::{ConsentInstance, ConsentInstanceConfig, UpdateRequest};
use crate::consent::record::{ConsentRecord, PurposeValue};
use crate::consent::ConsentState;
use crate::error::ConsentResult;
use crate::storage::SharedStorage;
use crate::utils::gate::Gate;

/// Callback receiving every consent state change notification.
pub type ConsentChangeHandler = Box<dyn Fn(ConsentRecord) + Send + Sync>;

struct ManagerState {
    instance: Option<ConsentInstance>,
    handler: Option<Arc<ConsentChangeHandler>>,
    /// Purposes collected so far, attached to every state update.
    purpose_consents: HashMap<String, PurposeValue>,
    shared_data_default: Option<Value>,
    shared_data: Option<Value>,
}

/// Holds the document's single consent instance and fans out its state
/// changes. The model supports multiple ids, but registration is
/// constrained to one instance per document.
pub struct ConsentStateManager {
    storage: SharedStorage,
    state: Mutex<ManagerState>,
    all_purposes: Gate,
}

impl ConsentStateManager {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            state: Mutex::new(ManagerState {
                instance: None,
                handler: None,
                purpose_consents: HashMap::new(),
                shared_data_default: None,
                shared_data: None,
            }),
            all_purposes: Gate::new(),
        }
    }

    /// Register the consent instance. A second registration is logged and
    /// ignored; the first one wins.
    pub fn register_consent_instance(
        &self,
        id: &str,
        config: &ConsentInstanceConfig,
    ) -> ConsentResult<()> {
        let mut state = self.state_guard();
        if let Some(existing) = &state.instance {
            tracing::error!(
                "consent instance {} already registered, ignoring {id}",
                existing.id()
            );
            return Ok(());
        }
        let instance = ConsentInstance::new(id, config, self.storage.clone())?;
        state.instance = Some(instance);
        state.shared_data_default = config.shared_data.clone();
        Ok(())
    }

    pub fn instance_id(&self) -> Option<String> {
        self.state_guard()
            .instance
            .as_ref()
            .map(|instance| instance.id().to_string())
    }

    /// Register the single change handler. The handler is always invoked
    /// at least once, with the best currently-known record, even if no
    /// update ever occurs.
    pub fn on_consent_state_change(&self, handler: ConsentChangeHandler) {
        let scheduled = {
            let mut state = self.state_guard();
            if state.handler.is_some() {
                tracing::error!("consent state change handler already registered, ignoring");
                return;
            }
            let Some(instance) = state.instance.clone() else {
                tracing::error!("no consent instance registered, change handler dropped");
                return;
            };
            let handler = Arc::new(handler);
            state.handler = Some(Arc::clone(&handler));
            (instance, handler)
        };
        let (instance, handler) = scheduled;
        tokio::spawn(async move {
            let record = instance.get().await;
            handler(record);
        });
    }

    /// Apply a state update. The change notification is built from the
    /// arguments given here (plus the collected purposes), never re-read
    /// from storage. Returns the persist task, if one was started.
    pub fn update_consent_instance_state(&self, request: UpdateRequest) -> Option<JoinHandle<()>> {
        let (instance, handler, purposes) = {
            let state = self.state_guard();
            let Some(instance) = state.instance.clone() else {
                tracing::error!("no consent instance registered, dropping state update");
                return None;
            };
            let purposes = (!state.purpose_consents.is_empty())
                .then(|| state.purpose_consents.clone());
            (instance, state.handler.clone(), purposes)
        };
        let notification = ConsentRecord {
            state: request.state,
            consent_string: request.consent_string.clone(),
            metadata: request.metadata.clone(),
            purpose_consents: purposes.clone(),
            is_dirty: false,
            tcf_policy_version: request.tcf_policy_version,
        };
        let handle = instance.update(UpdateRequest {
            purpose_consents: purposes,
            ..request
        });
        if let Some(handler) = handler {
            handler(notification);
        }
        // every update cycle completes the first pass over purposes
        self.all_purposes.open();
        Some(handle)
    }

    /// Merge purpose entries into the map attached to future updates.
    /// With `defaults_only`, entries already present are left alone.
    /// Non-boolean values are dropped and logged, the rest still merge.
    pub fn update_consent_instance_purposes(
        &self,
        purposes: &Map<String, Value>,
        defaults_only: bool,
    ) {
        let mut state = self.state_guard();
        for (id, value) in purposes {
            if defaults_only && state.purpose_consents.contains_key(id) {
                continue;
            }
            match value.as_bool() {
                Some(true) => {
                    state
                        .purpose_consents
                        .insert(id.clone(), PurposeValue::Accepted);
                }
                Some(false) => {
                    state
                        .purpose_consents
                        .insert(id.clone(), PurposeValue::Rejected);
                }
                None => {
                    tracing::warn!("dropping non-boolean purpose consent for {id}");
                }
            }
        }
    }

    /// Current record with stale values masked: a dirty record reads as
    /// `Unknown` until it has been revalidated.
    pub async fn get_consent_instance_info(&self) -> ConsentRecord {
        let record = self.get_last_consent_instance_info().await;
        if record.is_dirty {
            ConsentRecord::new(ConsentState::Unknown)
        } else {
            record
        }
    }

    /// Current record as stored, dirty flag included.
    pub async fn get_last_consent_instance_info(&self) -> ConsentRecord {
        let instance = self.state_guard().instance.clone();
        match instance {
            Some(instance) => instance.get().await,
            None => {
                tracing::error!("no consent instance registered");
                ConsentRecord::new(ConsentState::Unknown)
            }
        }
    }

    /// Mark the stored value stale so the next page view revalidates it.
    pub async fn set_dirty_bit(&self) {
        let instance = self.state_guard().instance.clone();
        match instance {
            Some(instance) => instance.set_dirty_bit(true).await,
            None => tracing::error!("no consent instance registered, dirty bit dropped"),
        }
    }

    /// Resolves once the first pass of purpose consents has been
    /// collected (after the first state update).
    pub async fn when_has_all_purpose_consents(&self) {
        self.all_purposes.opened().await;
    }

    pub fn set_consent_instance_shared_data(&self, data: Value) {
        self.state_guard().shared_data = Some(data);
    }

    /// Shared data for downstream consumers: driver-supplied values
    /// merged over the config defaults.
    pub fn get_consent_instance_shared_data(&self) -> Option<Value> {
        let state = self.state_guard();
        merge_shared_data(state.shared_data_default.as_ref(), state.shared_data.as_ref())
    }

    fn state_guard(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn merge_shared_data(defaults: Option<&Value>, data: Option<&Value>) -> Option<Value> {
    match (defaults, data) {
        (Some(Value::Object(defaults)), Some(Value::Object(data))) => {
            let mut merged = defaults.clone();
            for (key, value) in data {
                merged.insert(key.clone(), value.clone());
            }
            Some(Value::Object(merged))
        }
        (_, Some(data)) => Some(data.clone()),
        (Some(defaults), None) => Some(defaults.clone()),
        (None, None) => None,
    }
}
