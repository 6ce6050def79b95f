//! Registry of policy instances and the bridge from consent state
//! changes to every registered policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::consent::record::{ConsentMetadata, ConsentRecord, PurposeValue};
use crate::consent::state_manager::ConsentStateManager;
use crate::consent::ConsentState;
use crate::policy::instance::PolicyInstance;
use crate::policy::{predefined_policy_config, PolicyConfig, PolicyStatus, PREDEFINED_POLICIES};
use crate::utils::gate::Gate;

/// External "consent changed" callback, a single slot used by the
/// third-party signal relay.
pub type PolicyChangeCallback = Box<dyn Fn() + Send + Sync>;

struct PolicyState {
    instances: HashMap<String, Arc<PolicyInstance>>,
    /// Gates for resolution calls that arrived before registration.
    pending: HashMap<String, Arc<Gate>>,
    consent_state: Option<ConsentState>,
    consent_string: Option<String>,
    metadata: Option<ConsentMetadata>,
    purpose_consents: Option<HashMap<String, PurposeValue>>,
    tcf_policy_version: Option<u32>,
    on_change: Option<Arc<PolicyChangeCallback>>,
}

struct PolicyManagerInner {
    state_manager: Arc<ConsentStateManager>,
    channel: broadcast::Sender<ConsentState>,
    /// Opens on the first state delivery, whatever the state.
    value_initiated: Gate,
    /// Opens when the surrounding prompt flow allows timers to start.
    prompt_initiated: Gate,
    state: Mutex<PolicyState>,
}

/// Cheap-to-clone handle; clones share the same registry and caches.
#[derive(Clone)]
pub struct PolicyManager {
    inner: Arc<PolicyManagerInner>,
}

impl PolicyManager {
    pub fn new(state_manager: Arc<ConsentStateManager>) -> Self {
        let (channel, _) = broadcast::channel(16);
        let inner = Arc::new(PolicyManagerInner {
            state_manager,
            channel,
            value_initiated: Gate::new(),
            prompt_initiated: Gate::new(),
            state: Mutex::new(PolicyState {
                instances: HashMap::new(),
                pending: HashMap::new(),
                consent_state: None,
                consent_string: None,
                metadata: None,
                purpose_consents: None,
                tcf_policy_version: None,
                on_change: None,
            }),
        });
        let weak: Weak<PolicyManagerInner> = Arc::downgrade(&inner);
        inner
            .state_manager
            .on_consent_state_change(Box::new(move |record| {
                if let Some(inner) = weak.upgrade() {
                    inner.consent_state_change_handler(record);
                }
            }));
        Self { inner }
    }

    /// Register a policy. `wait_for` must name the registered consent
    /// instance; anything else is logged and the policy never resolves.
    pub fn register_consent_policy_instance(&self, policy_id: &str, config: &PolicyConfig) {
        let instance_id = self.inner.state_manager.instance_id();
        if instance_id.as_deref() != Some(config.wait_for.as_str()) {
            tracing::error!("invalid waitFor value for policy {policy_id}, it will never resolve");
            return;
        }
        let instance = Arc::new(PolicyInstance::new(config));
        {
            let mut state = self.inner.state_guard();
            if state.instances.contains_key(policy_id) {
                tracing::error!("policy {policy_id} already registered, ignoring");
                return;
            }
            state
                .instances
                .insert(policy_id.to_string(), Arc::clone(&instance));
            if let Some(gate) = state.pending.get(policy_id) {
                gate.open();
            }
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.value_initiated.opened().await;
            let mut changes = inner.channel.subscribe();
            // evaluate against the value that arrived before registration
            let current = inner.state_guard().consent_state;
            if current.is_some() {
                instance.evaluate(current, false);
            }
            let timer_inner = Arc::clone(&inner);
            let timer_instance = Arc::clone(&instance);
            tokio::spawn(async move {
                timer_inner.prompt_initiated.opened().await;
                timer_instance.start_timeout();
            });
            loop {
                match changes.recv().await {
                    Ok(state) => instance.evaluate(Some(state), false),
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // catch up from the aggregate snapshot
                        let current = inner.state_guard().consent_state;
                        instance.evaluate(current, false);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Register every predefined policy that is not already present.
    pub fn register_predefined_policies(&self) {
        let Some(instance_id) = self.inner.state_manager.instance_id() else {
            tracing::error!("no consent instance registered, predefined policies skipped");
            return;
        };
        for policy_id in PREDEFINED_POLICIES {
            if self.inner.state_guard().instances.contains_key(policy_id) {
                continue;
            }
            if let Some(config) = predefined_policy_config(policy_id, &instance_id) {
                self.register_consent_policy_instance(policy_id, &config);
            }
        }
    }

    /// One-shot signal that the prompt flow has settled and policy
    /// timers may start counting.
    pub fn enable_timeout(&self) {
        self.inner.prompt_initiated.open();
    }

    /// Register the single external change callback. A second
    /// registration is logged and ignored.
    pub fn set_on_policy_change(&self, callback: PolicyChangeCallback) {
        let mut state = self.inner.state_guard();
        if state.on_change.is_some() {
            tracing::error!("policy change callback already registered, ignoring");
            return;
        }
        state.on_change = Some(Arc::new(callback));
    }

    /// Resolution status of a policy, once it has one. Unrecognized ids
    /// are logged and resolve immediately to `Unknown`.
    pub async fn when_policy_resolved(&self, policy_id: &str) -> PolicyStatus {
        if !PREDEFINED_POLICIES.contains(&policy_id) {
            tracing::error!(
                "can not find policy {policy_id}, only predefined policies are supported"
            );
            return PolicyStatus::Unknown;
        }
        let instance = self.inner.registered_instance(policy_id).await;
        instance.when_resolved().await;
        instance.status()
    }

    /// Whether a policy allows its consumers to proceed, once resolved.
    /// Unrecognized ids are logged and resolve immediately to `false`.
    pub async fn when_policy_unblock(&self, policy_id: &str) -> bool {
        if !PREDEFINED_POLICIES.contains(&policy_id) {
            tracing::error!(
                "can not find policy {policy_id}, only predefined policies are supported"
            );
            return false;
        }
        let instance = self.inner.registered_instance(policy_id).await;
        instance.when_resolved().await;
        instance.should_unblock()
    }

    /// True once every named purpose has been collected and accepted.
    pub async fn when_purposes_unblock(&self, purpose_ids: &[&str]) -> bool {
        self.inner.state_manager.when_has_all_purpose_consents().await;
        let state = self.inner.state_guard();
        let Some(purposes) = &state.purpose_consents else {
            return false;
        };
        purpose_ids
            .iter()
            .all(|id| purposes.get(*id).is_some_and(|value| value.is_accepted()))
    }

    /// Consent string for downstream consumers; never available before
    /// the policy has resolved.
    pub async fn get_consent_string_info(&self, policy_id: &str) -> Option<String> {
        self.when_policy_resolved(policy_id).await;
        self.inner.state_guard().consent_string.clone()
    }

    pub async fn get_consent_metadata_info(&self, policy_id: &str) -> Option<ConsentMetadata> {
        self.when_policy_resolved(policy_id).await;
        self.inner.state_guard().metadata.clone()
    }

    pub async fn get_merged_shared_data(&self, policy_id: &str) -> Option<Value> {
        self.when_policy_resolved(policy_id).await;
        self.inner.state_manager.get_consent_instance_shared_data()
    }
}

impl PolicyManagerInner {
    fn consent_state_change_handler(&self, record: ConsentRecord) {
        self.value_initiated.open();
        let (fire_state, on_change) = {
            let mut state = self.state_guard();
            let before = (
                state.consent_state,
                state.consent_string.clone(),
                state.metadata.clone(),
                state.purpose_consents.clone(),
                state.tcf_policy_version,
            );
            let (old_string, old_metadata, old_purposes, old_version) = (
                state.consent_string.clone(),
                state.metadata.clone(),
                state.purpose_consents.clone(),
                state.tcf_policy_version,
            );
            state.consent_string = record.consent_string;
            state.metadata = record.metadata;
            state.purpose_consents = record.purpose_consents;
            state.tcf_policy_version = record.tcf_policy_version;
            match record.state {
                // the consent value has not been resolved yet
                ConsentState::Unknown => return,
                ConsentState::NotRequired => {
                    let decided = matches!(
                        state.consent_state,
                        Some(ConsentState::Accepted | ConsentState::Rejected)
                    );
                    if !decided {
                        state.consent_state = Some(ConsentState::NotRequired);
                    }
                }
                ConsentState::Dismissed => {
                    if state.consent_state.is_none() {
                        state.consent_state = Some(ConsentState::Unknown);
                    }
                    // dismissal never replaces previously known data
                    state.consent_string = old_string;
                    state.metadata = old_metadata;
                    state.purpose_consents = old_purposes;
                    state.tcf_policy_version = old_version;
                }
                decided => state.consent_state = Some(decided),
            }
            let after = (
                state.consent_state,
                state.consent_string.clone(),
                state.metadata.clone(),
                state.purpose_consents.clone(),
                state.tcf_policy_version,
            );
            let genuine = before != after;
            (
                state.consent_state,
                genuine.then(|| state.on_change.clone()).flatten(),
            )
        };
        if let Some(state) = fire_state {
            let _ = self.channel.send(state);
        }
        if let Some(callback) = on_change {
            callback();
        }
    }

    async fn registered_instance(&self, policy_id: &str) -> Arc<PolicyInstance> {
        loop {
            let gate = {
                let mut state = self.state_guard();
                if let Some(instance) = state.instances.get(policy_id) {
                    return Arc::clone(instance);
                }
                Arc::clone(
                    state
                        .pending
                        .entry(policy_id.to_string())
                        .or_insert_with(|| Arc::new(Gate::new())),
                )
            };
            gate.opened().await;
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
