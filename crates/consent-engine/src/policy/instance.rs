//! A single policy's resolution state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::consent::ConsentState;
use crate::policy::{default_unblock_on, PolicyConfig, PolicyStatus};
use crate::utils::gate::Gate;

/// Status and readiness, shared with the fallback timer task.
struct PolicyCore {
    status: Mutex<PolicyStatus>,
    resolved: Gate,
}

impl PolicyCore {
    /// Fold a consent state into the policy status. `None` means the
    /// consent value is not known yet and is ignored. The first effective
    /// call resolves readiness; later calls still move `status`, except a
    /// fallback arriving after resolution, which is discarded outright.
    fn evaluate(&self, consent_state: Option<ConsentState>, is_fallback: bool) {
        let Some(consent_state) = consent_state else {
            return;
        };
        if is_fallback && self.resolved.is_open() {
            tracing::debug!("policy timeout fired after resolution, ignored");
            return;
        }
        let status = match consent_state {
            ConsentState::Accepted => PolicyStatus::Sufficient,
            ConsentState::Rejected => PolicyStatus::Insufficient,
            ConsentState::NotRequired => PolicyStatus::UnknownNotRequired,
            _ => PolicyStatus::Unknown,
        };
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
        self.resolved.open();
    }

    fn status(&self) -> PolicyStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct PolicyInstance {
    unblock_on: Vec<PolicyStatus>,
    timeout: Option<(u64, ConsentState)>,
    core: Arc<PolicyCore>,
    timeout_armed: AtomicBool,
}

impl PolicyInstance {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            unblock_on: config.unblock_on.clone().unwrap_or_else(default_unblock_on),
            timeout: config.timeout.as_ref().map(|setting| setting.resolve()),
            core: Arc::new(PolicyCore {
                status: Mutex::new(PolicyStatus::Unknown),
                resolved: Gate::new(),
            }),
            timeout_armed: AtomicBool::new(false),
        }
    }

    /// See [`PolicyCore::evaluate`].
    pub fn evaluate(&self, consent_state: Option<ConsentState>, is_fallback: bool) {
        self.core.evaluate(consent_state, is_fallback);
    }

    /// Arm the configured fallback timer. Armed at most once per
    /// instance; later calls (and instances without a timeout) return
    /// `None`.
    pub fn start_timeout(&self) -> Option<JoinHandle<()>> {
        let (seconds, fallback) = self.timeout?;
        if self.timeout_armed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let core = Arc::clone(&self.core);
        Some(tokio::spawn(async move {
            sleep(Duration::from_secs(seconds)).await;
            core.evaluate(Some(fallback), true);
        }))
    }

    pub fn status(&self) -> PolicyStatus {
        self.core.status()
    }

    pub fn should_unblock(&self) -> bool {
        self.unblock_on.contains(&self.status())
    }

    /// Resolves once the policy has reached its first resolution, by
    /// evaluation or by timeout.
    pub async fn when_resolved(&self) {
        self.core.resolved.opened().await;
    }
}
