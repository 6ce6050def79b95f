//! Policy resolution layer: named policies that wait on the consent
//! state before letting downstream features proceed.

pub mod instance;
pub mod manager;

use serde::{Deserialize, Serialize};

use crate::consent::ConsentState;

/// Resolution state a policy reaches once consent is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Unknown,
    Sufficient,
    Insufficient,
    UnknownNotRequired,
}

/// Policy ids recognized by the resolution surface. Anything else is a
/// configuration mistake and resolves to a safe default.
pub const PREDEFINED_POLICIES: [&str; 4] =
    ["default", "_till_responded", "_till_accepted", "_auto_reject"];

/// Configuration supplied when registering a policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Must name the one registered consent instance.
    pub wait_for: String,
    #[serde(default)]
    pub timeout: Option<TimeoutSetting>,
    /// Statuses that count as "proceed". Defaults to sufficient and
    /// unknown-not-required.
    #[serde(default)]
    pub unblock_on: Option<Vec<PolicyStatus>>,
}

impl PolicyConfig {
    pub fn wait_for(instance_id: &str) -> Self {
        Self {
            wait_for: instance_id.to_string(),
            timeout: None,
            unblock_on: None,
        }
    }
}

/// Timeout is configured either as bare seconds or with an explicit
/// fallback action.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimeoutSetting {
    Seconds(u64),
    Config(TimeoutConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    pub seconds: u64,
    #[serde(default)]
    pub fallback_action: Option<String>,
}

impl TimeoutSetting {
    /// Seconds to wait and the state a firing fallback evaluates with.
    pub(crate) fn resolve(&self) -> (u64, ConsentState) {
        match self {
            TimeoutSetting::Seconds(seconds) => (*seconds, ConsentState::Unknown),
            TimeoutSetting::Config(config) => {
                let fallback = match config.fallback_action.as_deref() {
                    Some("reject") => ConsentState::Rejected,
                    Some("dismiss") | None => ConsentState::Unknown,
                    Some(other) => {
                        tracing::error!("unsupported fallbackAction {other}, treating as dismiss");
                        ConsentState::Unknown
                    }
                };
                (config.seconds, fallback)
            }
        }
    }
}

pub(crate) fn default_unblock_on() -> Vec<PolicyStatus> {
    vec![PolicyStatus::Sufficient, PolicyStatus::UnknownNotRequired]
}

/// Built-in configuration for a predefined policy id.
pub fn predefined_policy_config(policy_id: &str, instance_id: &str) -> Option<PolicyConfig> {
    match policy_id {
        "default" | "_till_accepted" => Some(PolicyConfig::wait_for(instance_id)),
        "_till_responded" => Some(PolicyConfig {
            unblock_on: Some(vec![
                PolicyStatus::Sufficient,
                PolicyStatus::Insufficient,
                PolicyStatus::UnknownNotRequired,
            ]),
            ..PolicyConfig::wait_for(instance_id)
        }),
        "_auto_reject" => Some(PolicyConfig {
            timeout: Some(TimeoutSetting::Config(TimeoutConfig {
                seconds: 0,
                fallback_action: Some("reject".to_string()),
            })),
            unblock_on: Some(vec![
                PolicyStatus::Sufficient,
                PolicyStatus::Insufficient,
                PolicyStatus::UnknownNotRequired,
                PolicyStatus::Unknown,
            ]),
            ..PolicyConfig::wait_for(instance_id)
        }),
        _ => None,
    }
}
