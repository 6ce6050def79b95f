//! Remote notify endpoint boundary.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::consent::record::{legacy_state_value, ConsentMetadata, ConsentRecord};
use crate::error::{ConsentError, ConsentResult};

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Request body POSTed to the configured update endpoint after a consent
/// change lands in storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHrefRequest {
    pub consent_instance_id: String,
    pub client_id: String,
    /// Legacy boolean form of the state, omitted for transients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_state: Option<bool>,
    pub consent_state_value: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_metadata: Option<ConsentMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose_consents: Option<HashMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcf_policy_version: Option<u32>,
}

impl UpdateHrefRequest {
    pub fn from_record(instance_id: &str, client_id: &str, record: &ConsentRecord) -> Self {
        let purpose_consents = record.purpose_consents.as_ref().and_then(|purposes| {
            if purposes.is_empty() {
                return None;
            }
            Some(
                purposes
                    .iter()
                    .map(|(id, value)| (id.clone(), value.is_accepted()))
                    .collect(),
            )
        });
        Self {
            consent_instance_id: instance_id.to_string(),
            client_id: client_id.to_string(),
            consent_state: legacy_state_value(record.state),
            consent_state_value: record.state.signal_name(),
            consent_string: record.consent_string.clone(),
            consent_metadata: record.metadata.clone(),
            purpose_consents,
            tcf_policy_version: record.tcf_policy_version,
        }
    }
}

/// Endpoint notified whenever a decided consent value changes.
#[async_trait]
pub trait ConsentRemote: Send + Sync {
    async fn notify(&self, request: &UpdateHrefRequest) -> ConsentResult<()>;
}

/// HTTP implementation posting the request as JSON.
pub struct HttpConsentRemote {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpConsentRemote {
    pub fn new(endpoint: impl Into<String>) -> ConsentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ConsentError::Remote(format!("failed to build http client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl ConsentRemote for HttpConsentRemote {
    async fn notify(&self, request: &UpdateHrefRequest) -> ConsentResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                ConsentError::Remote(format!("update request to {} failed: {e}", self.endpoint))
            })?;
        if !response.status().is_success() {
            return Err(ConsentError::Remote(format!(
                "update request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }
        Ok(())
    }
}
