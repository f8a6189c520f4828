//! Webhook delivery of captured leads.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::lead::model::{LeadProfile, LeadRecord};

/// Body POSTed to the webhook: the lead id followed by the profile fields.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload<'a> {
    pub lead_id: Uuid,
    #[serde(flatten)]
    pub profile: &'a LeadProfile,
}

impl<'a> From<&'a LeadRecord> for WebhookPayload<'a> {
    fn from(lead: &'a LeadRecord) -> Self {
        Self {
            lead_id: lead.id,
            profile: &lead.profile,
        }
    }
}

/// Per-request bound on the webhook call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A destination that accepts lead records.
#[async_trait]
pub trait Webhook: Send + Sync {
    async fn deliver(&self, lead: &LeadRecord) -> Result<(), DeliveryError>;
}

/// Webhook reached with a JSON POST. Any non-2xx response is a failure.
pub struct HttpWebhook {
    url: String,
    client: reqwest::Client,
}

impl HttpWebhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Webhook for HttpWebhook {
    async fn deliver(&self, lead: &LeadRecord) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&WebhookPayload::from(lead))
            .send()
            .await
            .map_err(|e| DeliveryError::WebhookTransport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::WebhookStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        tracing::debug!(lead_id = %lead.id, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}
