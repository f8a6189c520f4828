//! Lead submission: durable create plus delivery enqueue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use super::model::{Attribution, LeadRecord};
use crate::error::Result;
use crate::funnel::AnswerStore;
use crate::services::quotes::CarrierQuote;
use crate::store::{DeliveryQueue, LeadStore};

/// Everything a finished session hands over for capture.
#[derive(Debug, Clone)]
pub struct LeadDraft {
    pub session_id: Uuid,
    pub answers: AnswerStore,
    pub attribution: Attribution,
    pub quotes: Vec<CarrierQuote>,
}

/// Turns a finished session into a durable lead.
///
/// Implementations own capture-loss reporting: when `submit` fails the
/// draft has already been logged at `error` so it can be recovered.
#[async_trait]
pub trait LeadSubmitter: Send + Sync {
    async fn submit(&self, draft: &LeadDraft) -> Result<Uuid>;
}

/// Submitter backed by the lead store and the delivery queue.
pub struct LeadSubmission {
    leads: Arc<dyn LeadStore>,
    queue: Arc<dyn DeliveryQueue>,
}

impl LeadSubmission {
    pub fn new(leads: Arc<dyn LeadStore>, queue: Arc<dyn DeliveryQueue>) -> Self {
        Self { leads, queue }
    }

    /// Store an already-built lead and queue its delivery.
    ///
    /// A failure to enqueue is logged but the lead id is still returned: the
    /// record is durable and can be re-queued.
    pub async fn capture(&self, lead: &LeadRecord) -> Result<Uuid> {
        let id = match self.leads.create(lead).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    lead_id = %lead.id,
                    error = %e,
                    record = %serde_json::to_string(lead).unwrap_or_default(),
                    "Capture loss: lead could not be stored"
                );
                return Err(e.into());
            }
        };

        match self.queue.enqueue(id).await {
            Ok(task) => info!(lead_id = %id, task_id = %task.id, "Lead captured, delivery queued"),
            Err(e) => error!(lead_id = %id, error = %e, "Lead stored but delivery not queued"),
        }
        Ok(id)
    }
}

#[async_trait]
impl LeadSubmitter for LeadSubmission {
    async fn submit(&self, draft: &LeadDraft) -> Result<Uuid> {
        let lead = match LeadRecord::from_answers(
            &draft.answers,
            draft.attribution.clone(),
            draft.quotes.clone(),
        ) {
            Ok(lead) => lead.with_session(draft.session_id),
            Err(e) => {
                error!(
                    session_id = %draft.session_id,
                    error = %e,
                    answers = %serde_json::to_string(&draft.answers).unwrap_or_default(),
                    "Capture loss: answers could not be projected into a lead"
                );
                return Err(e.into());
            }
        };
        self.capture(&lead).await
    }
}
