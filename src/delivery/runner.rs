//! Delivery task runner.
//!
//! Each run walks the named steps in order. Settled steps (succeeded,
//! skipped or permanently failed) are never executed again for the same
//! task. A step that fails with attempts left halts the run and reschedules
//! the task with exponential backoff; one that fails on its last attempt is
//! marked permanently failed and the run moves on. `update-status` always
//! runs last.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::notify::Notifier;
use super::task::{DeliveryStep, DeliveryTask, StepOutcome, StepState};
use super::webhook::Webhook;
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::lead::model::{ChannelStatus, DeliveryFlags, LeadRecord};
use crate::store::{DeliveryQueue, LeadStore};

/// In-process set of leads with a delivery run in flight.
#[derive(Debug, Clone, Default)]
pub struct LeadLocks {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl LeadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `lead_id`, or `None` if another run holds it.
    pub fn try_acquire(&self, lead_id: Uuid) -> Option<LeadLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(lead_id).then(|| LeadLockGuard {
            locks: self.clone(),
            lead_id,
        })
    }

    pub fn is_held(&self, lead_id: Uuid) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&lead_id)
    }
}

/// Releases the lead lock on drop.
#[derive(Debug)]
pub struct LeadLockGuard {
    locks: LeadLocks,
    lead_id: Uuid,
}

impl Drop for LeadLockGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.lead_id);
    }
}

/// How a single run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    /// Every step settled; the task is complete.
    Completed { flags: DeliveryFlags },
    /// A step failed with attempts left; the task runs again at `next_run_at`.
    Rescheduled {
        step: DeliveryStep,
        attempt: u32,
        next_run_at: DateTime<Utc>,
    },
    /// Another run for the same lead is in flight; put back untouched.
    Busy,
}

pub struct DeliveryRunner {
    leads: Arc<dyn LeadStore>,
    queue: Arc<dyn DeliveryQueue>,
    webhook: Option<Arc<dyn Webhook>>,
    notifier: Option<Arc<dyn Notifier>>,
    config: DeliveryConfig,
    locks: LeadLocks,
}

impl DeliveryRunner {
    pub fn new(
        leads: Arc<dyn LeadStore>,
        queue: Arc<dyn DeliveryQueue>,
        webhook: Option<Arc<dyn Webhook>>,
        notifier: Option<Arc<dyn Notifier>>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            leads,
            queue,
            webhook,
            notifier,
            config,
            locks: LeadLocks::new(),
        }
    }

    pub fn queue(&self) -> &Arc<dyn DeliveryQueue> {
        &self.queue
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn locks(&self) -> &LeadLocks {
        &self.locks
    }

    /// Steps for this runner, in order. The webhook step only exists when a
    /// webhook is configured.
    pub fn plan(&self) -> Vec<DeliveryStep> {
        let mut steps = Vec::with_capacity(3);
        if self.webhook.is_some() {
            steps.push(DeliveryStep::DeliverWebhook);
        }
        steps.push(DeliveryStep::SendNotification);
        steps.push(DeliveryStep::UpdateStatus);
        steps
    }

    /// Execute one run of `task`.
    ///
    /// `Err` means the run could not start (lead missing, store down) or its
    /// progress could not be saved; step failures are handled here and never
    /// surface as `Err`.
    pub async fn run(&self, task: &DeliveryTask) -> Result<RunReport, DeliveryError> {
        let Some(_guard) = self.locks.try_acquire(task.lead_id) else {
            debug!(lead_id = %task.lead_id, "Delivery already running for lead");
            return Ok(RunReport::Busy);
        };

        let lead = self
            .leads
            .get(task.lead_id)
            .await?
            .ok_or(DeliveryError::LeadMissing(task.lead_id))?;

        let mut outcomes: HashMap<DeliveryStep, StepOutcome> = self
            .queue
            .step_outcomes(task.id)
            .await?
            .into_iter()
            .map(|o| (o.step, o))
            .collect();

        if task.start_failures > 0 {
            self.queue.clear_start_failures(task.id).await?;
        }

        for step in self.plan() {
            if outcomes.get(&step).is_some_and(StepOutcome::is_settled) {
                debug!(task_id = %task.id, step = %step, "Step already settled, skipping");
                continue;
            }
            let attempt = outcomes.get(&step).map_or(0, |o| o.attempts) + 1;

            let outcome = match self.execute_bounded(step, &lead, &outcomes).await {
                Ok(state) => {
                    debug!(task_id = %task.id, step = %step, attempt, ?state, "Delivery step done");
                    StepOutcome::new(step, state, attempt)
                }
                Err(e) if attempt >= self.config.max_attempts => {
                    error!(
                        task_id = %task.id,
                        lead_id = %lead.id,
                        step = %step,
                        attempt,
                        error = %e,
                        "Delivery step permanently failed"
                    );
                    StepOutcome::new(step, StepState::PermanentlyFailed, attempt)
                        .with_detail(e.to_string())
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        lead_id = %lead.id,
                        step = %step,
                        attempt,
                        error = %e,
                        "Delivery step failed, will retry"
                    );
                    let failed = StepOutcome::new(step, StepState::Failed, attempt)
                        .with_detail(e.to_string());
                    self.queue.record_outcome(task.id, &failed).await?;

                    let delay = chrono::Duration::from_std(self.config.backoff(attempt))
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    let next_run_at = Utc::now() + delay;
                    self.queue
                        .reschedule_task(task.id, next_run_at, Some(&e.to_string()))
                        .await?;
                    return Ok(RunReport::Rescheduled {
                        step,
                        attempt,
                        next_run_at,
                    });
                }
            };

            self.queue.record_outcome(task.id, &outcome).await?;
            outcomes.insert(step, outcome);
        }

        self.queue.complete_task(task.id).await?;
        let flags = flags_from(&outcomes);
        info!(
            task_id = %task.id,
            lead_id = %lead.id,
            webhook = %flags.webhook,
            notification = %flags.notification,
            "Delivery complete"
        );
        Ok(RunReport::Completed { flags })
    }

    /// `execute` cut off at `step_timeout`, so a hung channel fails the
    /// step instead of stalling the queue.
    async fn execute_bounded(
        &self,
        step: DeliveryStep,
        lead: &LeadRecord,
        outcomes: &HashMap<DeliveryStep, StepOutcome>,
    ) -> Result<StepState, DeliveryError> {
        let after = self.config.step_timeout;
        tokio::time::timeout(after, self.execute(step, lead, outcomes))
            .await
            .unwrap_or_else(|_| {
                Err(DeliveryError::StepTimeout {
                    step: step.as_str(),
                    after,
                })
            })
    }

    async fn execute(
        &self,
        step: DeliveryStep,
        lead: &LeadRecord,
        outcomes: &HashMap<DeliveryStep, StepOutcome>,
    ) -> Result<StepState, DeliveryError> {
        match step {
            DeliveryStep::DeliverWebhook => match &self.webhook {
                Some(webhook) => webhook.deliver(lead).await.map(|()| StepState::Succeeded),
                None => Ok(StepState::Skipped),
            },
            DeliveryStep::SendNotification => match &self.notifier {
                Some(notifier) => notifier.notify(lead).await.map(|()| StepState::Succeeded),
                None => Ok(StepState::Skipped),
            },
            DeliveryStep::UpdateStatus => {
                let flags = flags_from(outcomes);
                self.leads
                    .update_delivery(lead.id, &flags)
                    .await
                    .map_err(|e| DeliveryError::StatusUpdate(e.to_string()))?;
                Ok(StepState::Succeeded)
            }
        }
    }
}

fn channel_status(outcome: Option<&StepOutcome>) -> ChannelStatus {
    match outcome.map(|o| o.state) {
        Some(StepState::Succeeded) => ChannelStatus::Delivered,
        Some(StepState::PermanentlyFailed) => ChannelStatus::Failed,
        Some(StepState::Failed) => ChannelStatus::Pending,
        Some(StepState::Skipped) | None => ChannelStatus::Skipped,
    }
}

/// Channel flags implied by the settled outcomes.
fn flags_from(outcomes: &HashMap<DeliveryStep, StepOutcome>) -> DeliveryFlags {
    DeliveryFlags {
        webhook: channel_status(outcomes.get(&DeliveryStep::DeliverWebhook)),
        notification: channel_status(outcomes.get(&DeliveryStep::SendNotification)),
        updated_at: Some(Utc::now()),
    }
}
