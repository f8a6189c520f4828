//! Storage traits for leads and the durable delivery queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::delivery::task::{DeliveryTask, StepOutcome};
use crate::error::DatabaseError;
use crate::lead::model::{DeliveryFlags, LeadRecord};

/// Durable record store for captured leads.
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Persist a new lead and return its durable id.
    async fn create(&self, lead: &LeadRecord) -> Result<Uuid, DatabaseError>;

    /// Get a lead by id.
    async fn get(&self, id: Uuid) -> Result<Option<LeadRecord>, DatabaseError>;

    /// Record delivery outcomes. This is the only mutation a lead sees.
    async fn update_delivery(&self, id: Uuid, flags: &DeliveryFlags) -> Result<(), DatabaseError>;
}

/// Durable queue of delivery tasks with per-step memoized outcomes.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Queue delivery for a lead. Idempotent: a lead has at most one task,
    /// and enqueueing again returns the existing one.
    async fn enqueue(&self, lead_id: Uuid) -> Result<DeliveryTask, DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<DeliveryTask>, DatabaseError>;

    async fn task_for_lead(&self, lead_id: Uuid) -> Result<Option<DeliveryTask>, DatabaseError>;

    /// Claim up to `limit` queued tasks due at `now`, marking them running
    /// and bumping their run count.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, DatabaseError>;

    async fn complete_task(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Put a task back in the queue to run at `next_run_at`.
    async fn reschedule_task(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Put a task back after a run that could not start, bumping its
    /// start failure count. Returns the new count.
    async fn record_start_failure(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<u32, DatabaseError>;

    async fn clear_start_failures(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Return tasks left `running` by a previous process to the queue.
    /// Returns the number re-queued.
    async fn requeue_stale(&self) -> Result<usize, DatabaseError>;

    async fn step_outcomes(&self, task_id: Uuid) -> Result<Vec<StepOutcome>, DatabaseError>;

    /// Insert or replace the outcome for `(task_id, outcome.step)`.
    async fn record_outcome(&self, task_id: Uuid, outcome: &StepOutcome)
    -> Result<(), DatabaseError>;
}
