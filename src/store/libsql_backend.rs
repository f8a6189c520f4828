//! libSQL backend for the lead store and delivery queue.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::delivery::task::{DeliveryStep, DeliveryTask, StepOutcome, StepState, TaskStatus};
use crate::error::DatabaseError;
use crate::lead::model::{ChannelStatus, DeliveryFlags, LeadRecord};
use crate::store::migrations;
use crate::store::traits::{DeliveryQueue, LeadStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<DeliveryTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width so stored values sort in time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

const TASK_COLUMNS: &str =
    "id, lead_id, status, run_count, next_run_at, last_error, created_at, updated_at, start_failures";

/// Map a row to a `DeliveryTask`. Column order matches `TASK_COLUMNS`.
fn row_to_task(row: &libsql::Row) -> Result<DeliveryTask, DatabaseError> {
    let id = text(row, 0)?;
    let lead_id = text(row, 1)?;
    let status = text(row, 2)?;
    let run_count = int(row, 3)?;
    let next_run_at = text(row, 4)?;
    let last_error: Option<String> = row.get(5).ok();
    let created_at = text(row, 6)?;
    let updated_at = text(row, 7)?;
    let start_failures = int(row, 8)?;

    Ok(DeliveryTask {
        id: parse_uuid(&id)?,
        lead_id: parse_uuid(&lead_id)?,
        status: status.parse().unwrap_or(TaskStatus::Queued),
        run_count: u32::try_from(run_count).unwrap_or(0),
        start_failures: u32::try_from(start_failures).unwrap_or(0),
        next_run_at: parse_datetime(&next_run_at),
        last_error,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_outcome(row: &libsql::Row) -> Result<Option<StepOutcome>, DatabaseError> {
    let step = text(row, 0)?;
    let state = text(row, 1)?;
    let attempts = int(row, 2)?;
    let detail: Option<String> = row.get(3).ok();
    let updated_at = text(row, 4)?;

    // Rows for steps this build no longer knows about are ignored.
    let (Ok(step), Ok(state)) = (step.parse::<DeliveryStep>(), state.parse::<StepState>()) else {
        return Ok(None);
    };
    Ok(Some(StepOutcome {
        step,
        state,
        attempts: u32::try_from(attempts).unwrap_or(0),
        detail,
        updated_at: parse_datetime(&updated_at),
    }))
}

// ── LeadStore ───────────────────────────────────────────────────────

#[async_trait]
impl LeadStore for LibSqlBackend {
    async fn create(&self, lead: &LeadRecord) -> Result<Uuid, DatabaseError> {
        let record = serde_json::to_string(lead)
            .map_err(|e| DatabaseError::Serialization(format!("lead record: {e}")))?;
        let now = ts(Utc::now());

        self.conn()
            .execute(
                "INSERT INTO leads (id, session_id, first_name, email, phone, zip, age,
                    coverage_amount, term_length, consent_given, status, webhook_status,
                    notification_status, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    lead.id.to_string(),
                    lead.session_id.map(|id| id.to_string()),
                    lead.profile.first_name.clone(),
                    lead.profile.email.clone(),
                    lead.profile.phone.clone(),
                    lead.profile.zip.clone(),
                    i64::from(lead.profile.age),
                    i64::try_from(lead.profile.coverage_amount).unwrap_or(i64::MAX),
                    i64::from(lead.profile.term_length),
                    lead.profile.consent_given as i64,
                    lead.status.as_str(),
                    lead.delivery.webhook.as_str(),
                    lead.delivery.notification.as_str(),
                    record,
                    ts(lead.created_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create lead: {e}")))?;

        debug!(lead_id = %lead.id, "Lead stored");
        Ok(lead.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<LeadRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT record, status, webhook_status, notification_status, delivery_updated_at
                 FROM leads WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get lead: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get lead: {e}")))?
        else {
            return Ok(None);
        };

        let record = text(&row, 0)?;
        let mut lead: LeadRecord = serde_json::from_str(&record)
            .map_err(|e| DatabaseError::Serialization(format!("lead record: {e}")))?;

        // Delivery columns are authoritative over the creation-time snapshot.
        let status: String = row.get(1).unwrap_or_default();
        let webhook: String = row.get(2).unwrap_or_default();
        let notification: String = row.get(3).unwrap_or_default();
        let delivery_updated_at: Option<String> = row.get(4).ok();

        lead.status = status.parse().unwrap_or(lead.status);
        lead.delivery = DeliveryFlags {
            webhook: webhook.parse().unwrap_or(ChannelStatus::Pending),
            notification: notification.parse().unwrap_or(ChannelStatus::Pending),
            updated_at: delivery_updated_at.as_deref().map(parse_datetime),
        };
        Ok(Some(lead))
    }

    async fn update_delivery(&self, id: Uuid, flags: &DeliveryFlags) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let affected = self
            .conn()
            .execute(
                "UPDATE leads SET status = ?1, webhook_status = ?2, notification_status = ?3,
                    delivery_updated_at = ?4, updated_at = ?4
                 WHERE id = ?5",
                params![
                    flags.status().as_str(),
                    flags.webhook.as_str(),
                    flags.notification.as_str(),
                    now,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update lead delivery: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "lead".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

// ── DeliveryQueue ───────────────────────────────────────────────────

#[async_trait]
impl DeliveryQueue for LibSqlBackend {
    async fn enqueue(&self, lead_id: Uuid) -> Result<DeliveryTask, DatabaseError> {
        let now = ts(Utc::now());
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO delivery_tasks
                    (id, lead_id, status, run_count, next_run_at, created_at, updated_at)
                 VALUES (?1, ?2, 'queued', 0, ?3, ?3, ?3)",
                params![Uuid::new_v4().to_string(), lead_id.to_string(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        if inserted == 0 {
            debug!(%lead_id, "Delivery task already queued for lead");
        }

        self.task_for_lead(lead_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "delivery_task".to_string(),
                id: lead_id.to_string(),
            })
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<DeliveryTask>, DatabaseError> {
        let tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM delivery_tasks WHERE id = ?1"),
                params![id.to_string()],
                "get_task",
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn task_for_lead(&self, lead_id: Uuid) -> Result<Option<DeliveryTask>, DatabaseError> {
        let tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM delivery_tasks WHERE lead_id = ?1"),
                params![lead_id.to_string()],
                "task_for_lead",
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryTask>, DatabaseError> {
        let due = self
            .query_tasks(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM delivery_tasks
                     WHERE status = 'queued' AND next_run_at <= ?1
                     ORDER BY next_run_at ASC LIMIT ?2"
                ),
                params![ts(now), i64::try_from(limit).unwrap_or(i64::MAX)],
                "claim_due",
            )
            .await?;

        let mut claimed = Vec::with_capacity(due.len());
        for mut task in due {
            let updated_at = Utc::now();
            let affected = self
                .conn()
                .execute(
                    "UPDATE delivery_tasks
                     SET status = 'running', run_count = run_count + 1, updated_at = ?1
                     WHERE id = ?2 AND status = 'queued'",
                    params![ts(updated_at), task.id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim task: {e}")))?;

            if affected == 1 {
                task.status = TaskStatus::Running;
                task.run_count += 1;
                task.updated_at = updated_at;
                claimed.push(task);
            }
        }
        Ok(claimed)
    }

    async fn complete_task(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks SET status = 'completed', updated_at = ?1 WHERE id = ?2",
                params![ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;
        Ok(())
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks SET status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;
        Ok(())
    }

    async fn reschedule_task(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks
                 SET status = 'queued', next_run_at = ?1,
                     last_error = COALESCE(?2, last_error), updated_at = ?3
                 WHERE id = ?4",
                params![
                    ts(next_run_at),
                    error.map(str::to_string),
                    ts(Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_task: {e}")))?;
        Ok(())
    }

    async fn record_start_failure(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<u32, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks
                 SET status = 'queued', next_run_at = ?1, last_error = ?2,
                     start_failures = start_failures + 1, updated_at = ?3
                 WHERE id = ?4",
                params![ts(next_run_at), error, ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_start_failure: {e}")))?;

        let task = self.get_task(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "delivery_task".to_string(),
            id: id.to_string(),
        })?;
        Ok(task.start_failures)
    }

    async fn clear_start_failures(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE delivery_tasks SET start_failures = 0 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_start_failures: {e}")))?;
        Ok(())
    }

    async fn requeue_stale(&self) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE delivery_tasks SET status = 'queued', updated_at = ?1
                 WHERE status = 'running'",
                params![ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_stale: {e}")))?;
        Ok(usize::try_from(affected).unwrap_or(usize::MAX))
    }

    async fn step_outcomes(&self, task_id: Uuid) -> Result<Vec<StepOutcome>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT step, state, attempts, detail, updated_at
                 FROM delivery_step_outcomes WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("step_outcomes: {e}")))?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("step_outcomes: {e}")))?
        {
            if let Some(outcome) = row_to_outcome(&row)? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    async fn record_outcome(
        &self,
        task_id: Uuid,
        outcome: &StepOutcome,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO delivery_step_outcomes (task_id, step, state, attempts, detail, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(task_id, step) DO UPDATE SET
                    state = excluded.state,
                    attempts = excluded.attempts,
                    detail = excluded.detail,
                    updated_at = excluded.updated_at",
                params![
                    task_id.to_string(),
                    outcome.step.as_str(),
                    outcome.state.as_str(),
                    i64::from(outcome.attempts),
                    outcome.detail.clone(),
                    ts(outcome.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_outcome: {e}")))?;
        Ok(())
    }
}
