//! Background worker that drains the delivery queue.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::runner::{DeliveryRunner, RunReport};
use super::task::DeliveryTask;

/// Tasks claimed per poll.
const BATCH_SIZE: usize = 16;

/// Spawn the delivery worker.
///
/// On start it returns tasks a crashed process left `running` to the queue.
/// It then polls every `poll_interval` until `shutdown` flips to `true`.
pub fn spawn_delivery_worker(
    runner: Arc<DeliveryRunner>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match runner.queue().requeue_stale().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Re-queued delivery tasks left running"),
            Err(e) => error!(error = %e, "Failed to re-queue stale delivery tasks"),
        }

        let mut interval = tokio::time::interval(runner.config().poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    drain_once(&runner).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Delivery worker shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Claim and run every due task once. Returns how many were claimed.
pub async fn drain_once(runner: &DeliveryRunner) -> usize {
    let tasks = match runner.queue().claim_due(Utc::now(), BATCH_SIZE).await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!(error = %e, "Failed to claim delivery tasks");
            return 0;
        }
    };

    let claimed = tasks.len();
    for task in tasks {
        run_task(runner, &task).await;
    }
    claimed
}

async fn run_task(runner: &DeliveryRunner, task: &DeliveryTask) {
    let queue = runner.queue();
    let result = match runner.run(task).await {
        Ok(RunReport::Completed { .. } | RunReport::Rescheduled { .. }) => Ok(()),
        Ok(RunReport::Busy) => {
            let retry_at = Utc::now()
                + chrono::Duration::from_std(runner.config().poll_interval)
                    .unwrap_or_else(|_| chrono::Duration::seconds(5));
            queue.reschedule_task(task.id, retry_at, None).await
        }
        // Only consecutive start failures count here; step retries and
        // busy put-backs have their own budget.
        Err(e) if task.start_failures + 1 >= runner.config().max_attempts => {
            error!(task_id = %task.id, lead_id = %task.lead_id, error = %e, "Delivery task abandoned");
            queue.fail_task(task.id, &e.to_string()).await
        }
        Err(e) => {
            let failures = task.start_failures + 1;
            warn!(
                task_id = %task.id,
                lead_id = %task.lead_id,
                failures,
                error = %e,
                "Delivery run failed to start"
            );
            let delay = chrono::Duration::from_std(runner.config().backoff(failures))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            queue
                .record_start_failure(task.id, Utc::now() + delay, &e.to_string())
                .await
                .map(|_| ())
        }
    };

    if let Err(e) = result {
        error!(task_id = %task.id, error = %e, "Failed to update delivery task state");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::config::DeliveryConfig;
    use crate::delivery::task::{DeliveryStep, StepState, TaskStatus};
    use crate::delivery::{Notifier, Webhook};
    use crate::error::{DatabaseError, DeliveryError};
    use crate::funnel::AnswerStore;
    use crate::lead::model::{Attribution, ChannelStatus, DeliveryFlags, LeadRecord, LeadStatus};
    use crate::store::{DeliveryQueue, LeadStore, LibSqlBackend};

    /// Lead store whose next `get` fails once when armed.
    struct FlakyLeads {
        inner: Arc<LibSqlBackend>,
        fail_next_get: AtomicBool,
    }

    #[async_trait]
    impl LeadStore for FlakyLeads {
        async fn create(&self, lead: &LeadRecord) -> Result<Uuid, DatabaseError> {
            self.inner.create(lead).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<LeadRecord>, DatabaseError> {
            if self.fail_next_get.swap(false, Ordering::SeqCst) {
                return Err(DatabaseError::Query("database is locked".to_string()));
            }
            self.inner.get(id).await
        }

        async fn update_delivery(&self, id: Uuid, flags: &DeliveryFlags) -> Result<(), DatabaseError> {
            self.inner.update_delivery(id, flags).await
        }
    }

    struct DeadWebhook;

    #[async_trait]
    impl Webhook for DeadWebhook {
        async fn deliver(&self, _lead: &LeadRecord) -> Result<(), DeliveryError> {
            Err(DeliveryError::WebhookStatus {
                status: 502,
                reason: "Bad Gateway".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _lead: &LeadRecord) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn lead() -> LeadRecord {
        let answers = AnswerStore::from_pairs([
            ("gender", "female"),
            ("smoker", "never"),
            ("health", "standard"),
            ("coverage", "250000"),
            ("name", "Morgan"),
            ("email", "morgan@example.com"),
            ("phone", "5553334444"),
            ("zip", "02110"),
            ("age", "58"),
            ("term", "15"),
            ("consent", "true"),
        ]);
        LeadRecord::from_answers(&answers, Attribution::default(), Vec::new()).unwrap()
    }

    /// Claim the task regardless of its scheduled time.
    async fn claim_any(db: &LibSqlBackend) -> DeliveryTask {
        db.claim_due(Utc::now() + chrono::Duration::days(1), 1)
            .await
            .unwrap()
            .remove(0)
    }

    fn runner(db: &Arc<LibSqlBackend>, config: DeliveryConfig) -> Arc<DeliveryRunner> {
        Arc::new(DeliveryRunner::new(db.clone(), db.clone(), None, None, config))
    }

    #[tokio::test]
    async fn drain_runs_due_tasks() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = lead();
        db.create(&lead).await.unwrap();
        let task = db.enqueue(lead.id).await.unwrap();

        let runner = runner(&db, DeliveryConfig::default());
        assert_eq!(drain_once(&runner).await, 1);

        let task = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(db.get(lead.id).await.unwrap().unwrap().status, LeadStatus::Delivered);
        assert_eq!(drain_once(&runner).await, 0);
    }

    #[tokio::test]
    async fn orphaned_task_fails_after_max_attempts() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        // Queue a task whose lead was never stored.
        let task = db.enqueue(uuid::Uuid::new_v4()).await.unwrap();
        let config = DeliveryConfig {
            max_attempts: 1,
            ..DeliveryConfig::default()
        };
        let runner = runner(&db, config);

        drain_once(&runner).await;
        let task = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn start_failure_after_step_retries_does_not_drop_channels() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = lead();
        db.create(&lead).await.unwrap();
        let task = db.enqueue(lead.id).await.unwrap();

        let leads = Arc::new(FlakyLeads {
            inner: db.clone(),
            fail_next_get: AtomicBool::new(false),
        });
        let notifier = Arc::new(CountingNotifier::default());
        let runner = DeliveryRunner::new(
            leads.clone(),
            db.clone(),
            Some(Arc::new(DeadWebhook)),
            Some(notifier.clone()),
            DeliveryConfig::default(),
        );

        // Two webhook attempts, each rescheduled.
        run_task(&runner, &claim_any(&db).await).await;
        run_task(&runner, &claim_any(&db).await).await;

        // Third claim cannot read the lead.
        leads.fail_next_get.store(true, Ordering::SeqCst);
        run_task(&runner, &claim_any(&db).await).await;
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.run_count, 3);
        assert_eq!(stored.start_failures, 1);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);

        // Fourth claim uses the webhook's last attempt and moves on.
        run_task(&runner, &claim_any(&db).await).await;
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.start_failures, 0);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        let webhook = db
            .step_outcomes(task.id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.step == DeliveryStep::DeliverWebhook)
            .unwrap();
        assert_eq!(webhook.state, StepState::PermanentlyFailed);
        assert_eq!(webhook.attempts, 3);

        let stored = db.get(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.delivery.webhook, ChannelStatus::Failed);
        assert_eq!(stored.delivery.notification, ChannelStatus::Delivered);
        assert_eq!(stored.status, LeadStatus::DeliveryFailed);
    }

    #[tokio::test]
    async fn busy_put_backs_do_not_count_as_start_failures() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = lead();
        db.create(&lead).await.unwrap();
        let task = db.enqueue(lead.id).await.unwrap();
        let config = DeliveryConfig {
            max_attempts: 1,
            poll_interval: Duration::from_millis(1),
            ..DeliveryConfig::default()
        };
        let runner = runner(&db, config);

        {
            let _held = runner.locks().try_acquire(lead.id).unwrap();
            for _ in 0..3 {
                run_task(&runner, &claim_any(&db).await).await;
            }
        }
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.start_failures, 0);

        run_task(&runner, &claim_any(&db).await).await;
        assert_eq!(
            db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn worker_recovers_stale_tasks_and_stops_on_shutdown() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = lead();
        db.create(&lead).await.unwrap();
        let task = db.enqueue(lead.id).await.unwrap();
        // Simulate a crash mid-run.
        db.claim_due(Utc::now(), 1).await.unwrap();

        let config = DeliveryConfig {
            poll_interval: Duration::from_millis(20),
            ..DeliveryConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        let handle = spawn_delivery_worker(runner(&db, config), rx);

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let t = db.get_task(task.id).await.unwrap().unwrap();
                if t.status == TaskStatus::Completed {
                    return t;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task should complete");
        assert_eq!(completed.run_count, 2);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
