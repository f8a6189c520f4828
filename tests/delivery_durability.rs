//! Delivery durability across process restarts.
//!
//! Each test opens a file-backed store in a temp dir, drops it to simulate a
//! crash or restart, and reopens the same file.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use lead_funnel::config::DeliveryConfig;
use lead_funnel::delivery::{
    DeliveryRunner, DeliveryStep, Notifier, RunReport, StepState, TaskStatus, Webhook,
};
use lead_funnel::error::DeliveryError;
use lead_funnel::funnel::AnswerStore;
use lead_funnel::lead::model::{ChannelStatus, LeadStatus};
use lead_funnel::lead::{Attribution, LeadDraft, LeadRecord, LeadSubmission, LeadSubmitter};
use lead_funnel::store::{DeliveryQueue, LeadStore, LibSqlBackend};

#[derive(Default)]
struct CountingWebhook {
    calls: AtomicU32,
}

#[async_trait]
impl Webhook for CountingWebhook {
    async fn deliver(&self, _lead: &LeadRecord) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails every call while `failing` is set.
struct FlakyNotifier {
    failing: bool,
    calls: AtomicU32,
}

#[async_trait]
impl Notifier for FlakyNotifier {
    async fn notify(&self, _lead: &LeadRecord) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            Err(DeliveryError::Notification("smtp unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

fn draft() -> LeadDraft {
    LeadDraft {
        session_id: uuid::Uuid::new_v4(),
        answers: AnswerStore::from_pairs([
            ("for_whom", "self"),
            ("gender", "male"),
            ("smoker", "former"),
            ("health", "standard_plus"),
            ("coverage", "1000000"),
            ("timing", "within_month"),
            ("name", "Casey"),
            ("email", "casey@example.com"),
            ("phone", "5557778888"),
            ("phone_verify", "verified"),
            ("zip", "94110"),
            ("age", "47"),
            ("term", "25"),
            ("consent", "true"),
        ]),
        attribution: Attribution {
            utm_source: Some("newsletter".to_string()),
            ..Attribution::default()
        },
        quotes: Vec::new(),
    }
}

async fn open(dir: &TempDir) -> Arc<LibSqlBackend> {
    Arc::new(
        LibSqlBackend::new_local(&dir.path().join("leads.db"))
            .await
            .unwrap(),
    )
}

fn runner(
    db: &Arc<LibSqlBackend>,
    webhook: Arc<CountingWebhook>,
    notifier: Arc<FlakyNotifier>,
) -> DeliveryRunner {
    DeliveryRunner::new(
        db.clone(),
        db.clone(),
        Some(webhook),
        Some(notifier),
        DeliveryConfig::default(),
    )
}

#[tokio::test]
async fn submitted_lead_survives_restart() {
    let dir = TempDir::new().unwrap();
    let lead_id = {
        let db = open(&dir).await;
        let submission = LeadSubmission::new(db.clone(), db.clone());
        submission.submit(&draft()).await.unwrap()
    };

    let db = open(&dir).await;
    let lead = db.get(lead_id).await.unwrap().expect("lead persisted");
    assert_eq!(lead.profile.first_name, "Casey");
    assert_eq!(lead.profile.term_length, 25);
    assert_eq!(lead.profile.attribution.utm_source.as_deref(), Some("newsletter"));
    assert!(lead.phone_verified);

    let task = db.task_for_lead(lead_id).await.unwrap().expect("task persisted");
    assert_eq!(task.status, TaskStatus::Queued);
}

#[tokio::test]
async fn restart_mid_delivery_never_repeats_webhook() {
    let dir = TempDir::new().unwrap();
    let webhook = Arc::new(CountingWebhook::default());

    let (lead_id, task_id) = {
        let db = open(&dir).await;
        let lead_id = LeadSubmission::new(db.clone(), db.clone())
            .submit(&draft())
            .await
            .unwrap();

        let notifier = Arc::new(FlakyNotifier {
            failing: true,
            calls: AtomicU32::new(0),
        });
        let runner = runner(&db, webhook.clone(), notifier);
        let task = db.claim_due(Utc::now(), 1).await.unwrap().remove(0);
        let report = runner.run(&task).await.unwrap();
        assert!(matches!(
            report,
            RunReport::Rescheduled {
                step: DeliveryStep::SendNotification,
                attempt: 1,
                ..
            }
        ));
        (lead_id, task.id)
    };
    assert_eq!(webhook.calls.load(Ordering::SeqCst), 1);

    // New process: the webhook outcome is remembered.
    let db = open(&dir).await;
    let outcomes = db.step_outcomes(task_id).await.unwrap();
    let webhook_outcome = outcomes
        .iter()
        .find(|o| o.step == DeliveryStep::DeliverWebhook)
        .unwrap();
    assert_eq!(webhook_outcome.state, StepState::Succeeded);

    let notifier = Arc::new(FlakyNotifier {
        failing: false,
        calls: AtomicU32::new(0),
    });
    let runner = runner(&db, webhook.clone(), notifier.clone());
    let task = db
        .claim_due(Utc::now() + ChronoDuration::hours(1), 1)
        .await
        .unwrap()
        .remove(0);
    let report = runner.run(&task).await.unwrap();
    assert!(matches!(report, RunReport::Completed { .. }));

    assert_eq!(webhook.calls.load(Ordering::SeqCst), 1);
    assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

    let lead = db.get(lead_id).await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Delivered);
    assert_eq!(lead.delivery.webhook, ChannelStatus::Delivered);
    assert_eq!(lead.delivery.notification, ChannelStatus::Delivered);
    assert_eq!(db.get_task(task_id).await.unwrap().unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn crash_while_running_is_requeued() {
    let dir = TempDir::new().unwrap();
    let task_id = {
        let db = open(&dir).await;
        let lead_id = LeadSubmission::new(db.clone(), db.clone())
            .submit(&draft())
            .await
            .unwrap();
        let claimed = db.claim_due(Utc::now(), 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].lead_id, lead_id);
        claimed[0].id
    };

    let db = open(&dir).await;
    assert_eq!(db.get_task(task_id).await.unwrap().unwrap().status, TaskStatus::Running);
    assert_eq!(db.requeue_stale().await.unwrap(), 1);
    assert_eq!(db.get_task(task_id).await.unwrap().unwrap().status, TaskStatus::Queued);
    assert_eq!(db.claim_due(Utc::now(), 1).await.unwrap().len(), 1);
}
