//! Delivery task and per-step outcome types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named delivery steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStep {
    #[serde(rename = "deliver-webhook")]
    DeliverWebhook,
    #[serde(rename = "send-notification")]
    SendNotification,
    #[serde(rename = "update-status")]
    UpdateStatus,
}

impl DeliveryStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeliverWebhook => "deliver-webhook",
            Self::SendNotification => "send-notification",
            Self::UpdateStatus => "update-status",
        }
    }
}

impl fmt::Display for DeliveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deliver-webhook" => Ok(Self::DeliverWebhook),
            "send-notification" => Ok(Self::SendNotification),
            "update-status" => Ok(Self::UpdateStatus),
            other => Err(format!("unknown delivery step '{other}'")),
        }
    }
}

/// Lifecycle of a queued delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `next_run_at`.
    Queued,
    /// Claimed by a worker.
    Running,
    Completed,
    /// Gave up without finishing every step (e.g. the lead vanished).
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// One delivery run for one lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub status: TaskStatus,
    /// Number of times a worker has claimed this task.
    pub run_count: u32,
    /// Consecutive runs that could not load the lead or its outcomes.
    /// Cleared by any run that gets as far as the steps.
    pub start_failures: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Memoized state of one step of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Succeeded,
    /// Channel not configured.
    Skipped,
    /// Failed, will be retried on the next run.
    Failed,
    /// Failed on its last allowed attempt; never retried.
    PermanentlyFailed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            other => Err(format!("unknown step state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: DeliveryStep,
    pub state: StepState,
    pub attempts: u32,
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StepOutcome {
    pub fn new(step: DeliveryStep, state: StepState, attempts: u32) -> Self {
        Self {
            step,
            state,
            attempts,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Settled steps are never executed again for the same task.
    pub fn is_settled(&self) -> bool {
        !matches!(self.state, StepState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_are_stable() {
        for step in [
            DeliveryStep::DeliverWebhook,
            DeliveryStep::SendNotification,
            DeliveryStep::UpdateStatus,
        ] {
            assert_eq!(step.as_str().parse::<DeliveryStep>().unwrap(), step);
            assert_eq!(
                serde_json::to_string(&step).unwrap(),
                format!("\"{}\"", step.as_str())
            );
        }
    }

    #[test]
    fn only_retryable_failure_is_unsettled() {
        let step = DeliveryStep::DeliverWebhook;
        assert!(StepOutcome::new(step, StepState::Succeeded, 1).is_settled());
        assert!(StepOutcome::new(step, StepState::Skipped, 0).is_settled());
        assert!(StepOutcome::new(step, StepState::PermanentlyFailed, 3).is_settled());
        assert!(!StepOutcome::new(step, StepState::Failed, 1).is_settled());
    }
}
