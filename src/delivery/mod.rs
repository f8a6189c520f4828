//! Lead delivery pipeline: durable, per-step memoized, independently retried.

pub mod notify;
pub mod runner;
pub mod task;
pub mod webhook;
pub mod worker;

pub use notify::{EmailNotifier, Notifier};
pub use runner::{DeliveryRunner, LeadLocks, RunReport};
pub use task::{DeliveryStep, DeliveryTask, StepOutcome, StepState, TaskStatus};
pub use webhook::{HttpWebhook, Webhook};
pub use worker::{drain_once, spawn_delivery_worker};
