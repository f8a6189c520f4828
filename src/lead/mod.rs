//! Captured leads and their submission.

pub mod model;
pub mod submission;

pub use model::{Attribution, DeliveryFlags, LeadProfile, LeadRecord};
pub use submission::{LeadDraft, LeadSubmission, LeadSubmitter};
