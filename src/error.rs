//! Error types for the lead funnel.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Funnel error: {0}")]
    Funnel(#[from] FunnelError),

    #[error("Quote lookup error: {0}")]
    Quote(#[from] QuoteError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Lead error: {0}")]
    Lead(#[from] LeadError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Step-graph and session driver faults.
///
/// Everything here is a configuration problem or a caller mistake. User input
/// problems never surface as `FunnelError`; they become transcript messages.
#[derive(Debug, thiserror::Error)]
pub enum FunnelError {
    #[error("Step graph has no entry step '{0}'")]
    MissingEntry(String),

    #[error("Step '{from}' points at unknown step '{to}'")]
    DanglingEdge { from: String, to: String },

    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("Single-choice step '{0}' has no options")]
    EmptyOptions(String),

    #[error("Verification step '{step}' references unknown contact step '{contact}'")]
    UnknownContactStep { step: String, contact: String },

    #[error("Steps {0:?} form a cycle that never waits for input")]
    InputlessCycle(Vec<String>),

    #[error("Advance from '{start}' exceeded {limit} hops without reaching input or done")]
    HopLimitExceeded { start: String, limit: usize },

    #[error("Session {0} not found")]
    SessionNotFound(Uuid),
}

/// Quote lookup failures. Always degraded to a fallback message.
#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    #[error("Profile is incomplete: missing or invalid '{0}'")]
    IncompleteProfile(String),

    #[error("Quote request failed: {0}")]
    Transport(String),

    #[error("Quote service returned status {0}")]
    Status(u16),

    #[error("Quote lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid quote response: {0}")]
    InvalidResponse(String),
}

/// Verification service failures.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("No contact on record for step '{0}'")]
    MissingContact(String),

    #[error("Verification request failed: {0}")]
    Transport(String),

    #[error("Verification service returned status {0}")]
    Status(u16),

    #[error("Invalid verification response: {0}")]
    InvalidResponse(String),

    #[error("Verification request timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures projecting answers into a lead record.
#[derive(Debug, thiserror::Error)]
pub enum LeadError {
    #[error("Missing answer '{0}'")]
    MissingAnswer(String),

    #[error("Invalid value for '{field}': {value}")]
    InvalidAnswer { field: String, value: String },
}

/// Delivery step failures.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Webhook request failed: {0}")]
    WebhookTransport(String),

    #[error("Webhook failed: {status} {reason}")]
    WebhookStatus { status: u16, reason: String },

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Status update failed: {0}")]
    StatusUpdate(String),

    #[error("Step {step} timed out after {after:?}")]
    StepTimeout { step: &'static str, after: Duration },

    #[error("Lead {0} missing for delivery")]
    LeadMissing(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
