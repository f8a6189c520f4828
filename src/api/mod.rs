//! HTTP and WebSocket surface for funnel sessions and lead ingest.

pub mod leads;
pub mod sessions;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use crate::config::FunnelTiming;
use crate::funnel::{FunnelDeps, StepGraph};
use crate::lead::LeadSubmission;
use crate::store::{DeliveryQueue, LeadStore};

pub use sessions::{SessionHandle, SessionRegistry, spawn_session_expiry};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub graph: Arc<StepGraph>,
    pub deps: FunnelDeps,
    pub timing: FunnelTiming,
    pub sessions: Arc<SessionRegistry>,
    pub leads: Arc<dyn LeadStore>,
    pub queue: Arc<dyn DeliveryQueue>,
    /// Direct ingest path; sessions submit through `deps.submitter`.
    pub submission: Arc<LeadSubmission>,
}

/// Build the Axum router with session, lead and health routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(sessions::create_session))
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session).delete(sessions::abandon_session),
        )
        .route("/api/sessions/{id}/answers", post(sessions::submit_answer))
        .route("/api/sessions/{id}/resend", post(sessions::resend_code))
        .route("/api/sessions/{id}/change-channel", post(sessions::change_channel))
        .route("/api/sessions/{id}/ws", get(sessions::ws_handler))
        .route("/api/leads", post(leads::create_lead))
        .route("/api/leads/{id}", get(leads::get_lead))
        .route("/api/leads/{id}/delivery", get(leads::get_delivery))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lead-funnel"
    }))
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

/// First address in `x-forwarded-for`, else `x-real-ip`.
pub(crate) fn client_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    header("x-forwarded-for").or_else(|| header("x-real-ip"))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.9"));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn client_ip_absent() {
        assert!(client_ip(&HeaderMap::new()).is_none());
    }
}
