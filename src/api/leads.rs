//! Direct lead ingest and lookup.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{AppState, client_ip, error_response};
use crate::lead::{LeadProfile, LeadRecord};

/// Accept a structured lead, store it and queue delivery. Delivery runs on
/// the worker; the response only waits for the durable write.
pub(super) async fn create_lead(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut profile): Json<LeadProfile>,
) -> Response {
    if profile.attribution.ip_address.is_none() {
        profile.attribution.ip_address = client_ip(&headers);
    }
    if let Err(e) = profile.validate() {
        debug!(error = %e, "Rejected lead");
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let lead = LeadRecord::from_profile(profile);
    match state.submission.capture(&lead).await {
        Ok(lead_id) => {
            info!(lead_id = %lead_id, "Lead ingested");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({"success": true, "leadId": lead_id})),
            )
                .into_response()
        }
        Err(e) => {
            error!(lead_id = %lead.id, error = %e, "Lead ingest failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save lead")
        }
    }
}

fn parse_lead_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid lead ID"))
}

pub(super) async fn get_lead(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let lead_id = match parse_lead_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.leads.get(lead_id).await {
        Ok(Some(lead)) => Json(lead).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Lead not found"),
        Err(e) => {
            error!(lead_id = %lead_id, error = %e, "Failed to load lead");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load lead")
        }
    }
}

/// Delivery task and per-step outcomes for a lead.
pub(super) async fn get_delivery(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let lead_id = match parse_lead_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let task = match state.queue.task_for_lead(lead_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "No delivery task for lead"),
        Err(e) => {
            error!(lead_id = %lead_id, error = %e, "Failed to load delivery task");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load delivery");
        }
    };
    match state.queue.step_outcomes(task.id).await {
        Ok(steps) => Json(serde_json::json!({"task": task, "steps": steps})).into_response(),
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Failed to load step outcomes");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load delivery")
        }
    }
}
